//! The `Bone` section: per-frame dual quaternions of every bone.

use std::collections::BTreeMap;

use rootcause::prelude::*;
use tracing::info;

use super::{BinaryBuffer, FormatError, TAG_BONES, buffer::len_u32};
use crate::math::DualQuat;
use crate::scene::{Frame, ObjectId, ObjectKind, SceneSource};

/// Global bone indices, keyed by armature object and bone name.
#[derive(Debug, Clone, Default)]
pub struct BoneLookup {
    indices: BTreeMap<(ObjectId, String), u32>,
}

impl BoneLookup {
    pub fn get(&self, armature: ObjectId, bone: &str) -> Option<u32> {
        self.indices.get(&(armature, bone.to_string())).copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Write the `Bone` section and return the lookup used for skin weights.
///
/// Without armatures, or with animation export off, the header is still
/// written with zero bones and zero keyframes.
pub fn write_animation(
    buf: &mut BinaryBuffer,
    scene: &dyn SceneSource,
    frames: &[Frame],
    export_animation: bool,
) -> Result<BoneLookup, Report<FormatError>> {
    buf.put_tag(TAG_BONES);
    let end = buf.reserve_u64();

    let armatures: Vec<(ObjectId, usize)> = scene
        .object_ids()
        .filter_map(|id| match &scene.object(id)?.kind {
            ObjectKind::Armature(arm) => Some((id, arm.bones.len())),
            _ => None,
        })
        .collect();

    let mut lookup = BoneLookup::default();
    if armatures.is_empty() || !export_animation {
        buf.put_u32(0);
        buf.put_u32(0);
        buf.patch_here(end);
        return Ok(lookup);
    }

    info!("exporting skeleton animation data");
    for &(id, _) in &armatures {
        let Some(ObjectKind::Armature(arm)) = scene.object(id).map(|o| &o.kind) else {
            continue;
        };
        for bone in &arm.bones {
            let next = len_u32("bone count", lookup.len())?;
            lookup.indices.entry((id, bone.name.clone())).or_insert(next);
        }
    }
    buf.put_u32(len_u32("bone count", lookup.len())?);
    buf.put_u32(len_u32("keyframe count", frames.len())?);

    for &frame in frames {
        for &(id, bones) in &armatures {
            for bone in 0..bones {
                let pose = scene
                    .bone_pose(id, bone, frame)
                    .context(FormatError::Scene)?;
                let relative = pose.pose * pose.rest.inverse();
                for c in DualQuat::from_transform(&relative).to_components() {
                    buf.put_f32(c);
                }
            }
        }
    }
    buf.patch_here(end);
    Ok(lookup)
}
