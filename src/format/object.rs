//! The `Objs` and `Inst` sections.
//!
//! Objects are deduplicated by the data they draw: every instance of one
//! mesh datablock, or of one LOD chain, shares a single object record.

use std::collections::{BTreeMap, BTreeSet};

use glam::{Mat4, Quat, Vec3};
use itertools::Itertools;
use rootcause::prelude::*;
use tracing::{debug, info};

use super::animation::BoneLookup;
use super::geometry::{self, EncodeOptions, PreparedMesh, SkinBinding};
use super::{
    BinaryBuffer, FLAG_COMPRESSED_NORMALS, FLAG_DEFLATE, FormatError, NO_INDEX,
    OBJECT_FLAG_EMISSIVE, STATIC_KEYFRAME, TAG_INSTANCES, TAG_OBJECT, TAG_OBJECTS,
    buffer::len_u32,
};
use crate::error::Diagnostics;
use crate::material::MaterialTable;
use crate::math::{Aabb, instance_rows};
use crate::scene::{FluidRole, Frame, MeshId, Object, ObjectId, ObjectKind, SceneSource};

#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectOptions {
    pub selection_only: bool,
    pub deflate: bool,
    pub compress_normals: bool,
    pub triangulate: bool,
    pub export_animation: bool,
}

/// Identity of the data an object record is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DedupKey {
    Mesh(MeshId),
    /// A LOD chain, keyed by its lowest object id.
    Chain(ObjectId),
    /// A perfect sphere without mesh data.
    Object(ObjectId),
}

/// True for objects that become instances in the binary: live meshes with
/// faces, LOD chain instances and perfect spheres.
///
/// A mesh that carries both geometry and a LOD link is a level of some
/// chain and is only reachable through that chain.
pub fn is_instance(object: &Object) -> bool {
    if object.users == 0 {
        return false;
    }
    match &object.kind {
        ObjectKind::Mesh(mesh) => match object.lod {
            Some(_) => mesh.faces == 0,
            None => mesh.faces > 0 || object.perfect_sphere,
        },
        _ => object.perfect_sphere,
    }
}

/// Instances whose transform is sampled per frame. Rigged meshes are
/// animated through their skin weights instead.
pub fn is_animated(object: &Object) -> bool {
    object.has_constraints || (object.has_animation_data && !object.has_armature_modifier())
}

fn bone_shapes(scene: &dyn SceneSource) -> BTreeSet<ObjectId> {
    scene
        .objects()
        .iter()
        .filter_map(|o| o.kind.armature_ref())
        .flat_map(|arm| arm.bones.iter().filter_map(|b| b.custom_shape))
        .collect()
}

/// Objects exported through instances, and deforming objects exported as
/// one snapshot per frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSet {
    pub instances: Vec<ObjectId>,
    pub deforming: Vec<ObjectId>,
}

/// Select the exportable objects of `scene`, in scene order.
pub fn collect_objects(scene: &dyn SceneSource, options: &ObjectOptions) -> ExportSet {
    let shapes = bone_shapes(scene);
    let mut set = ExportSet::default();
    for id in scene.object_ids() {
        let Some(object) = scene.object(id) else {
            continue;
        };
        if !is_instance(object) || shapes.contains(&id) {
            continue;
        }
        if options.selection_only && !object.selected {
            continue;
        }
        if options.export_animation && object.kind.is_mesh() {
            match object.fluid_role() {
                Some(FluidRole::Domain) => {
                    set.deforming.push(id);
                    continue;
                }
                Some(FluidRole::Fluid) => continue,
                None if object.has_cloth() => {
                    set.deforming.push(id);
                    continue;
                }
                _ => {}
            }
        }
        set.instances.push(id);
    }
    set
}

/// The levels written for one object record, already in output order.
#[derive(Debug, Clone, PartialEq)]
pub struct LodChain {
    pub key: DedupKey,
    pub levels: Vec<ObjectId>,
}

/// Resolve the LOD chain an instance refers to.
///
/// The chain is followed from the instance's link until it returns to a
/// level already visited. Output starts at the level after the one with the
/// largest switch distance. A level without a successor drops the chain,
/// and the instance is then written on its own.
pub fn resolve_lods(
    scene: &dyn SceneSource,
    id: ObjectId,
    diagnostics: &mut Diagnostics,
) -> Option<LodChain> {
    let object = scene.object(id)?;
    let own = || LodChain {
        key: match &object.kind {
            ObjectKind::Mesh(mesh) => DedupKey::Mesh(mesh.id),
            _ => DedupKey::Object(id),
        },
        levels: vec![id],
    };
    let Some(link) = object.lod else {
        return Some(own());
    };

    let mut levels: Vec<ObjectId> = Vec::new();
    let mut start = 0;
    let mut max_distance = f32::NEG_INFINITY;
    let mut current = link.next;
    while !levels.contains(&current) {
        levels.push(current);
        let Some(next) = scene.object(current).and_then(|o| o.lod) else {
            let level = scene.object(current).map_or("?", |o| o.name.as_str());
            diagnostics.warn(
                &object.name,
                format!("skipped LOD levels because LOD object '{level}' has no successor"),
            );
            return Some(own());
        };
        if next.distance > max_distance {
            max_distance = next.distance;
            start = levels.len() - 1;
        }
        current = next.next;
    }
    let n = levels.len();
    let ordered = (0..n).map(|j| levels[(start + j + 1) % n]).collect();
    let key = levels.iter().copied().min().map_or(DedupKey::Object(id), DedupKey::Chain);
    Some(LodChain {
        key,
        levels: ordered,
    })
}

/// Rebuild a sphere's transform from translation and uniform scale only.
fn sphere_transform(world: Mat4, name: &str, diagnostics: &mut Diagnostics) -> Mat4 {
    let (scale, rotation, translation) = world.to_scale_rotation_translation();
    if !rotation.abs_diff_eq(Quat::IDENTITY, 1e-6) {
        diagnostics.warn(name, "perfect sphere has a rotation which will be ignored");
    }
    if (scale.x - scale.y).abs() > 1e-6 || (scale.x - scale.z).abs() > 1e-6 {
        diagnostics.warn(
            name,
            "perfect sphere has a non-uniform scaling which will be ignored (using x-scale as uniform scale)",
        );
    }
    Mat4::from_translation(translation) * Mat4::from_scale(Vec3::splat(scale.x))
}

fn keyframe(frame: Frame) -> Result<u32, Report<FormatError>> {
    u32::try_from(frame).map_err(|_| Report::new(FormatError::NegativeFrame(frame)))
}

enum Level<'s> {
    Mesh {
        object: &'s Object,
        mesh: PreparedMesh,
    },
    Sphere {
        object: &'s Object,
        bounds: Aabb,
    },
}

enum Record {
    Shared { chain: LodChain, name: String },
    Snapshot { object: ObjectId, frame_index: usize },
}

/// Everything the object writer reads.
pub struct ObjectWriter<'a> {
    pub scene: &'a dyn SceneSource,
    pub materials: &'a MaterialTable,
    pub bones: &'a BoneLookup,
    /// Exported frames, ascending.
    pub frames: &'a [Frame],
    /// Frame static data is sampled at.
    pub current_frame: Frame,
    pub options: ObjectOptions,
    pub diagnostics: &'a mut Diagnostics,
}

impl<'a> ObjectWriter<'a> {
    /// Write the `Objs` section followed by the `Inst` section.
    pub fn write(mut self, buf: &mut BinaryBuffer) -> Result<(), Report<FormatError>> {
        let set = collect_objects(self.scene, &self.options);

        // Plan every record first; the jump table needs the count up front.
        let mut records = Vec::new();
        let mut object_index: BTreeMap<DedupKey, u32> = BTreeMap::new();
        let mut instance_index = Vec::with_capacity(set.instances.len());
        for &id in &set.instances {
            let Some(chain) = resolve_lods(self.scene, id, self.diagnostics) else {
                continue;
            };
            let index = match object_index.get(&chain.key) {
                Some(&index) => index,
                None => {
                    let index = len_u32("object count", records.len())?;
                    object_index.insert(chain.key, index);
                    let name = self.record_name(id);
                    records.push(Record::Shared { chain, name });
                    index
                }
            };
            instance_index.push((id, index));
        }
        let shared_count = len_u32("object count", records.len())?;
        for &object in &set.deforming {
            for frame_index in 0..self.frames.len() {
                records.push(Record::Snapshot {
                    object,
                    frame_index,
                });
            }
        }

        info!("exporting {} objects", records.len());
        buf.put_tag(TAG_OBJECTS);
        let instances_start = buf.reserve_u64();
        let mut flags = 0;
        if self.options.deflate {
            flags |= FLAG_DEFLATE;
        }
        if self.options.compress_normals {
            flags |= FLAG_COMPRESSED_NORMALS;
        }
        buf.put_u32(flags);
        buf.put_u32(len_u32("object count", records.len())?);
        let jumps: Vec<_> = records.iter().map(|_| buf.reserve_u64()).collect();

        for (index, (record, jump)) in records.iter().zip(jumps).enumerate() {
            buf.patch_here(jump);
            match record {
                Record::Shared { chain, name } => {
                    debug!("object '{name}'");
                    let rest_pose = self.options.export_animation;
                    self.write_record(
                        buf,
                        name,
                        &chain.levels,
                        self.current_frame,
                        rest_pose,
                        STATIC_KEYFRAME,
                        NO_INDEX,
                    )?;
                }
                Record::Snapshot {
                    object,
                    frame_index,
                } => {
                    let frame = self.frames[*frame_index];
                    let name = format!("{}__animated__frame_{frame}", self.record_name(*object));
                    debug!("animated object '{name}'");
                    let prev = if *frame_index == 0 {
                        NO_INDEX
                    } else {
                        len_u32("object index", index - 1)?
                    };
                    self.write_record(buf, &name, &[*object], frame, false, keyframe(frame)?, prev)?;
                }
            }
        }

        buf.patch_here(instances_start);
        self.write_instances(buf, &instance_index, &set.deforming, shared_count)
    }

    fn record_name(&self, id: ObjectId) -> String {
        match self.scene.object(id).map(|o| &o.kind) {
            Some(ObjectKind::Mesh(mesh)) => mesh.name.clone(),
            _ => self.scene.object(id).map_or_else(String::new, |o| o.name.clone()),
        }
    }

    /// Material index of every slot of `object`. Unassigned slots map to 0.
    fn slot_materials(&mut self, object: &Object) -> Vec<u16> {
        if object.material_slots.iter().all(Option::is_none) {
            self.diagnostics.warn(&object.name, "has no materials");
        }
        object
            .material_slots
            .iter()
            .map(|slot| {
                slot.and_then(|id| self.materials.index_of(id))
                    .unwrap_or(0)
            })
            .collect()
    }

    fn prepare_level(
        &mut self,
        id: ObjectId,
        frame: Frame,
        rest_pose: bool,
    ) -> Result<Level<'a>, Report<FormatError>> {
        let scene = self.scene;
        let object = scene
            .object(id)
            .ok_or_else(|| Report::new(FormatError::Object(format!("{id:?}"))))?;
        let context = || FormatError::Object(object.name.clone());
        if object.perfect_sphere {
            let bounds = match object.kind {
                ObjectKind::Mesh(_) => {
                    let mesh = scene.evaluated_mesh(id, frame, rest_pose).context(context())?;
                    Aabb::from_points(&mesh.positions)
                }
                _ => Aabb {
                    min: Vec3::NEG_ONE,
                    max: Vec3::ONE,
                },
            };
            return Ok(Level::Sphere { object, bounds });
        }
        let mesh = scene.evaluated_mesh(id, frame, rest_pose).context(context())?;
        let mesh = geometry::prepare(&mesh, self.options.triangulate).context(context())?;
        Ok(Level::Mesh { object, mesh })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_record(
        &mut self,
        buf: &mut BinaryBuffer,
        name: &str,
        level_ids: &[ObjectId],
        frame: Frame,
        rest_pose: bool,
        keyframe: u32,
        prev: u32,
    ) -> Result<(), Report<FormatError>> {
        let levels = level_ids
            .iter()
            .map(|&id| self.prepare_level(id, frame, rest_pose))
            .collect::<Result<Vec<_>, _>>()?;

        let mut bounds: Option<Aabb> = None;
        let mut slots = Vec::with_capacity(levels.len());
        let mut emissive = false;
        for level in &levels {
            let (object, level_bounds) = match level {
                Level::Mesh { object, mesh } => (*object, mesh.bounds()),
                Level::Sphere { object, bounds } => (*object, *bounds),
            };
            bounds = Some(bounds.map_or(level_bounds, |b| b.union(&level_bounds)));
            let materials = self.slot_materials(object);
            emissive |= match level {
                Level::Mesh { mesh, .. } => mesh
                    .triangles
                    .iter()
                    .map(|t| t.slot)
                    .chain(mesh.quads.iter().map(|q| q.slot))
                    .unique()
                    .any(|slot| {
                        let index = materials.get(usize::from(slot)).copied().unwrap_or(0);
                        self.materials.is_emissive(index)
                    }),
                Level::Sphere { .. } => self
                    .materials
                    .is_emissive(materials.first().copied().unwrap_or(0)),
            };
            slots.push(materials);
        }
        let bounds = bounds.unwrap_or(Aabb {
            min: Vec3::ZERO,
            max: Vec3::ZERO,
        });

        buf.put_tag(TAG_OBJECT);
        buf.put_string(name)?;
        buf.put_u32(if emissive { OBJECT_FLAG_EMISSIVE } else { 0 });
        buf.put_u32(keyframe);
        buf.put_u32(prev);
        buf.put_vec3(bounds.min);
        buf.put_vec3(bounds.max);
        buf.put_u32(len_u32("LOD count", levels.len())?);
        let jumps: Vec<_> = levels.iter().map(|_| buf.reserve_u64()).collect();

        let encode = EncodeOptions {
            deflate: self.options.deflate,
            compress_normals: self.options.compress_normals,
        };
        for ((level, materials), jump) in levels.iter().zip(&slots).zip(jumps) {
            buf.patch_here(jump);
            match level {
                Level::Mesh { object, mesh } => {
                    let skin = self.skin_binding(*object);
                    geometry::write_mesh_lod(
                        buf,
                        mesh,
                        materials,
                        skin,
                        encode,
                        self.diagnostics,
                        &object.name,
                    )?;
                }
                Level::Sphere { bounds, .. } => {
                    let material = materials.first().copied().unwrap_or(0);
                    geometry::write_sphere_lod(buf, bounds, material, self.options.deflate)?;
                }
            }
        }
        Ok(())
    }

    fn skin_binding(&self, object: &'a Object) -> Option<SkinBinding<'a>> {
        if !self.options.export_animation {
            return None;
        }
        let armature = object.parent?;
        self.scene.object(armature)?.kind.armature_ref()?;
        Some(SkinBinding {
            armature,
            groups: &object.vertex_groups,
            bones: self.bones,
        })
    }

    fn transform(&mut self, id: ObjectId, frame: Frame) -> Result<Mat4, Report<FormatError>> {
        let object = self
            .scene
            .object(id)
            .ok_or_else(|| Report::new(FormatError::Object(format!("{id:?}"))))?;
        let world = self
            .scene
            .world_matrix(id, frame)
            .context(FormatError::Object(object.name.clone()))?;
        Ok(if object.perfect_sphere {
            sphere_transform(world, &object.name, self.diagnostics)
        } else {
            world
        })
    }

    fn put_instance(
        &self,
        buf: &mut BinaryBuffer,
        name: &str,
        object: u32,
        keyframe: u32,
        world: &Mat4,
    ) -> Result<(), Report<FormatError>> {
        let rows = instance_rows(world)
            .ok_or_else(|| Report::new(FormatError::SingularTransform(name.to_string())))?;
        buf.put_string(name)?;
        buf.put_u32(object);
        buf.put_u32(keyframe);
        buf.put_u32(NO_INDEX);
        for c in rows.iter().flatten() {
            buf.put_f32(*c);
        }
        Ok(())
    }

    /// Static instances first, then per frame the transform-animated
    /// instances followed by the deforming snapshots.
    fn write_instances(
        &mut self,
        buf: &mut BinaryBuffer,
        instances: &[(ObjectId, u32)],
        deforming: &[ObjectId],
        shared_count: u32,
    ) -> Result<(), Report<FormatError>> {
        let scene = self.scene;
        let frames = self.frames;
        buf.put_tag(TAG_INSTANCES);
        let count = buf.reserve_u32();
        let mut written = 0usize;

        let mut animated = Vec::new();
        for &(id, index) in instances {
            let Some(object) = scene.object(id) else {
                continue;
            };
            if self.options.export_animation && is_animated(object) {
                let samples = frames
                    .iter()
                    .map(|&f| self.transform(id, f))
                    .collect::<Result<Vec<_>, _>>()?;
                if !samples.iter().all_equal() {
                    animated.push((id, index, samples));
                    continue;
                }
            }
            let world = self.transform(id, self.current_frame)?;
            self.put_instance(buf, &object.name, index, STATIC_KEYFRAME, &world)?;
            written += 1;
        }

        if !animated.is_empty() || !deforming.is_empty() {
            info!("exporting per-frame instances");
        }
        for (k, &frame) in frames.iter().enumerate() {
            if animated.is_empty() && deforming.is_empty() {
                break;
            }
            let key = keyframe(frame)?;
            for (id, index, samples) in &animated {
                let name = scene.object(*id).map_or("", |o| o.name.as_str());
                self.put_instance(buf, name, *index, key, &samples[k])?;
                written += 1;
            }
            for (i, &id) in deforming.iter().enumerate() {
                let world = self.transform(id, frame)?;
                let name = scene.object(id).map_or("", |o| o.name.as_str());
                let name = format!("{name}__animated__frame_{frame}");
                let index = len_u32(
                    "object index",
                    shared_count as usize + i * frames.len() + k,
                )?;
                self.put_instance(buf, &name, index, key, &world)?;
                written += 1;
            }
        }
        buf.patch(count, len_u32("instance count", written)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::reader::{LodData, read_mff};
    use crate::format::{animation::write_animation, materials::write_materials};
    use crate::material::{LambertParams, Material, MaterialNode, Texturable};
    use crate::format::ATTR_TYPE_SKIN_WEIGHTS;
    use crate::format::geometry::BONE_INDEX_MASK;
    use crate::scene::{
        Armature, Bone, LodLink, MaterialId, MemoryScene, Mesh, Modifier, VertexWeight,
    };

    fn lambert_table(scene: &MemoryScene) -> MaterialTable {
        let mut table = MaterialTable::default();
        for (i, m) in scene.materials.iter().enumerate() {
            let material = Material::new(
                m.name.clone(),
                MaterialNode::Lambert(LambertParams {
                    albedo: Texturable::Value([0.8; 3]),
                }),
            );
            table.push(MaterialId(i), m.name.clone(), Some(material)).unwrap();
        }
        table
    }

    fn export(scene: &MemoryScene, options: ObjectOptions) -> (Vec<u8>, Diagnostics) {
        let frames = scene.active().frames(options.export_animation);
        let table = lambert_table(scene);
        let mut diagnostics = Diagnostics::new();
        let mut buf = BinaryBuffer::new();
        write_materials(&mut buf, &table).unwrap();
        let bones = write_animation(&mut buf, scene, &frames, options.export_animation).unwrap();
        ObjectWriter {
            scene,
            materials: &table,
            bones: &bones,
            frames: &frames,
            current_frame: scene.active().frame_current,
            options,
            diagnostics: &mut diagnostics,
        }
        .write(&mut buf)
        .unwrap();
        (buf.finish(), diagnostics)
    }

    fn cube_scene() -> (MemoryScene, MaterialId) {
        let mut scene = MemoryScene::new("Scene");
        let material = scene.add_material(crate::test_support::plain_material("Wall"));
        (scene, material)
    }

    #[test]
    fn shared_meshes_are_written_once() {
        let (mut scene, material) = cube_scene();
        let mesh = scene.add_mesh(Mesh::cube(1.0));
        for i in 0..3 {
            let mut object = Object::new(
                format!("Cube.{i}"),
                ObjectKind::Mesh(scene.mesh_ref(mesh, "CubeMesh")),
            );
            object.material_slots = vec![Some(material)];
            scene.add_object(
                object,
                Mat4::from_translation(Vec3::new(i as f32 * 3.0, 0.0, 0.0)),
            );
        }
        let (bytes, _) = export(&scene, ObjectOptions::default());
        let file = read_mff(&bytes).unwrap();
        assert_eq!(file.objects.len(), 1);
        assert_eq!(file.objects[0].name, "CubeMesh");
        assert_eq!(file.objects[0].lods.len(), 1);
        assert_eq!(file.instances.len(), 3);
        assert!(file.instances.iter().all(|i| i.object == 0));
        assert_eq!(file.instances[2].name, "Cube.2");
        // World-to-instance: the third instance's origin sits at x = 6.
        assert!((file.instances[2].rows[0][3] + 6.0).abs() < 1e-5);
    }

    #[test]
    fn jump_tables_land_on_tags() {
        let (mut scene, material) = cube_scene();
        scene.add_mesh_object("A", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        scene.add_mesh_object("B", Mesh::cube(2.0), vec![Some(material)], Mat4::IDENTITY);
        for deflate in [false, true] {
            let options = ObjectOptions {
                deflate,
                compress_normals: deflate,
                triangulate: true,
                ..ObjectOptions::default()
            };
            let (bytes, _) = export(&scene, options);
            let file = read_mff(&bytes).unwrap();
            assert_eq!(file.objects.len(), 2);
            for object in &file.objects {
                assert_eq!(&bytes[object.offset as usize..][..4], b"Obj_");
                for lod in &object.lods {
                    assert_eq!(&bytes[lod.offset as usize..][..4], b"LOD_");
                    assert_eq!(lod.triangles, 12);
                    assert_eq!(lod.quads, 0);
                }
            }
            assert_eq!(file.objects[1].max, [2.0; 3]);
        }
    }

    #[test]
    fn lod_chains_share_one_record() {
        let (mut scene, material) = cube_scene();
        let fine = scene.add_mesh_object("Fine", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        let coarse =
            scene.add_mesh_object("Coarse", Mesh::cube(2.0), vec![Some(material)], Mat4::IDENTITY);
        scene.object_mut(fine).lod = Some(LodLink {
            next: coarse,
            distance: 10.0,
        });
        scene.object_mut(coarse).lod = Some(LodLink {
            next: fine,
            distance: 50.0,
        });
        let empty = scene.add_mesh(Mesh::default());
        for name in ["Tree.1", "Tree.2"] {
            let mut object = Object::new(name, ObjectKind::Mesh(scene.mesh_ref(empty, "TreeLod")));
            object.lod = Some(LodLink {
                next: fine,
                distance: 0.0,
            });
            scene.add_object(object, Mat4::IDENTITY);
        }

        let (bytes, _) = export(&scene, ObjectOptions::default());
        let file = read_mff(&bytes).unwrap();
        assert_eq!(file.objects.len(), 1);
        let object = &file.objects[0];
        assert_eq!(object.lods.len(), 2);
        // The coarse level has the largest distance, so output starts after it.
        assert_eq!(object.lods[0].vertices, 24);
        assert_eq!(object.min, [-2.0; 3]);
        assert_eq!(object.max, [2.0; 3]);
        assert_eq!(file.instances.len(), 2);
    }

    #[test]
    fn broken_lod_chain_falls_back_to_the_instance() {
        let (mut scene, material) = cube_scene();
        let level = scene.add_mesh_object("Level", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        let empty = scene.add_mesh(Mesh::default());
        let mut object = Object::new("Holder", ObjectKind::Mesh(scene.mesh_ref(empty, "Holder")));
        object.lod = Some(LodLink {
            next: level,
            distance: 1.0,
        });
        let holder = scene.add_object(object, Mat4::IDENTITY);
        let mut diagnostics = Diagnostics::new();
        let chain = resolve_lods(&scene, holder, &mut diagnostics).unwrap();
        assert_eq!(chain.levels, vec![holder]);
        assert!(diagnostics.mentions("no successor"));
    }

    #[test]
    fn constant_animation_collapses_to_static() {
        let (mut scene, material) = cube_scene();
        scene.active_mut().frame_end = 3;
        let still = scene.add_mesh_object("Still", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        scene.object_mut(still).has_animation_data = true;
        let moving =
            scene.add_mesh_object("Moving", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        scene.object_mut(moving).has_animation_data = true;
        for f in 1..=3 {
            scene.set_transform_at(moving, f, Mat4::from_translation(Vec3::X * f as f32));
        }
        let options = ObjectOptions {
            export_animation: true,
            ..ObjectOptions::default()
        };
        let (bytes, _) = export(&scene, options);
        let file = read_mff(&bytes).unwrap();
        assert_eq!(file.instances.len(), 1 + 3);
        assert_eq!(file.instances[0].name, "Still");
        assert_eq!(file.instances[0].keyframe, STATIC_KEYFRAME);
        let keys: Vec<u32> = file.instances[1..].iter().map(|i| i.keyframe).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn deforming_objects_are_snapshotted_per_frame() {
        let (mut scene, material) = cube_scene();
        scene.active_mut().frame_end = 2;
        scene.add_mesh_object("Static", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        let cloth = scene.add_mesh_object("Cloth", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        scene.object_mut(cloth).modifiers.push(Modifier::Cloth);
        scene.set_mesh_at(cloth, 2, Mesh::cube(3.0));
        let inflow = scene.add_mesh_object("Inflow", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        scene
            .object_mut(inflow)
            .modifiers
            .push(Modifier::Fluid(FluidRole::Fluid));

        let options = ObjectOptions {
            export_animation: true,
            ..ObjectOptions::default()
        };
        let (bytes, _) = export(&scene, options);
        let file = read_mff(&bytes).unwrap();
        let names: Vec<&str> = file.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Static", "Cloth__animated__frame_1", "Cloth__animated__frame_2"]
        );
        assert_eq!(file.objects[1].keyframe, 1);
        assert_eq!(file.objects[1].prev, NO_INDEX);
        assert_eq!(file.objects[2].prev, 1);
        assert_eq!(file.objects[2].max, [3.0; 3]);

        let snapshots: Vec<(&str, u32, u32)> = file.instances[1..]
            .iter()
            .map(|i| (i.name.as_str(), i.object, i.keyframe))
            .collect();
        assert_eq!(
            snapshots,
            vec![
                ("Cloth__animated__frame_1", 1, 1),
                ("Cloth__animated__frame_2", 2, 2),
            ]
        );
    }

    #[test]
    fn spheres_drop_rotation_with_a_warning() {
        let (mut scene, material) = cube_scene();
        let mut object = Object::new("Ball", ObjectKind::Empty);
        object.perfect_sphere = true;
        object.material_slots = vec![Some(material)];
        scene.add_object(
            object,
            Mat4::from_scale_rotation_translation(
                Vec3::splat(2.0),
                Quat::from_rotation_z(0.3),
                Vec3::new(0.0, 0.0, 1.0),
            ),
        );
        let (bytes, diagnostics) = export(&scene, ObjectOptions::default());
        assert!(diagnostics.mentions("rotation"));
        let file = read_mff(&bytes).unwrap();
        let LodData::Sphere { radius, material, .. } = &file.objects[0].lods[0].data else {
            panic!("expected a sphere LOD");
        };
        assert_eq!(*radius, 1.0);
        assert_eq!(*material, 0);
        // Uniform scale 2 without rotation: the inverse halves x.
        assert!((file.instances[0].rows[0][0] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn singular_transforms_abort() {
        let (mut scene, material) = cube_scene();
        scene.add_mesh_object("Flat", Mesh::cube(1.0), vec![Some(material)], Mat4::ZERO);
        let table = lambert_table(&scene);
        let mut diagnostics = Diagnostics::new();
        let mut buf = BinaryBuffer::new();
        let err = ObjectWriter {
            scene: &scene,
            materials: &table,
            bones: &BoneLookup::default(),
            frames: &[1],
            current_frame: 1,
            options: ObjectOptions::default(),
            diagnostics: &mut diagnostics,
        }
        .write(&mut buf)
        .unwrap_err();
        assert!(matches!(
            err.current_context(),
            FormatError::SingularTransform(name) if name == "Flat"
        ));
    }

    #[test]
    fn orphans_and_bone_shapes_are_skipped() {
        let (mut scene, material) = cube_scene();
        let shape = scene.add_mesh_object("Shape", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        let orphan = scene.add_mesh_object("Orphan", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        scene.object_mut(orphan).users = 0;
        scene.add_object(
            Object::new(
                "Rig",
                ObjectKind::Armature(crate::scene::Armature {
                    bones: vec![crate::scene::Bone {
                        name: "Root".into(),
                        custom_shape: Some(shape),
                    }],
                }),
            ),
            Mat4::IDENTITY,
        );
        let kept = scene.add_mesh_object("Kept", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
        let set = collect_objects(&scene, &ObjectOptions::default());
        assert_eq!(set.instances, vec![kept]);
    }

    fn rigged_mesh(weights: Vec<VertexWeight>) -> MemoryScene {
        let (mut scene, material) = cube_scene();
        let bones = (0..5)
            .map(|i| Bone {
                name: format!("B{i}"),
                custom_shape: None,
            })
            .collect();
        let rig = scene.add_object(
            Object::new("Rig", ObjectKind::Armature(Armature { bones })),
            Mat4::IDENTITY,
        );
        let mut mesh = Mesh::cube(1.0);
        mesh.weights = vec![weights; mesh.positions.len()];
        let skin = scene.add_mesh_object("Skin", mesh, vec![Some(material)], Mat4::IDENTITY);
        let object = scene.object_mut(skin);
        object.parent = Some(rig);
        object.modifiers.push(Modifier::Armature);
        object.vertex_groups = ["B0", "B1", "B2", "B3", "B4", "Ghost"]
            .map(String::from)
            .to_vec();
        scene
    }

    fn skin_words(bytes: &[u8]) -> Vec<u32> {
        let file = read_mff(bytes).unwrap();
        assert_eq!(file.objects.len(), 1);
        let LodData::Mesh(mesh) = &file.objects[0].lods[0].data else {
            panic!("expected a mesh LOD");
        };
        let weights = mesh
            .attributes
            .iter()
            .find(|a| a.name == "AnimationWeights")
            .expect("skin weight attribute");
        assert_eq!(weights.type_code, ATTR_TYPE_SKIN_WEIGHTS);
        assert_eq!(weights.data.len(), mesh.positions.len() * 16);
        weights
            .data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn unpack(word: u32) -> (u32, f32) {
        (word & BONE_INDEX_MASK, (word >> 22) as f32 / 1023.0)
    }

    #[test]
    fn skinned_meshes_keep_the_four_heaviest_bones() {
        let weight = |group, weight| VertexWeight { group, weight };
        let scene = rigged_mesh(vec![
            weight(0, 0.1),
            weight(1, 0.5),
            weight(2, 0.2),
            weight(3, 0.9),
            weight(4, 0.3),
            weight(5, 0.4),
        ]);
        let options = ObjectOptions {
            export_animation: true,
            ..ObjectOptions::default()
        };
        let (bytes, diagnostics) = export(&scene, options);
        let words = skin_words(&bytes);
        let first: Vec<(u32, f32)> = words[..4].iter().map(|w| unpack(*w)).collect();
        let bones: Vec<u32> = first.iter().map(|(b, _)| *b).collect();
        assert_eq!(bones, [3, 1, 4, 2]);
        for ((_, got), want) in first.iter().zip([0.9, 0.5, 0.3, 0.2]) {
            assert!((got - want).abs() < 1e-3);
        }
        assert!(words.chunks_exact(4).all(|v| v == &words[..4]));
        assert!(diagnostics.mentions("'Ghost'"));
        assert!(!diagnostics.mentions("outside [0,1]"));

        let (bytes, _) = export(&scene, ObjectOptions::default());
        let file = read_mff(&bytes).unwrap();
        let LodData::Mesh(mesh) = &file.objects[0].lods[0].data else {
            panic!("expected a mesh LOD");
        };
        assert!(mesh.attributes.iter().all(|a| a.name != "AnimationWeights"));
    }

    #[test]
    fn out_of_range_weights_warn() {
        let scene = rigged_mesh(vec![
            VertexWeight { group: 0, weight: 0.7 },
            VertexWeight { group: 1, weight: -0.3 },
            VertexWeight { group: 2, weight: 1.5 },
        ]);
        let options = ObjectOptions {
            export_animation: true,
            ..ObjectOptions::default()
        };
        let (bytes, diagnostics) = export(&scene, options);
        assert!(diagnostics.mentions("outside [0,1]"));
        let words = skin_words(&bytes);
        assert_eq!(unpack(words[0]), (2, 1.0));
        assert_eq!(unpack(words[1]).0, 0);
        assert_eq!(unpack(words[2]).0, BONE_INDEX_MASK);
    }
}
