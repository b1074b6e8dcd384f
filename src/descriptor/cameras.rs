use glam::Vec3;
use serde_json::{Map, Value};
use tracing::debug;

use super::{
    DResult, DescriptorWriter, entity, float, object_name, objects_where, remove_keys,
    vector_path,
};
use crate::math::flip_array;
use crate::recognized::Recognized;
use crate::scene::{Camera, ObjectKind, Projection};

/// Keys owned by the exporter inside a camera entry.
const CAMERA_KEYS: &[&str] = &[
    "type",
    "fov",
    "focalLength",
    "focusDistance",
    "aperture",
    "chipHeight",
    "near",
    "far",
    "width",
    "height",
    "path",
    "viewDir",
    "up",
];

/// An f-stop at or above this is treated as a pinhole.
const PINHOLE_APERTURE: f32 = 128.0;

/// Write every live camera. Returns how many were written.
pub(super) fn write_cameras(
    w: &mut DescriptorWriter<'_>,
    cameras: &mut Map<String, Value>,
) -> DResult<usize> {
    let scene = w.scene;
    let [res_x, res_y] = scene
        .scenes()
        .get(scene.active_scene())
        .map_or([1, 1], |s| s.resolution)
        .map(|r| r.max(1) as f32);
    let (near, far) = scene.viewport_clip();

    let mut written = 0;
    for id in objects_where(scene, ObjectKind::is_camera) {
        let name = object_name(scene, id);
        let Some(camera) = scene.object(id).and_then(|o| o.kind.camera_ref()) else {
            continue;
        };
        if camera.users == 0 {
            continue;
        }
        let mut fields = Map::new();
        match camera.projection {
            Recognized::Known(Projection::Perspective) => {
                perspective(&mut fields, camera, res_x, res_y);
                fields.insert("near".into(), float(near));
                fields.insert("far".into(), float(far));
            }
            Recognized::Known(Projection::Orthographic) => {
                fields.insert("type".into(), "ortho".into());
                fields.insert("width".into(), float(camera.ortho_scale));
                fields.insert("height".into(), float(res_y / res_x * camera.ortho_scale));
            }
            Recognized::Unknown(ref raw) => {
                w.diagnostics.warn(
                    name.as_str(),
                    format!("skipping unsupported camera type '{raw}'"),
                );
                continue;
            }
        }

        let poses = w.sample(id, |m| {
            let (_, rotation, translation) = m.to_scale_rotation_translation();
            (translation, rotation)
        })?;
        fields.insert(
            "path".into(),
            vector_path(poses.iter().map(|(t, _)| flip_array(*t)).collect()),
        );
        fields.insert(
            "viewDir".into(),
            vector_path(poses.iter().map(|(_, r)| flip_array(*r * Vec3::NEG_Z)).collect()),
        );
        fields.insert(
            "up".into(),
            vector_path(poses.iter().map(|(_, r)| flip_array(*r * Vec3::Y)).collect()),
        );

        debug!("camera '{name}'");
        let entry = entity(cameras, &name)?;
        remove_keys(entry, CAMERA_KEYS);
        entry.extend(fields);
        written += 1;
    }
    Ok(written)
}

fn perspective(fields: &mut Map<String, Value>, camera: &Camera, res_x: f32, res_y: f32) {
    let aperture = camera.dof.map_or(PINHOLE_APERTURE, |d| d.fstop);
    if aperture >= PINHOLE_APERTURE {
        fields.insert("type".into(), "pinhole".into());
        fields.insert("fov".into(), float(vertical_fov(camera.angle, res_x, res_y).to_degrees()));
    } else {
        let aspect = res_y / res_x;
        fields.insert("type".into(), "focus".into());
        fields.insert("focalLength".into(), float(camera.lens));
        fields.insert(
            "focusDistance".into(),
            float(camera.dof.map_or(0.0, |d| d.focus_distance)),
        );
        fields.insert("aperture".into(), float(aperture));
        fields.insert(
            "chipHeight".into(),
            float((camera.angle / 2.0).tan() * 2.0 * camera.lens * aspect),
        );
    }
}

/// The host's field of view spans the larger image side. Landscape images
/// are corrected to their vertical extent.
fn vertical_fov(angle: f32, res_x: f32, res_y: f32) -> f32 {
    if res_y > res_x {
        angle
    } else {
        ((angle / 2.0).tan() * res_y / res_x).atan() * 2.0
    }
}
