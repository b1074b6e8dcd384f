use std::f32::consts::PI;

use glam::{Quat, Vec3};
use rootcause::prelude::*;
use serde_json::{Map, Value};
use tracing::debug;

use super::{
    DResult, DescriptorError, DescriptorWriter, entity, float, floats, object_name,
    objects_where, remove_keys, scalar_path, vector_path,
};
use crate::bake::relative_image_path;
use crate::error::Diagnostics;
use crate::material::flatten::{value_only, value_only_color};
use crate::math::flip_array;
use crate::recognized::Recognized;
use crate::scene::{Light, LightKind, NodeId, NodeKind, ObjectId, ObjectKind, ShaderGraph};

/// Keys owned by the exporter inside a light entry.
const LIGHT_KEYS: &[&str] = &[
    "type",
    "position",
    "direction",
    "intensity",
    "flux",
    "radiance",
    "temperature",
    "scale",
    "width",
    "falloffStart",
];

/// What a light emits, after its node tree (if any) has been resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
enum LightEmission {
    Color([f32; 3]),
    /// Black-body temperature in Kelvin.
    Temperature(f32),
}

#[derive(Debug, Clone, Copy)]
struct Emitter {
    emission: LightEmission,
    /// Strength of the emission node, 1 without nodes.
    strength: f32,
    uses_nodes: bool,
}

/// Write every live light. Returns the ids of the lights written.
pub(super) fn write_lights(
    w: &mut DescriptorWriter<'_>,
    lights: &mut Map<String, Value>,
) -> DResult<Vec<ObjectId>> {
    let scene = w.scene;
    let mut written = Vec::new();
    for id in objects_where(scene, ObjectKind::is_light) {
        let name = object_name(scene, id);
        let Some(light) = scene.object(id).and_then(|o| o.kind.light_ref()) else {
            continue;
        };
        if light.users == 0 {
            continue;
        }
        let kind = match light.kind {
            Recognized::Known(kind) => kind,
            Recognized::Unknown(ref raw) => {
                w.diagnostics
                    .warn(name.as_str(), format!("skipping unsupported light type '{raw}'"));
                continue;
            }
        };
        let emitter = emitter(light, &name, w.diagnostics)?;
        if kind != LightKind::Sun && light.shadow_soft_size != 0.0 {
            w.diagnostics
                .warn(name.as_str(), "light has non-zero size, which is not supported");
        }

        let poses = w.sample(id, |m| {
            let (_, rotation, translation) = m.to_scale_rotation_translation();
            (translation, rotation)
        })?;
        let positions = || vector_path(poses.iter().map(|(t, _)| flip_array(*t)).collect());
        let directions = || vector_path(poses.iter().map(|(_, r)| direction(*r)).collect());
        let frames = poses.len();

        let mut fields = Map::new();
        let power = light.energy * emitter.strength;
        match kind {
            LightKind::Point => {
                fields.insert("type".into(), "point".into());
                fields.insert("position".into(), positions());
                let color_key = if emitter.uses_nodes { "flux" } else { "intensity" };
                emission_field(&mut fields, emitter.emission, light, color_key, frames);
                fields.insert("scale".into(), scalar_path(vec![power; frames]));
            }
            LightKind::Spot => {
                fields.insert("type".into(), "spot".into());
                fields.insert("position".into(), positions());
                fields.insert("direction".into(), directions());
                emission_field(&mut fields, emitter.emission, light, "intensity", frames);
                // The host spreads a spot's flux over the whole sphere.
                let scale = if emitter.uses_nodes { power / (4.0 * PI) } else { power };
                fields.insert("scale".into(), scalar_path(vec![scale; frames]));
                let half = light.spot_size / 2.0;
                fields.insert("width".into(), scalar_path(vec![half; frames]));
                let falloff = (half.tan() * (1.0 - light.spot_blend).max(0.0).sqrt()).atan();
                fields.insert("falloffStart".into(), scalar_path(vec![falloff; frames]));
            }
            LightKind::Sun => {
                fields.insert("type".into(), "directional".into());
                fields.insert("direction".into(), directions());
                emission_field(&mut fields, emitter.emission, light, "radiance", frames);
                fields.insert("scale".into(), scalar_path(vec![power; frames]));
            }
        }

        debug!("light '{name}'");
        let entry = entity(lights, &name)?;
        remove_keys(entry, LIGHT_KEYS);
        entry.extend(fields);
        written.push(id);
    }
    Ok(written)
}

/// Flipped forward axis of a host light or camera.
fn direction(rotation: Quat) -> [f32; 3] {
    flip_array(rotation * Vec3::NEG_Z)
}

fn emission_field(
    fields: &mut Map<String, Value>,
    emission: LightEmission,
    light: &Light,
    color_key: &str,
    frames: usize,
) {
    match emission {
        LightEmission::Temperature(t) => {
            fields.insert("temperature".into(), scalar_path(vec![t; frames]));
        }
        LightEmission::Color(c) => {
            let tinted = [0, 1, 2].map(|i| light.color[i] * c[i]);
            fields.insert(color_key.into(), vector_path(vec![tinted; frames]));
        }
    }
}

/// Resolve the emission node of a node-based light.
fn emitter(light: &Light, name: &str, diagnostics: &mut Diagnostics) -> DResult<Emitter> {
    let Some(graph) = &light.nodes else {
        return Ok(Emitter {
            emission: LightEmission::Color([1.0; 3]),
            strength: 1.0,
            uses_nodes: false,
        });
    };
    let emission_node = graph
        .active_output(NodeKind::OutputLight)
        .and_then(|out| graph.link_into_named(out, "Surface"))
        .map(|link| link.from_node)
        .filter(|node| graph.node(*node).is(NodeKind::Emission))
        .ok_or_else(|| Report::new(DescriptorError::LightWithoutEmission(name.to_string())))?;

    let strength = value_only(graph, emission_node, "Strength")
        .context(DescriptorError::Light(name.to_string()))?;
    let emission = match graph.link_into_named(emission_node, "Color") {
        Some(link) if graph.node(link.from_node).is(NodeKind::Blackbody) => {
            if light.color != [1.0; 3] {
                diagnostics.warn(
                    name,
                    "black-body light has a color scale which cannot be exported; ignoring it",
                );
            }
            LightEmission::Temperature(
                value_only(graph, link.from_node, "Temperature")
                    .context(DescriptorError::Light(name.to_string()))?,
            )
        }
        Some(_) => {
            return Err(Report::new(DescriptorError::GoniometricLight(name.to_string())));
        }
        None => LightEmission::Color(
            value_only_color(graph, emission_node, "Color")
                .context(DescriptorError::Light(name.to_string()))?,
        ),
    };
    Ok(Emitter {
        emission,
        strength,
        uses_nodes: true,
    })
}

/// Convert a world node tree into a background light.
///
/// Returns `Ok(None)` when the world has no connected output.
pub(super) fn background(
    graph: &ShaderGraph,
    diagnostics: &mut Diagnostics,
) -> DResult<Option<Map<String, Value>>> {
    let Some(link) = graph
        .active_output(NodeKind::OutputWorld)
        .and_then(|out| graph.link_into_named(out, "Surface"))
    else {
        return Ok(None);
    };

    let mut map = Map::new();
    map.insert("scale".into(), float(1.0));
    let mut node = link.from_node;
    let n = graph.node(node);
    if n.is(NodeKind::Background) {
        let strength = if graph.is_linked(node, "Strength") {
            diagnostics.warn(
                n.name.as_str(),
                "non-scalar (linked) strength input for background is ignored",
            );
            None
        } else {
            value_only(graph, node, "Strength").ok()
        };
        match graph.link_into_named(node, "Color") {
            None => {
                map.insert("type".into(), "envmap".into());
                if let Some(s) = strength {
                    let color = value_only_color(graph, node, "Color")
                        .context(DescriptorError::Background(n.name.clone()))?;
                    map.insert("scale".into(), floats(&color.map(|c| c * s)));
                }
                return Ok(Some(map));
            }
            Some(color) => {
                if let Some(s) = strength {
                    map.insert("scale".into(), float(s));
                }
                node = color.from_node;
            }
        }
    }

    environment(graph, node, &mut map, diagnostics)?;
    Ok(Some(map))
}

fn environment(
    graph: &ShaderGraph,
    node: NodeId,
    map: &mut Map<String, Value>,
    diagnostics: &mut Diagnostics,
) -> DResult<()> {
    let n = graph.node(node);
    if graph.is_linked(node, "Vector") {
        diagnostics.warn(
            n.name.as_str(),
            "vector input (for e.g. rotation) is not supported yet",
        );
    }
    match n.kind.known() {
        Some(NodeKind::TexEnvironment | NodeKind::TexImage) => {
            let path = n.image.as_deref().ok_or_else(|| {
                Report::new(DescriptorError::Background(format!(
                    "environment node '{}' has no image",
                    n.name
                )))
            })?;
            map.insert("type".into(), "envmap".into());
            map.insert("map".into(), relative_image_path(path).into());
        }
        Some(NodeKind::TexSky) => {
            let sky = n.sky.as_ref().ok_or_else(|| {
                Report::new(DescriptorError::Background(format!(
                    "sky node '{}' has no sky parameters",
                    n.name
                )))
            })?;
            map.insert("type".into(), "sky".into());
            map.insert("model".into(), "hosek".into());
            map.insert("turbidity".into(), float(sky.turbidity));
            map.insert("albedo".into(), float(sky.ground_albedo));
            map.insert(
                "sunDir".into(),
                floats(&flip_array(Vec3::from_array(sky.sun_direction))),
            );
        }
        _ => {
            return Err(Report::new(DescriptorError::Background(format!(
                "unsupported background node '{}'",
                n.name
            ))));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use glam::Mat4;
    use serde_json::json;

    use super::*;
    use crate::material::MaterialTable;
    use crate::scene::MemoryScene;
    use crate::test_support::{add_light, cube_scene, light_nodes, nodes};

    fn lights_of(scene: &MemoryScene) -> (DResult<Map<String, Value>>, Diagnostics) {
        let mut diag = Diagnostics::new();
        let table = MaterialTable::default();
        let frames = scene.active().frames(false);
        let mut w = DescriptorWriter {
            scene,
            materials: &table,
            frames: &frames,
            version: "1.6",
            binary: "scene.mff",
            overwrite_default_scenario: true,
            diagnostics: &mut diag,
        };
        let mut lights = Map::new();
        let result = write_lights(&mut w, &mut lights).map(|_| lights);
        (result, diag)
    }

    fn f(v: &Value) -> f32 {
        v.as_f64().unwrap() as f32
    }

    #[test]
    fn plain_point_light() {
        let (scene, _) = cube_scene();
        let lights = lights_of(&scene).0.unwrap();
        assert_eq!(
            lights["Lamp"],
            json!({
                "type": "point",
                "position": [[0.0, 0.0, 0.0]],
                "intensity": [[1.0, 1.0, 1.0]],
                "scale": [5.0]
            })
        );
    }

    #[test]
    fn node_spot_light_converts_flux() {
        let mut scene = MemoryScene::new("Scene");
        let mut light = Light::new(LightKind::Spot, [1.0, 0.5, 1.0], 100.0);
        light.nodes = Some(light_nodes([0.5, 1.0, 1.0], 2.0).0);
        light.spot_size = 1.0;
        light.spot_blend = 0.0;
        add_light(&mut scene, "Spot", light, Mat4::from_translation(Vec3::Z));

        let (lights, diag) = lights_of(&scene);
        let spot = &lights.unwrap()["Spot"];
        assert!(diag.is_empty());
        assert_eq!(spot["type"], json!("spot"));
        assert_eq!(spot["position"], json!([[0.0, 1.0, 0.0]]));
        assert_eq!(spot["direction"], json!([[0.0, -1.0, 0.0]]));
        assert_eq!(spot["intensity"], json!([[0.5, 0.5, 1.0]]));
        assert!((f(&spot["scale"][0]) - 200.0 / (4.0 * PI)).abs() < 1e-4);
        assert_eq!(f(&spot["width"][0]), 0.5);
        // Without blend the falloff starts at the cone edge.
        assert!((f(&spot["falloffStart"][0]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn black_body_sun() {
        let mut scene = MemoryScene::new("Scene");
        let (mut graph, emission) = light_nodes([1.0; 3], 3.0);
        let bb = graph.add_node(nodes::blackbody(5500.0));
        graph.connect(bb, "Color", emission, 0);
        let mut light = Light::new(LightKind::Sun, [0.5; 3], 2.0);
        light.nodes = Some(graph);
        add_light(&mut scene, "Sun", light, Mat4::IDENTITY);

        let (lights, diag) = lights_of(&scene);
        let sun = &lights.unwrap()["Sun"];
        assert_eq!(sun["type"], json!("directional"));
        assert_eq!(sun["temperature"], json!([5500.0]));
        assert_eq!(sun["scale"], json!([6.0]));
        assert!(sun.get("radiance").is_none());
        assert!(diag.mentions("color scale"));
    }

    #[test]
    fn node_point_light_writes_flux() {
        let mut scene = MemoryScene::new("Scene");
        let mut light = Light::new(LightKind::Point, [1.0; 3], 10.0);
        light.nodes = Some(light_nodes([1.0, 0.5, 0.25], 0.5).0);
        light.shadow_soft_size = 0.25;
        add_light(&mut scene, "Bulb", light, Mat4::IDENTITY);

        let (lights, diag) = lights_of(&scene);
        let bulb = &lights.unwrap()["Bulb"];
        assert_eq!(bulb["flux"], json!([[1.0, 0.5, 0.25]]));
        assert_eq!(bulb["scale"], json!([5.0]));
        assert!(diag.mentions("non-zero size"));
    }

    #[test]
    fn goniometric_lights_abort() {
        let mut scene = MemoryScene::new("Scene");
        let (mut graph, emission) = light_nodes([1.0; 3], 1.0);
        let tex = graph.add_node(nodes::image_texture("ies.png"));
        graph.connect(tex, "Color", emission, 0);
        let mut light = Light::new(LightKind::Point, [1.0; 3], 1.0);
        light.nodes = Some(graph);
        add_light(&mut scene, "Ies", light, Mat4::IDENTITY);
        let err = lights_of(&scene).0.unwrap_err();
        assert!(matches!(err.current_context(), DescriptorError::GoniometricLight(_)));
    }

    #[test]
    fn unknown_light_types_are_skipped() {
        let mut scene = MemoryScene::new("Scene");
        let mut light = Light::new(LightKind::Point, [1.0; 3], 1.0);
        light.kind = Recognized::Unknown("AREA".into());
        add_light(&mut scene, "Panel", light, Mat4::IDENTITY);
        let (lights, diag) = lights_of(&scene);
        assert!(lights.unwrap().is_empty());
        assert!(diag.mentions("AREA"));
    }

    fn world(build: impl FnOnce(&mut ShaderGraph, NodeId)) -> ShaderGraph {
        let mut graph = ShaderGraph::default();
        let out = graph.add_node(nodes::output(NodeKind::OutputWorld, &["Surface"]));
        build(&mut graph, out);
        graph
    }

    #[test]
    fn environment_map_background() {
        let graph = world(|g, out| {
            let env = g.add_node(nodes::environment_texture("//hdri/studio.hdr"));
            let bg = g.add_node(nodes::background([1.0; 3], 0.5));
            g.connect(env, "Color", bg, 0);
            g.connect(bg, "Background", out, 0);
        });
        let mut diag = Diagnostics::new();
        let bg = background(&graph, &mut diag).unwrap().unwrap();
        assert_eq!(
            Value::Object(bg),
            json!({"scale": 0.5, "type": "envmap", "map": "hdri/studio.hdr"})
        );
    }

    #[test]
    fn sky_background_flips_the_sun() {
        let graph = world(|g, out| {
            let sky = g.add_node(nodes::sky_texture(3.0, 0.25, [0.0, 1.0, 0.5]));
            g.connect(sky, "Color", out, 0);
        });
        let mut diag = Diagnostics::new();
        let bg = background(&graph, &mut diag).unwrap().unwrap();
        assert_eq!(bg["type"], json!("sky"));
        assert_eq!(bg["model"], json!("hosek"));
        assert_eq!(bg["turbidity"], json!(3.0));
        assert_eq!(bg["albedo"], json!(0.25));
        assert_eq!(bg["sunDir"], json!([0.0, 0.5, -1.0]));
        assert_eq!(bg["scale"], json!(1.0));
    }

    #[test]
    fn unconnected_and_unsupported_worlds() {
        let mut diag = Diagnostics::new();
        let empty = world(|_, _| {});
        assert!(background(&empty, &mut diag).unwrap().is_none());

        let odd = world(|g, out| {
            let noise = g.add_node(nodes::procedural_texture("Noise"));
            g.connect(noise, "Color", out, 0);
        });
        let err = background(&odd, &mut diag).unwrap_err();
        assert!(matches!(err.current_context(), DescriptorError::Background(_)));
    }
}
