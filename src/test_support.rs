//! Scene and shader-graph fixtures shared by unit tests.

use glam::{Mat4, Vec3};

use crate::scene::{
    Camera, LightKind, MaterialData, MaterialId, MemoryScene, Mesh, NodeId, NodeKind, Object,
    ObjectId, ObjectKind, ShaderGraph, ShaderNode, Socket, SocketValue,
};

/// A node-based material whose active output has the inputs
/// `Surface`, `Volume` and `Displacement`, in that order.
pub fn graph_material(
    name: &str,
    build: impl FnOnce(&mut ShaderGraph, NodeId),
) -> MaterialData {
    let mut graph = ShaderGraph::default();
    let out = graph.add_node(nodes::output(NodeKind::OutputMaterial, &["Surface", "Volume", "Displacement"]));
    build(&mut graph, out);
    MaterialData {
        name: name.to_string(),
        graph: Some(graph),
        outer_medium: None,
    }
}

/// A diffuse material with albedo 0.8.
pub fn plain_material(name: &str) -> MaterialData {
    graph_material(name, |g, out| {
        let d = g.add_node(nodes::diffuse([0.8; 3], 0.0));
        g.connect(d, "BSDF", out, 0);
    })
}

pub mod nodes {
    use super::*;
    use crate::recognized::Recognized;
    use crate::scene::{Distribution, SkyTexture};

    fn rgba(c: [f32; 3]) -> SocketValue {
        SocketValue::Rgba([c[0], c[1], c[2], 1.0])
    }

    fn node(name: &str, kind: NodeKind, inputs: Vec<Socket>, outputs: &[&str]) -> ShaderNode {
        ShaderNode {
            inputs,
            outputs: outputs
                .iter()
                .map(|o| Socket::new(*o, SocketValue::None))
                .collect(),
            ..ShaderNode::new(name, kind)
        }
    }

    fn shader(name: &str) -> Socket {
        Socket::new(name, SocketValue::None)
    }

    fn normal() -> Socket {
        Socket::new("Normal", SocketValue::Vector([0.0; 3]))
    }

    pub fn output(kind: NodeKind, inputs: &[&str]) -> ShaderNode {
        ShaderNode {
            is_active_output: true,
            ..node("Output", kind, inputs.iter().map(|i| shader(i)).collect(), &[])
        }
    }

    pub fn diffuse(color: [f32; 3], roughness: f32) -> ShaderNode {
        node(
            "Diffuse BSDF",
            NodeKind::BsdfDiffuse,
            vec![
                Socket::new("Color", rgba(color)),
                Socket::new("Roughness", SocketValue::Float(roughness)),
                normal(),
            ],
            &["BSDF"],
        )
    }

    pub fn value(v: f32) -> ShaderNode {
        ShaderNode {
            outputs: vec![Socket::new("Value", SocketValue::Float(v))],
            ..ShaderNode::new("Value", NodeKind::Value)
        }
    }

    pub fn glossy(color: [f32; 3], roughness: f32, distribution: Distribution) -> ShaderNode {
        ShaderNode {
            distribution: Some(Recognized::Known(distribution)),
            ..node(
                "Glossy BSDF",
                NodeKind::BsdfGlossy,
                vec![
                    Socket::new("Color", rgba(color)),
                    Socket::new("Roughness", SocketValue::Float(roughness)),
                    normal(),
                ],
                &["BSDF"],
            )
        }
    }

    pub fn anisotropic(color: [f32; 3], roughness: f32, anisotropy: f32) -> ShaderNode {
        ShaderNode {
            distribution: Some(Recognized::Known(Distribution::Ggx)),
            ..node(
                "Anisotropic BSDF",
                NodeKind::BsdfAnisotropic,
                vec![
                    Socket::new("Color", rgba(color)),
                    Socket::new("Roughness", SocketValue::Float(roughness)),
                    Socket::new("Anisotropy", SocketValue::Float(anisotropy)),
                    Socket::new("Rotation", SocketValue::Float(0.0)),
                    normal(),
                    Socket::new("Tangent", SocketValue::Vector([0.0; 3])),
                ],
                &["BSDF"],
            )
        }
    }

    fn transmissive(name: &str, kind: NodeKind, color: [f32; 3], roughness: f32, ior: f32) -> ShaderNode {
        ShaderNode {
            distribution: Some(Recognized::Known(Distribution::Ggx)),
            ..node(
                name,
                kind,
                vec![
                    Socket::new("Color", rgba(color)),
                    Socket::new("Roughness", SocketValue::Float(roughness)),
                    Socket::new("IOR", SocketValue::Float(ior)),
                    normal(),
                ],
                &["BSDF"],
            )
        }
    }

    pub fn refraction(color: [f32; 3], roughness: f32, ior: f32) -> ShaderNode {
        transmissive("Refraction BSDF", NodeKind::BsdfRefraction, color, roughness, ior)
    }

    pub fn glass(color: [f32; 3], roughness: f32, ior: f32) -> ShaderNode {
        transmissive("Glass BSDF", NodeKind::BsdfGlass, color, roughness, ior)
    }

    pub fn fresnel(ior: f32) -> ShaderNode {
        node(
            "Fresnel",
            NodeKind::Fresnel,
            vec![Socket::new("IOR", SocketValue::Float(ior)), normal()],
            &["Fac"],
        )
    }

    pub fn layer_weight(blend: f32) -> ShaderNode {
        node(
            "Layer Weight",
            NodeKind::LayerWeight,
            vec![Socket::new("Blend", SocketValue::Float(blend)), normal()],
            &["Fresnel", "Facing"],
        )
    }

    pub fn mix(fac: f32) -> ShaderNode {
        node(
            "Mix Shader",
            NodeKind::MixShader,
            vec![
                Socket::new("Fac", SocketValue::Float(fac)),
                shader("Shader"),
                shader("Shader"),
            ],
            &["Shader"],
        )
    }

    pub fn emission(color: [f32; 3], strength: f32) -> ShaderNode {
        node(
            "Emission",
            NodeKind::Emission,
            vec![
                Socket::new("Color", rgba(color)),
                Socket::new("Strength", SocketValue::Float(strength)),
            ],
            &["Emission"],
        )
    }

    pub fn background(color: [f32; 3], strength: f32) -> ShaderNode {
        node(
            "Background",
            NodeKind::Background,
            vec![
                Socket::new("Color", rgba(color)),
                Socket::new("Strength", SocketValue::Float(strength)),
            ],
            &["Background"],
        )
    }

    pub fn image_texture(path: &str) -> ShaderNode {
        ShaderNode {
            image: Some(path.to_string()),
            ..node(
                "Image Texture",
                NodeKind::TexImage,
                vec![Socket::new("Vector", SocketValue::Vector([0.0; 3]))],
                &["Color", "Alpha"],
            )
        }
    }

    pub fn environment_texture(path: &str) -> ShaderNode {
        ShaderNode {
            image: Some(path.to_string()),
            ..node(
                "Environment Texture",
                NodeKind::TexEnvironment,
                vec![Socket::new("Vector", SocketValue::Vector([0.0; 3]))],
                &["Color"],
            )
        }
    }

    pub fn sky_texture(turbidity: f32, ground_albedo: f32, sun_direction: [f32; 3]) -> ShaderNode {
        ShaderNode {
            sky: Some(SkyTexture {
                turbidity,
                ground_albedo,
                sun_direction,
            }),
            ..node(
                "Sky Texture",
                NodeKind::TexSky,
                vec![Socket::new("Vector", SocketValue::Vector([0.0; 3]))],
                &["Color"],
            )
        }
    }

    pub fn transparent() -> ShaderNode {
        node(
            "Transparent BSDF",
            NodeKind::BsdfTransparent,
            vec![Socket::new("Color", rgba([1.0; 3]))],
            &["BSDF"],
        )
    }

    pub fn procedural_texture(name: &str) -> ShaderNode {
        node(
            name,
            NodeKind::TexNoise,
            vec![Socket::new("Scale", SocketValue::Float(5.0))],
            &["Fac", "Color"],
        )
    }

    pub fn blackbody(temperature: f32) -> ShaderNode {
        node(
            "Blackbody",
            NodeKind::Blackbody,
            vec![Socket::new("Temperature", SocketValue::Float(temperature))],
            &["Color"],
        )
    }
}

/// A light node tree whose emission node feeds the active light output.
pub fn light_nodes(color: [f32; 3], strength: f32) -> (ShaderGraph, NodeId) {
    let mut graph = ShaderGraph::default();
    let out = graph.add_node(nodes::output(NodeKind::OutputLight, &["Surface"]));
    let emission = graph.add_node(nodes::emission(color, strength));
    graph.connect(emission, "Emission", out, 0);
    (graph, emission)
}

pub fn add_camera(scene: &mut MemoryScene, name: &str, camera: Camera, world: Mat4) -> ObjectId {
    let id = scene.add_object(Object::new(name, ObjectKind::Camera(camera)), world);
    if scene.active().camera.is_none() {
        scene.active_mut().camera = Some(id);
    }
    id
}

pub fn add_light(scene: &mut MemoryScene, name: &str, light: crate::scene::Light, world: Mat4) -> ObjectId {
    scene.add_object(Object::new(name, ObjectKind::Light(light)), world)
}

/// A cube with one diffuse material, a pinhole camera at `(0, 0, 5)`
/// looking down `-z` and a point light at the origin.
pub fn cube_scene() -> (MemoryScene, MaterialId) {
    let mut scene = MemoryScene::new("Scene");
    let material = scene.add_material(plain_material("Lambert"));
    scene.add_mesh_object("Cube", Mesh::cube(1.0), vec![Some(material)], Mat4::IDENTITY);
    add_camera(
        &mut scene,
        "Camera",
        Camera::perspective(60f32.to_radians()),
        Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0)),
    );
    add_light(
        &mut scene,
        "Lamp",
        crate::scene::Light::new(LightKind::Point, [1.0; 3], 5.0),
        Mat4::IDENTITY,
    );
    (scene, material)
}
