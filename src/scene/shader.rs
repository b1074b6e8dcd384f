//! Shader node graphs as exposed by the host.

use crate::recognized::{FromIdentifier, Recognized};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Node types the flattener understands. Anything else stays
/// `Recognized::Unknown` with the host's type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    OutputMaterial,
    OutputLight,
    OutputWorld,
    BsdfDiffuse,
    BsdfGlossy,
    BsdfAnisotropic,
    BsdfGlass,
    BsdfRefraction,
    BsdfTransparent,
    BsdfPrincipled,
    Emission,
    Background,
    MixShader,
    Fresnel,
    LayerWeight,
    Value,
    Blackbody,
    Displacement,
    TexImage,
    TexEnvironment,
    TexSky,
    TexNoise,
    TexChecker,
    TexGradient,
    TexVoronoi,
    TexWave,
    TexMagic,
    TexBrick,
}

impl NodeKind {
    pub fn is_texture(&self) -> bool {
        matches!(
            self,
            NodeKind::TexImage
                | NodeKind::TexEnvironment
                | NodeKind::TexSky
                | NodeKind::TexNoise
                | NodeKind::TexChecker
                | NodeKind::TexGradient
                | NodeKind::TexVoronoi
                | NodeKind::TexWave
                | NodeKind::TexMagic
                | NodeKind::TexBrick
        )
    }
}

impl FromIdentifier for NodeKind {
    fn from_identifier(id: &str) -> Option<Self> {
        let kind = match id {
            "ShaderNodeOutputMaterial" => NodeKind::OutputMaterial,
            "ShaderNodeOutputLight" => NodeKind::OutputLight,
            "ShaderNodeOutputWorld" => NodeKind::OutputWorld,
            "ShaderNodeBsdfDiffuse" => NodeKind::BsdfDiffuse,
            "ShaderNodeBsdfGlossy" => NodeKind::BsdfGlossy,
            "ShaderNodeBsdfAnisotropic" => NodeKind::BsdfAnisotropic,
            "ShaderNodeBsdfGlass" => NodeKind::BsdfGlass,
            "ShaderNodeBsdfRefraction" => NodeKind::BsdfRefraction,
            "ShaderNodeBsdfTransparent" => NodeKind::BsdfTransparent,
            "ShaderNodeBsdfPrincipled" => NodeKind::BsdfPrincipled,
            "ShaderNodeEmission" => NodeKind::Emission,
            "ShaderNodeBackground" => NodeKind::Background,
            "ShaderNodeMixShader" => NodeKind::MixShader,
            "ShaderNodeFresnel" => NodeKind::Fresnel,
            "ShaderNodeLayerWeight" => NodeKind::LayerWeight,
            "ShaderNodeValue" => NodeKind::Value,
            "ShaderNodeBlackbody" => NodeKind::Blackbody,
            "ShaderNodeDisplacement" => NodeKind::Displacement,
            "ShaderNodeTexImage" => NodeKind::TexImage,
            "ShaderNodeTexEnvironment" => NodeKind::TexEnvironment,
            "ShaderNodeTexSky" => NodeKind::TexSky,
            "ShaderNodeTexNoise" => NodeKind::TexNoise,
            "ShaderNodeTexChecker" => NodeKind::TexChecker,
            "ShaderNodeTexGradient" => NodeKind::TexGradient,
            "ShaderNodeTexVoronoi" => NodeKind::TexVoronoi,
            "ShaderNodeTexWave" => NodeKind::TexWave,
            "ShaderNodeTexMagic" => NodeKind::TexMagic,
            "ShaderNodeTexBrick" => NodeKind::TexBrick,
            _ => return None,
        };
        Some(kind)
    }
}

/// Microfacet distribution selected on glossy, anisotropic, glass and
/// refraction nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    Sharp,
    Beckmann,
    Ggx,
    MultiGgx,
}

impl FromIdentifier for Distribution {
    fn from_identifier(id: &str) -> Option<Self> {
        match id {
            "SHARP" => Some(Distribution::Sharp),
            "BECKMANN" => Some(Distribution::Beckmann),
            "GGX" => Some(Distribution::Ggx),
            "MULTI_GGX" => Some(Distribution::MultiGgx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SocketValue {
    /// Shader sockets carry no default.
    None,
    Float(f32),
    Rgba([f32; 4]),
    Vector([f32; 3]),
}

impl SocketValue {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            SocketValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// RGB part of a color, or the components of a vector.
    pub fn as_color(&self) -> Option<[f32; 3]> {
        match self {
            SocketValue::Rgba([r, g, b, _]) => Some([*r, *g, *b]),
            SocketValue::Vector(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Socket {
    pub name: String,
    pub default: SocketValue,
}

impl Socket {
    pub fn new(name: impl Into<String>, default: SocketValue) -> Self {
        Socket {
            name: name.into(),
            default,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkyTexture {
    pub turbidity: f32,
    pub ground_albedo: f32,
    pub sun_direction: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderNode {
    pub name: String,
    pub kind: Recognized<NodeKind>,
    pub inputs: Vec<Socket>,
    pub outputs: Vec<Socket>,
    pub distribution: Option<Recognized<Distribution>>,
    /// File path of the image bound to image and environment texture nodes.
    pub image: Option<String>,
    pub sky: Option<SkyTexture>,
    pub is_active_output: bool,
}

impl ShaderNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        ShaderNode {
            name: name.into(),
            kind: Recognized::Known(kind),
            inputs: Vec::new(),
            outputs: Vec::new(),
            distribution: None,
            image: None,
            sky: None,
            is_active_output: false,
        }
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|s| s.name == name)
    }

    pub fn input(&self, name: &str) -> Option<&Socket> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn is(&self, kind: NodeKind) -> bool {
        self.kind.is(&kind)
    }
}

/// A directed connection from a named output socket into an input slot.
///
/// Inputs are addressed by position because some nodes (mix shaders) have
/// several inputs sharing one name.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub from_node: NodeId,
    pub from_socket: String,
    pub to_node: NodeId,
    pub to_input: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderGraph {
    pub nodes: Vec<ShaderNode>,
    pub links: Vec<Link>,
}

impl ShaderGraph {
    pub fn node(&self, id: NodeId) -> &ShaderNode {
        &self.nodes[id.0]
    }

    pub fn add_node(&mut self, node: ShaderNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn connect(&mut self, from: NodeId, from_socket: &str, to: NodeId, to_input: usize) {
        self.links.push(Link {
            from_node: from,
            from_socket: from_socket.to_string(),
            to_node: to,
            to_input,
        });
    }

    /// The active output node of the given kind.
    pub fn active_output(&self, kind: NodeKind) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.is(kind) && n.is_active_output)
            .map(NodeId)
    }

    /// The link feeding input slot `input` of `node`, if any.
    pub fn link_into(&self, node: NodeId, input: usize) -> Option<&Link> {
        self.links
            .iter()
            .find(|l| l.to_node == node && l.to_input == input)
    }

    /// The link feeding the first input named `name` on `node`.
    pub fn link_into_named(&self, node: NodeId, name: &str) -> Option<&Link> {
        let index = self.node(node).input_index(name)?;
        self.link_into(node, index)
    }

    pub fn is_linked(&self, node: NodeId, name: &str) -> bool {
        self.link_into_named(node, name).is_some()
    }
}
