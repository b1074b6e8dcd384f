//! Read-only view of the authoring tool's scene graph.
//!
//! The exporter never mutates host state. Everything time-dependent takes an
//! explicit [`Frame`] so sampling is a pure function of the requested frame.

use glam::Mat4;
use rootcause::Report;
use thiserror::Error;
use variantly::Variantly;

use crate::recognized::{FromIdentifier, Recognized};

mod memory;
mod mesh;
mod shader;

pub use memory::MemoryScene;
pub use mesh::{CornerLayer, Edge, Face, Mesh, VertexWeight};
pub use shader::{
    Distribution, Link, NodeId, NodeKind, ShaderGraph, ShaderNode, SkyTexture, Socket, SocketValue,
};

pub type Frame = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeshId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaterialId(pub usize);

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("object {0:?} does not exist")]
    NoSuchObject(ObjectId),
    #[error("object '{0}' has no mesh data")]
    NotAMesh(String),
    #[error("armature '{armature}' has no bone {bone}")]
    NoSuchBone { armature: String, bone: usize },
    #[error("host evaluation failed: {0}")]
    Host(String),
}

/// Accessors the exporter needs from the host application.
///
/// Implementations that create temporary host state while evaluating (for
/// example a modifier-applied mesh copy) must release it before returning,
/// on success and on error.
pub trait SceneSource {
    fn objects(&self) -> &[Object];

    fn materials(&self) -> &[MaterialData];

    fn scenes(&self) -> &[SceneInfo];

    /// Index into [`SceneSource::scenes`] of the scene the user exports from.
    fn active_scene(&self) -> usize;

    /// World transform of `object` at `frame`, in authoring space.
    fn world_matrix(&self, object: ObjectId, frame: Frame) -> Result<Mat4, Report<SceneError>>;

    /// Mesh of `object` with modifiers applied at `frame`.
    ///
    /// With `rest_pose` set, armature deformation is left out so skinned
    /// meshes come back in bind pose.
    fn evaluated_mesh(
        &self,
        object: ObjectId,
        frame: Frame,
        rest_pose: bool,
    ) -> Result<Mesh, Report<SceneError>>;

    /// World-space rest and pose matrices of one bone at `frame`.
    fn bone_pose(
        &self,
        armature: ObjectId,
        bone: usize,
        frame: Frame,
    ) -> Result<BonePose, Report<SceneError>>;

    /// Near and far clip distances of the interactive viewport.
    fn viewport_clip(&self) -> (f32, f32);

    fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects().get(id.0)
    }

    fn material(&self, id: MaterialId) -> Option<&MaterialData> {
        self.materials().get(id.0)
    }

    fn object_ids(&self) -> Box<dyn Iterator<Item = ObjectId> + '_> {
        Box::new((0..self.objects().len()).map(ObjectId))
    }
}

#[derive(Debug, Clone)]
pub struct Object {
    pub name: String,
    pub kind: ObjectKind,
    /// Number of users of the object datablock. Zero means orphaned.
    pub users: u32,
    pub parent: Option<ObjectId>,
    pub selected: bool,
    pub material_slots: Vec<Option<MaterialId>>,
    /// Exported as an analytic sphere instead of a mesh.
    pub perfect_sphere: bool,
    pub has_constraints: bool,
    pub has_animation_data: bool,
    pub modifiers: Vec<Modifier>,
    /// Vertex group names, indexed by [`VertexWeight::group`].
    pub vertex_groups: Vec<String>,
    pub lod: Option<LodLink>,
}

impl Object {
    pub fn new(name: impl Into<String>, kind: ObjectKind) -> Self {
        Object {
            name: name.into(),
            kind,
            users: 1,
            parent: None,
            selected: false,
            material_slots: Vec::new(),
            perfect_sphere: false,
            has_constraints: false,
            has_animation_data: false,
            modifiers: Vec::new(),
            vertex_groups: Vec::new(),
            lod: None,
        }
    }

    pub fn has_armature_modifier(&self) -> bool {
        self.modifiers.iter().any(Modifier::is_armature)
    }

    pub fn fluid_role(&self) -> Option<FluidRole> {
        self.modifiers.iter().find_map(|m| match m {
            Modifier::Fluid(role) => Some(*role),
            _ => None,
        })
    }

    pub fn has_cloth(&self) -> bool {
        self.modifiers.iter().any(Modifier::is_cloth)
    }
}

#[derive(Debug, Clone, Variantly)]
pub enum ObjectKind {
    Mesh(MeshRef),
    Camera(Camera),
    Light(Light),
    Armature(Armature),
    Empty,
}

/// Identity and face count of the (unevaluated) mesh datablock an object uses.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshRef {
    pub id: MeshId,
    pub name: String,
    pub faces: usize,
}

/// Link to the next, coarser level of a LOD chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LodLink {
    pub next: ObjectId,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Variantly)]
pub enum Modifier {
    Armature,
    Cloth,
    Fluid(FluidRole),
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluidRole {
    /// The simulated volume; exported per frame.
    Domain,
    /// An inflow participant; never exported.
    Fluid,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Perspective,
    Orthographic,
}

impl FromIdentifier for Projection {
    fn from_identifier(id: &str) -> Option<Self> {
        match id {
            "PERSP" => Some(Projection::Perspective),
            "ORTHO" => Some(Projection::Orthographic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthOfField {
    pub fstop: f32,
    pub focus_distance: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub projection: Recognized<Projection>,
    /// Horizontal field of view in radians.
    pub angle: f32,
    /// Focal length in millimetres.
    pub lens: f32,
    pub dof: Option<DepthOfField>,
    pub ortho_scale: f32,
    /// Users of the camera datablock.
    pub users: u32,
}

impl Camera {
    pub fn perspective(angle: f32) -> Self {
        Camera {
            projection: Recognized::Known(Projection::Perspective),
            angle,
            lens: 50.0,
            dof: None,
            ortho_scale: 1.0,
            users: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Point,
    Sun,
    Spot,
}

impl FromIdentifier for LightKind {
    fn from_identifier(id: &str) -> Option<Self> {
        match id {
            "POINT" => Some(LightKind::Point),
            "SUN" => Some(LightKind::Sun),
            "SPOT" => Some(LightKind::Spot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub kind: Recognized<LightKind>,
    pub color: [f32; 3],
    pub energy: f32,
    pub shadow_soft_size: f32,
    /// Full cone angle in radians.
    pub spot_size: f32,
    pub spot_blend: f32,
    pub users: u32,
    /// Emission node tree, when the light uses nodes.
    pub nodes: Option<ShaderGraph>,
}

impl Light {
    pub fn new(kind: LightKind, color: [f32; 3], energy: f32) -> Self {
        Light {
            kind: Recognized::Known(kind),
            color,
            energy,
            shadow_soft_size: 0.0,
            spot_size: std::f32::consts::FRAC_PI_4,
            spot_blend: 0.15,
            users: 1,
            nodes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Armature {
    pub bones: Vec<Bone>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bone {
    pub name: String,
    /// Object drawn in place of the bone in the viewport. Never exported.
    pub custom_shape: Option<ObjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BonePose {
    pub rest: Mat4,
    pub pose: Mat4,
}

/// Optional medium surrounding an object, attached to its material.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OuterMedium {
    pub ior: f32,
    pub transmission: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialData {
    pub name: String,
    /// `None` for materials that do not use a node tree.
    pub graph: Option<ShaderGraph>,
    pub outer_medium: Option<OuterMedium>,
}

#[derive(Debug, Clone)]
pub struct SceneInfo {
    pub name: String,
    pub frame_start: Frame,
    pub frame_end: Frame,
    pub frame_current: Frame,
    pub resolution: [u32; 2],
    pub camera: Option<ObjectId>,
    pub world: Option<ShaderGraph>,
    pub objects: Vec<ObjectId>,
}

impl SceneInfo {
    /// Frames to sample: the whole range when animating, the current frame otherwise.
    pub fn frames(&self, animated: bool) -> Vec<Frame> {
        if animated {
            (self.frame_start..=self.frame_end).collect()
        } else {
            vec![self.frame_current]
        }
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.objects.contains(&object)
    }
}
