//! Flattened material descriptors.
//!
//! A host shader graph is reduced to an owning tree of [`MaterialNode`]s.
//! Children are boxed and owned by exactly one parent; nothing is shared.

use std::collections::BTreeMap;

use rootcause::prelude::*;
use tracing::debug;
use variantly::Variantly;

use crate::error::ExportError;
use crate::scene::{MaterialId, SceneSource};

pub(crate) mod flatten;
pub mod json;
pub mod params;

pub use flatten::{FlattenError, Flattener};

/// A literal value or the path of a texture providing it.
#[derive(Debug, Clone, PartialEq)]
pub enum Texturable<T> {
    Value(T),
    Texture(String),
}

impl<T> Texturable<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Texturable::Value(v) => Some(v),
            Texturable::Texture(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Texturable<U> {
        match self {
            Texturable::Value(v) => Texturable::Value(f(v)),
            Texturable::Texture(path) => Texturable::Texture(path),
        }
    }
}

pub type ColorInput = Texturable<[f32; 3]>;
pub type ScalarInput = Texturable<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ndf {
    Ggx,
    Beckmann,
}

impl Ndf {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ndf::Ggx => "GGX",
            Ndf::Beckmann => "BS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowingModel {
    VCavity,
}

impl ShadowingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShadowingModel::VCavity => "vcavity",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Roughness {
    Isotropic(ScalarInput),
    /// Separate roughness along tangent and bitangent.
    Anisotropic([f32; 2]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LambertParams {
    pub albedo: ColorInput,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrenNayarParams {
    pub albedo: ColorInput,
    pub roughness: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TorranceParams {
    pub albedo: ColorInput,
    pub roughness: Roughness,
    pub ndf: Ndf,
    pub shadowing: ShadowingModel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalterParams {
    pub absorption: ColorInput,
    pub roughness: ScalarInput,
    pub ndf: Ndf,
    pub shadowing: ShadowingModel,
    pub ior: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    Radiance(ColorInput),
    /// Black-body temperature in Kelvin.
    Temperature(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmissiveParams {
    pub emission: Emission,
    pub scale: [f32; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlendParams {
    pub layer_a: Box<MaterialNode>,
    pub layer_b: Box<MaterialNode>,
    pub factor_a: f32,
    pub factor_b: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FresnelParams {
    pub ior: f32,
    pub reflection: Box<MaterialNode>,
    pub refraction: Box<MaterialNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisneyParams {
    pub base_color: ColorInput,
    pub scatter_distance: [f32; 3],
    pub metallic: f32,
    pub roughness: f32,
    pub anisotropic: f32,
    pub spec_trans: f32,
    pub ior: f32,
    pub specular_tint: f32,
    pub sheen: f32,
    pub sheen_tint: f32,
    pub clearcoat: f32,
    pub clearcoat_roughness: f32,
}

#[derive(Debug, Clone, PartialEq, Variantly)]
pub enum MaterialNode {
    Lambert(LambertParams),
    OrenNayar(OrenNayarParams),
    Torrance(TorranceParams),
    Walter(WalterParams),
    /// Walter with the full microfacet reflection/refraction model.
    Microfacet(WalterParams),
    Emissive(EmissiveParams),
    Blend(BlendParams),
    Fresnel(FresnelParams),
    Disney(DisneyParams),
}

impl MaterialNode {
    pub fn type_name(&self) -> &'static str {
        match self {
            MaterialNode::Lambert(_) => "lambert",
            MaterialNode::OrenNayar(_) => "orennayar",
            MaterialNode::Torrance(_) => "torrance",
            MaterialNode::Walter(_) => "walter",
            MaterialNode::Microfacet(_) => "microfacet",
            MaterialNode::Emissive(_) => "emissive",
            MaterialNode::Blend(_) => "blend",
            MaterialNode::Fresnel(_) => "fresnel",
            MaterialNode::Disney(_) => "disney",
        }
    }

    /// True if this node or any layer below it emits with a positive scale.
    pub fn emits(&self) -> bool {
        match self {
            MaterialNode::Emissive(e) => e.scale.iter().any(|s| *s > 0.0),
            MaterialNode::Blend(b) => b.layer_a.emits() || b.layer_b.emits(),
            MaterialNode::Fresnel(f) => f.reflection.emits() || f.refraction.emits(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Displacement {
    pub map: String,
    pub bias: f32,
    pub scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Medium {
    pub ior: f32,
    pub absorption: [f32; 3],
}

/// A fully flattened material. Alpha, displacement and the outer medium only
/// ever attach to the root.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub root: MaterialNode,
    pub alpha: Option<String>,
    pub displacement: Option<Displacement>,
    pub outer_medium: Option<Medium>,
}

impl Material {
    pub fn new(name: impl Into<String>, root: MaterialNode) -> Self {
        Material {
            name: name.into(),
            root,
            alpha: None,
            displacement: None,
            outer_medium: None,
        }
    }

    pub fn is_emissive(&self) -> bool {
        self.root.emits()
    }
}

/// Map a `[0,1]` transmission color to a physical absorption coefficient.
pub fn mapped_absorption(color: [f32; 3]) -> [f32; 3] {
    color.map(|c| (1.0 / (1e-10 + c) - 1.0).max(0.0))
}

#[derive(Debug, Clone)]
pub struct MaterialEntry {
    pub id: MaterialId,
    pub name: String,
    /// `None` when the material has no connected surface output.
    pub material: Option<Material>,
}

/// Flattened materials in export order. The position of an entry is the
/// material index stored in the binary.
#[derive(Debug, Clone, Default)]
pub struct MaterialTable {
    entries: Vec<MaterialEntry>,
    index: BTreeMap<MaterialId, u16>,
}

impl MaterialTable {
    /// Materials referenced by the slots of live mesh objects, in order of
    /// first use.
    pub fn used_materials(scene: &dyn SceneSource) -> Vec<MaterialId> {
        let mut used = Vec::new();
        for object in scene.objects() {
            if object.users == 0 || !(object.kind.is_mesh() || object.perfect_sphere) {
                continue;
            }
            for slot in object.material_slots.iter().flatten() {
                if !used.contains(slot) {
                    used.push(*slot);
                }
            }
        }
        used
    }

    /// Flatten every used material. The first failure aborts.
    pub fn flatten_used(
        scene: &dyn SceneSource,
        flattener: &mut Flattener<'_>,
    ) -> Result<Self, Report<ExportError>> {
        let used = Self::used_materials(scene);
        if used.is_empty() {
            return Err(Report::new(ExportError::NoMaterials));
        }
        let mut table = MaterialTable::default();
        for id in used {
            let Some(data) = scene.material(id) else {
                continue;
            };
            debug!("flattening material '{}'", data.name);
            let material = flattener.flatten(data).context(ExportError::Material {
                name: data.name.clone(),
            })?;
            table.push(id, data.name.clone(), material)?;
        }
        Ok(table)
    }

    pub fn push(
        &mut self,
        id: MaterialId,
        name: String,
        material: Option<Material>,
    ) -> Result<u16, Report<ExportError>> {
        let index = u16::try_from(self.entries.len())
            .map_err(|_| Report::new(ExportError::TooManyMaterials(self.entries.len() + 1)))?;
        self.entries.push(MaterialEntry { id, name, material });
        self.index.insert(id, index);
        Ok(index)
    }

    pub fn index_of(&self, id: MaterialId) -> Option<u16> {
        self.index.get(&id).copied()
    }

    pub fn entries(&self) -> &[MaterialEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_emissive(&self, index: u16) -> bool {
        self.entries
            .get(usize::from(index))
            .and_then(|e| e.material.as_ref())
            .is_some_and(Material::is_emissive)
    }
}
