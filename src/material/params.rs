//! Flattened materials bound to a live renderer's handle tables.
//!
//! Instead of a descriptor document, every texture reference becomes a handle
//! returned by the renderer. Constant colors and scalars are uploaded as
//! single-texel value textures so the renderer only ever samples textures.

use rootcause::Report;
use thiserror::Error;
use tracing::debug;

use super::{
    ColorInput, Emission, Material, MaterialNode, MaterialTable, Ndf, Roughness, ScalarInput,
    ShadowingModel, Texturable, WalterParams,
};

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("material '{material}': {what} is not supported by the live renderer")]
    Unsupported { material: String, what: String },
    #[error("material '{material}': renderer rejected {what}")]
    Rejected { material: String, what: String },
}

/// Handle tables of a live renderer. Every `add_*` returns `None` on failure.
pub trait TextureRegistry {
    type Texture: Clone;
    type Material;

    fn add_texture(&mut self, path: &str) -> Option<Self::Texture>;

    /// A single-texel texture holding `values` (1 or 4 channels).
    fn add_value_texture(&mut self, values: &[f32]) -> Option<Self::Texture>;

    fn add_material(
        &mut self,
        name: &str,
        params: &MaterialParams<Self::Texture>,
    ) -> Option<Self::Material>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediumParams {
    /// Real and imaginary part.
    pub ior: [f32; 2],
    pub absorption: [f32; 3],
}

impl Default for MediumParams {
    fn default() -> Self {
        MediumParams {
            ior: [1.0, 1.0],
            absorption: [0.0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementParams<T> {
    pub map: T,
    pub bias: f32,
    pub scale: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MicrofacetParams<T> {
    pub roughness: T,
    pub shadowing: ShadowingModel,
    pub ndf: Ndf,
    pub absorption: [f32; 3],
    pub ior: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InnerParams<T> {
    Lambert {
        albedo: T,
    },
    OrenNayar {
        albedo: T,
        roughness: f32,
    },
    Torrance {
        roughness: T,
        shadowing: ShadowingModel,
        ndf: Ndf,
        albedo: T,
    },
    Walter(MicrofacetParams<T>),
    Microfacet(MicrofacetParams<T>),
    Emissive {
        radiance: T,
        scale: [f32; 3],
    },
    Blend {
        a: Box<MaterialParams<T>>,
        b: Box<MaterialParams<T>>,
        factor_a: f32,
        factor_b: f32,
    },
    Fresnel {
        ior: [f32; 2],
        refraction: Box<MaterialParams<T>>,
        reflection: Box<MaterialParams<T>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialParams<T> {
    pub outer_medium: MediumParams,
    pub alpha: Option<T>,
    pub displacement: Option<DisplacementParams<T>>,
    pub inner: InnerParams<T>,
}

struct Binder<'r, R: TextureRegistry> {
    registry: &'r mut R,
    material: &'r str,
}

impl<R: TextureRegistry> Binder<'_, R> {
    fn rejected(&self, what: impl Into<String>) -> Report<ParamsError> {
        Report::new(ParamsError::Rejected {
            material: self.material.to_string(),
            what: what.into(),
        })
    }

    fn unsupported(&self, what: impl Into<String>) -> Report<ParamsError> {
        Report::new(ParamsError::Unsupported {
            material: self.material.to_string(),
            what: what.into(),
        })
    }

    fn path(&mut self, path: &str) -> Result<R::Texture, Report<ParamsError>> {
        self.registry
            .add_texture(path)
            .ok_or_else(|| self.rejected(format!("texture '{path}'")))
    }

    fn values(&mut self, values: &[f32]) -> Result<R::Texture, Report<ParamsError>> {
        self.registry
            .add_value_texture(values)
            .ok_or_else(|| self.rejected(format!("value texture {values:?}")))
    }

    fn color(&mut self, input: &ColorInput) -> Result<R::Texture, Report<ParamsError>> {
        match input {
            Texturable::Value([r, g, b]) => self.values(&[*r, *g, *b, 1.0]),
            Texturable::Texture(path) => self.path(path),
        }
    }

    fn scalar(&mut self, input: &ScalarInput) -> Result<R::Texture, Report<ParamsError>> {
        match input {
            Texturable::Value(v) => self.values(&[*v]),
            Texturable::Texture(path) => self.path(path),
        }
    }

    fn microfacet(
        &mut self,
        w: &WalterParams,
    ) -> Result<MicrofacetParams<R::Texture>, Report<ParamsError>> {
        let Texturable::Value(absorption) = w.absorption else {
            return Err(self.unsupported("textured absorption"));
        };
        Ok(MicrofacetParams {
            roughness: self.scalar(&w.roughness)?,
            shadowing: w.shadowing,
            ndf: w.ndf,
            absorption,
            ior: w.ior,
        })
    }

    fn node(&mut self, node: &MaterialNode) -> Result<MaterialParams<R::Texture>, Report<ParamsError>> {
        let inner = match node {
            MaterialNode::Lambert(p) => InnerParams::Lambert {
                albedo: self.color(&p.albedo)?,
            },
            MaterialNode::OrenNayar(p) => InnerParams::OrenNayar {
                albedo: self.color(&p.albedo)?,
                roughness: p.roughness,
            },
            MaterialNode::Torrance(p) => {
                let roughness = match &p.roughness {
                    Roughness::Isotropic(r) => self.scalar(r)?,
                    Roughness::Anisotropic(uv) => self.values(uv)?,
                };
                InnerParams::Torrance {
                    roughness,
                    shadowing: p.shadowing,
                    ndf: p.ndf,
                    albedo: self.color(&p.albedo)?,
                }
            }
            MaterialNode::Walter(p) => InnerParams::Walter(self.microfacet(p)?),
            MaterialNode::Microfacet(p) => InnerParams::Microfacet(self.microfacet(p)?),
            MaterialNode::Emissive(p) => {
                let Emission::Radiance(radiance) = &p.emission else {
                    return Err(self.unsupported("black-body emission"));
                };
                InnerParams::Emissive {
                    radiance: self.color(radiance)?,
                    scale: p.scale,
                }
            }
            MaterialNode::Blend(p) => InnerParams::Blend {
                a: Box::new(self.node(&p.layer_a)?),
                b: Box::new(self.node(&p.layer_b)?),
                factor_a: p.factor_a,
                factor_b: p.factor_b,
            },
            MaterialNode::Fresnel(p) => InnerParams::Fresnel {
                ior: [p.ior, 0.0],
                refraction: Box::new(self.node(&p.refraction)?),
                reflection: Box::new(self.node(&p.reflection)?),
            },
            MaterialNode::Disney(_) => return Err(self.unsupported("principled shading")),
        };
        Ok(MaterialParams {
            outer_medium: MediumParams::default(),
            alpha: None,
            displacement: None,
            inner,
        })
    }
}

/// Bind one flattened material to renderer handles.
pub fn bind_material<R: TextureRegistry>(
    registry: &mut R,
    material: &Material,
) -> Result<MaterialParams<R::Texture>, Report<ParamsError>> {
    let mut binder = Binder {
        registry,
        material: &material.name,
    };
    let mut params = binder.node(&material.root)?;
    if let Some(alpha) = &material.alpha {
        params.alpha = Some(binder.path(alpha)?);
    }
    if let Some(d) = &material.displacement {
        params.displacement = Some(DisplacementParams {
            map: binder.path(&d.map)?,
            bias: d.bias,
            scale: d.scale,
        });
    }
    if let Some(m) = material.outer_medium {
        params.outer_medium = MediumParams {
            ior: [m.ior, m.ior],
            absorption: m.absorption,
        };
    }
    Ok(params)
}

/// Bind and register every flattened material of `table`, in table order.
/// Materials without a surface are skipped.
pub fn register_materials<R: TextureRegistry>(
    registry: &mut R,
    table: &MaterialTable,
) -> Result<Vec<R::Material>, Report<ParamsError>> {
    let mut handles = Vec::with_capacity(table.len());
    for entry in table.entries() {
        let Some(material) = &entry.material else {
            debug!("skipping material '{}' (no surface)", entry.name);
            continue;
        };
        let params = bind_material(registry, material)?;
        let handle = registry.add_material(&material.name, &params).ok_or_else(|| {
            Report::new(ParamsError::Rejected {
                material: material.name.clone(),
                what: "the material".to_string(),
            })
        })?;
        handles.push(handle);
    }
    Ok(handles)
}
