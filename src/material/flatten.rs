use rootcause::prelude::*;
use thiserror::Error;
use tracing::{debug, trace};

use super::{
    BlendParams, ColorInput, Displacement, DisneyParams, Emission, EmissiveParams, FresnelParams,
    LambertParams, Material, MaterialNode, Medium, Ndf, OrenNayarParams, Roughness, ScalarInput,
    ShadowingModel, Texturable, TorranceParams, WalterParams, mapped_absorption,
};
use crate::bake::{BakeRequest, TextureBaker, baked_texture_path, relative_image_path};
use crate::error::Diagnostics;
use crate::recognized::Recognized;
use crate::scene::{Distribution, Link, MaterialData, NodeId, NodeKind, ShaderGraph, ShaderNode};

#[derive(Debug, Error)]
pub enum FlattenError {
    #[error("unsupported shader node '{node}' ({kind})")]
    UnsupportedNode { node: String, kind: String },
    #[error("non-value where only value is expected (node '{node}.{input}')")]
    LinkedInput { node: String, input: String },
    #[error("node '{node}' has no usable input '{input}'")]
    MissingInput { node: String, input: String },
    #[error("missing mixed-shader input (node '{0}')")]
    MissingMixInput(String),
    #[error("invalid shader blend combination {a} with {b} (node '{node}')")]
    InvalidBlend { a: String, b: String, node: String },
    #[error("invalid shader fresnel combination {a} with {b} (node '{node}')")]
    InvalidFresnel { a: String, b: String, node: String },
    #[error("cannot use 'Facing' output from layer weight for mixing shaders (node '{0}')")]
    FacingOutput(String),
    #[error("material may not have more than one alpha blending (node '{0}')")]
    MultipleAlpha(String),
    #[error("blend input for mix shader has to be 'Alpha' if it comes from a texture node (node '{0}')")]
    AlphaSocket(String),
    #[error("alpha blending requires one transparent node for the mix shader (node '{0}')")]
    AlphaWithoutTransparent(String),
    #[error("invalid mix-shader factor input (node '{0}')")]
    InvalidFactor(String),
    #[error("glass cannot have non-value color since absorption must not be a texture (node '{0}')")]
    TexturedGlass(String),
    #[error("goniometric emission is not supported (node '{0}')")]
    Goniometric(String),
    #[error("image texture node '{0}' has no image")]
    MissingImage(String),
    #[error("input of node '{0}' could not be baked")]
    Bake(String),
}

type FResult<T> = Result<T, Report<FlattenError>>;

pub(crate) fn kind_label(node: &ShaderNode) -> String {
    match &node.kind {
        Recognized::Known(kind) => format!("{kind:?}"),
        Recognized::Unknown(raw) => raw.clone(),
    }
}

/// Scalar default of an input that must not be linked.
pub(crate) fn value_only(graph: &ShaderGraph, node: NodeId, input: &str) -> FResult<f32> {
    let n = graph.node(node);
    check_unlinked(graph, node, input)?;
    n.input(input)
        .and_then(|s| s.default.as_float())
        .ok_or_else(|| missing_input(n, input))
}

/// Color default of an input that must not be linked.
pub(crate) fn value_only_color(graph: &ShaderGraph, node: NodeId, input: &str) -> FResult<[f32; 3]> {
    let n = graph.node(node);
    check_unlinked(graph, node, input)?;
    n.input(input)
        .and_then(|s| s.default.as_color())
        .ok_or_else(|| missing_input(n, input))
}

fn check_unlinked(graph: &ShaderGraph, node: NodeId, input: &str) -> FResult<()> {
    if graph.is_linked(node, input) {
        return Err(Report::new(FlattenError::LinkedInput {
            node: graph.node(node).name.clone(),
            input: input.to_string(),
        }));
    }
    Ok(())
}

fn missing_input(node: &ShaderNode, input: &str) -> Report<FlattenError> {
    Report::new(FlattenError::MissingInput {
        node: node.name.clone(),
        input: input.to_string(),
    })
}

fn valid_pair(a: &MaterialNode, b: &MaterialNode, pairs: &[(&str, &str)]) -> bool {
    let (a, b) = (a.type_name(), b.type_name());
    pairs
        .iter()
        .any(|(x, y)| (a == *x && b == *y) || (a == *y && b == *x))
}

const BLEND_PAIRS: &[(&str, &str)] = &[
    ("lambert", "emissive"),
    ("lambert", "torrance"),
    ("walter", "torrance"),
];

const FRESNEL_PAIRS: &[(&str, &str)] = &[("lambert", "torrance"), ("walter", "torrance")];

/// Converts host shader graphs into [`Material`] trees.
///
/// Procedural inputs are rasterized through the [`TextureBaker`] when baking
/// is enabled; otherwise only the path they would be baked to is recorded.
pub struct Flattener<'a> {
    bake_textures: bool,
    baker: &'a mut dyn TextureBaker,
    diagnostics: &'a mut Diagnostics,
}

/// The material currently being flattened.
#[derive(Clone, Copy)]
struct Ctx<'g> {
    material: &'g str,
    graph: &'g ShaderGraph,
}

impl Ctx<'_> {
    fn node(&self, id: NodeId) -> &ShaderNode {
        self.graph.node(id)
    }

    fn is(&self, id: NodeId, kind: NodeKind) -> bool {
        self.node(id).is(kind)
    }
}

impl<'a> Flattener<'a> {
    pub fn new(
        bake_textures: bool,
        baker: &'a mut dyn TextureBaker,
        diagnostics: &'a mut Diagnostics,
    ) -> Self {
        Flattener {
            bake_textures,
            baker,
            diagnostics,
        }
    }

    /// Flatten one material.
    ///
    /// Returns `Ok(None)` for materials without a node tree, without an active
    /// material output, or whose output has nothing connected to its surface.
    pub fn flatten(&mut self, material: &MaterialData) -> FResult<Option<Material>> {
        let Some(graph) = &material.graph else {
            debug!("material '{}' does not use nodes; skipping", material.name);
            return Ok(None);
        };
        let Some(output) = graph.active_output(NodeKind::OutputMaterial) else {
            debug!("material '{}' has no active output; skipping", material.name);
            return Ok(None);
        };
        let Some(surface) = graph.link_into_named(output, "Surface") else {
            debug!("material '{}' has no surface link; skipping", material.name);
            return Ok(None);
        };
        let ctx = Ctx {
            material: &material.name,
            graph,
        };

        let first = surface.from_node;
        let (root, alpha) = if ctx.is(first, NodeKind::MixShader) {
            self.mix(ctx, first, false)?
        } else if ctx.is(first, NodeKind::BsdfGlass) {
            (self.glass(ctx, first)?, None)
        } else {
            (self.leaf(ctx, first)?, None)
        };

        let displacement = self.displacement(ctx, output)?;
        if graph.is_linked(output, "Volume") {
            self.diagnostics
                .warn(&material.name, "volume output is not supported yet");
        }

        let outer_medium = material.outer_medium.map(|m| Medium {
            ior: m.ior,
            absorption: mapped_absorption(m.transmission),
        });

        Ok(Some(Material {
            name: material.name.clone(),
            root,
            alpha,
            displacement,
            outer_medium,
        }))
    }

    // ── Inputs ──

    fn image_input(&mut self, ctx: Ctx<'_>, link: &Link, is_scalar: bool) -> FResult<String> {
        let from = ctx.node(link.from_node);
        if from.is(NodeKind::TexImage) {
            return from
                .image
                .as_ref()
                .map(|path| relative_image_path(path))
                .ok_or_else(|| Report::new(FlattenError::MissingImage(from.name.clone())));
        }

        let path = baked_texture_path(ctx.material, &from.name);
        if self.bake_textures {
            debug!("baking '{}' of material '{}'", from.name, ctx.material);
            self.baker
                .bake(&BakeRequest {
                    material: ctx.material,
                    node: &from.name,
                    output_socket: &link.from_socket,
                    is_scalar,
                    path: &path,
                })
                .context(FlattenError::Bake(from.name.clone()))?;
        }
        Ok(path)
    }

    fn color_input(&mut self, ctx: Ctx<'_>, node: NodeId, input: &str) -> FResult<ColorInput> {
        match ctx.graph.link_into_named(node, input) {
            Some(link) => Ok(Texturable::Texture(self.image_input(ctx, link, false)?)),
            None => ctx
                .node(node)
                .input(input)
                .and_then(|s| s.default.as_color())
                .map(Texturable::Value)
                .ok_or_else(|| missing_input(ctx.node(node), input)),
        }
    }

    fn scalar_input(&mut self, ctx: Ctx<'_>, node: NodeId, input: &str) -> FResult<ScalarInput> {
        match ctx.graph.link_into_named(node, input) {
            Some(link) => Ok(Texturable::Texture(self.image_input(ctx, link, true)?)),
            None => ctx
                .node(node)
                .input(input)
                .and_then(|s| s.default.as_float())
                .map(Texturable::Value)
                .ok_or_else(|| missing_input(ctx.node(node), input)),
        }
    }

    fn distribution(&mut self, ctx: Ctx<'_>, node: NodeId) -> Ndf {
        let n = ctx.node(node);
        match &n.distribution {
            None => Ndf::Ggx,
            Some(Recognized::Known(Distribution::Beckmann)) => Ndf::Beckmann,
            Some(Recognized::Known(_)) => Ndf::Ggx,
            Some(Recognized::Unknown(raw)) => {
                self.diagnostics.warn(
                    ctx.material,
                    format!(
                        "unknown microfacet distribution '{raw}'; defaulting to GGX (node '{}')",
                        n.name
                    ),
                );
                Ndf::Ggx
            }
        }
    }

    /// Roughness of a microfacet node. Scalars are squared to match the
    /// host renderer's parameterization.
    fn microfacet_roughness(&mut self, ctx: Ctx<'_>, node: NodeId) -> FResult<ScalarInput> {
        let sharp = matches!(
            ctx.node(node).distribution,
            Some(Recognized::Known(Distribution::Sharp))
        );
        let roughness = if sharp {
            Texturable::Value(0.0)
        } else {
            self.scalar_input(ctx, node, "Roughness")?
        };
        Ok(roughness.map(|r| r * r))
    }

    // ── Leaf nodes ──

    fn leaf(&mut self, ctx: Ctx<'_>, node: NodeId) -> FResult<MaterialNode> {
        let n = ctx.node(node);
        trace!("flattening node '{}'", n.name);
        match n.kind.known() {
            Some(NodeKind::BsdfDiffuse) => self.diffuse(ctx, node),
            Some(NodeKind::BsdfGlossy | NodeKind::BsdfAnisotropic) => {
                Ok(MaterialNode::Torrance(self.torrance(ctx, node)?))
            }
            Some(NodeKind::BsdfGlass | NodeKind::BsdfRefraction) => {
                Ok(MaterialNode::Walter(self.walter(ctx, node)?))
            }
            Some(NodeKind::Emission) => self.emissive(ctx, node),
            Some(NodeKind::BsdfPrincipled) => self.disney(ctx, node),
            _ => Err(Report::new(FlattenError::UnsupportedNode {
                node: n.name.clone(),
                kind: kind_label(n),
            })),
        }
    }

    fn diffuse(&mut self, ctx: Ctx<'_>, node: NodeId) -> FResult<MaterialNode> {
        let roughness = value_only(ctx.graph, node, "Roughness")?;
        let albedo = self.color_input(ctx, node, "Color")?;
        if roughness == 0.0 {
            Ok(MaterialNode::Lambert(LambertParams { albedo }))
        } else {
            Ok(MaterialNode::OrenNayar(OrenNayarParams { albedo, roughness }))
        }
    }

    fn torrance(&mut self, ctx: Ctx<'_>, node: NodeId) -> FResult<TorranceParams> {
        let albedo = self.color_input(ctx, node, "Color")?;
        let isotropic = self.microfacet_roughness(ctx, node)?;
        let ndf = self.distribution(ctx, node);

        let mut roughness = Roughness::Isotropic(isotropic.clone());
        if ctx.is(node, NodeKind::BsdfAnisotropic) {
            let a = value_only(ctx.graph, node, "Anisotropy")?.clamp(-0.99, 0.99);
            if let Texturable::Value(r) = isotropic {
                let (lo, hi) = (r * (1.0 - a.abs()), r * (1.0 + a.abs()));
                roughness = Roughness::Anisotropic(if a < 0.0 { [hi, lo] } else { [lo, hi] });
            }
            let rotated = ctx.graph.is_linked(node, "Rotation")
                || ctx
                    .node(node)
                    .input("Rotation")
                    .and_then(|s| s.default.as_float())
                    .is_some_and(|r| r != 0.0);
            if rotated {
                self.diagnostics.warn(
                    ctx.material,
                    "non-zero anisotropic rotation can currently not be converted properly",
                );
            }
            for input in ["Normal", "Tangent"] {
                if ctx.graph.is_linked(node, input) {
                    self.diagnostics.warn(
                        ctx.material,
                        format!("{} input is currently ignored", input.to_lowercase()),
                    );
                }
            }
        }

        Ok(TorranceParams {
            albedo,
            roughness,
            ndf,
            shadowing: ShadowingModel::VCavity,
        })
    }

    fn walter(&mut self, ctx: Ctx<'_>, node: NodeId) -> FResult<WalterParams> {
        let absorption = self.color_input(ctx, node, "Color")?.map(mapped_absorption);
        let roughness = self.microfacet_roughness(ctx, node)?;
        let ndf = self.distribution(ctx, node);
        let ior = value_only(ctx.graph, node, "IOR")?;
        Ok(WalterParams {
            absorption,
            roughness,
            ndf,
            shadowing: ShadowingModel::VCavity,
            ior,
        })
    }

    fn glass(&mut self, ctx: Ctx<'_>, node: NodeId) -> FResult<MaterialNode> {
        if ctx.graph.is_linked(node, "Color") {
            return Err(Report::new(FlattenError::TexturedGlass(
                ctx.node(node).name.clone(),
            )));
        }
        Ok(MaterialNode::Microfacet(self.walter(ctx, node)?))
    }

    fn emissive(&mut self, ctx: Ctx<'_>, node: NodeId) -> FResult<MaterialNode> {
        let emission = match ctx.graph.link_into_named(node, "Color") {
            Some(link) if ctx.is(link.from_node, NodeKind::Blackbody) => {
                Emission::Temperature(value_only(ctx.graph, link.from_node, "Temperature")?)
            }
            Some(_) => {
                return Err(Report::new(FlattenError::Goniometric(
                    ctx.node(node).name.clone(),
                )));
            }
            None => Emission::Radiance(self.color_input(ctx, node, "Color")?),
        };
        let scale = value_only(ctx.graph, node, "Strength")?;
        Ok(MaterialNode::Emissive(EmissiveParams {
            emission,
            scale: [scale; 3],
        }))
    }

    fn disney(&mut self, ctx: Ctx<'_>, node: NodeId) -> FResult<MaterialNode> {
        let g = ctx.graph;
        let base_color = self.color_input(ctx, node, "Base Color")?;
        let radius = value_only_color(g, node, "Subsurface Radius")?;
        let subsurface = value_only(g, node, "Subsurface")?;
        let params = DisneyParams {
            base_color,
            scatter_distance: radius.map(|r| r * subsurface),
            metallic: value_only(g, node, "Metallic")?,
            roughness: value_only(g, node, "Roughness")?,
            anisotropic: value_only(g, node, "Anisotropic")?,
            spec_trans: value_only(g, node, "Transmission")?,
            ior: value_only(g, node, "IOR")?,
            specular_tint: value_only(g, node, "Specular Tint")?,
            sheen: value_only(g, node, "Sheen")?,
            sheen_tint: value_only(g, node, "Sheen Tint")?,
            clearcoat: value_only(g, node, "Clearcoat")?,
            clearcoat_roughness: value_only(g, node, "Clearcoat Roughness")?,
        };

        let n = ctx.node(node);
        let rotated = g.is_linked(node, "Anisotropic Rotation")
            || n.input("Anisotropic Rotation")
                .and_then(|s| s.default.as_float())
                .is_some_and(|r| r != 0.0);
        if rotated {
            self.diagnostics
                .warn(ctx.material, "non-zero anisotropic rotation is currently ignored");
        }
        let subsurface_color = n.input("Subsurface Color").and_then(|s| s.default.as_color());
        if subsurface_color.as_ref() != params.base_color.value() {
            self.diagnostics.warn(
                ctx.material,
                "subsurface color differing from base color is currently ignored",
            );
        }
        if g.is_linked(node, "Normal") {
            self.diagnostics
                .warn(ctx.material, "normal input is currently ignored");
        }
        Ok(MaterialNode::Disney(params))
    }

    // ── Mix shaders ──

    /// Flatten a mix shader. The second element is the alpha texture when the
    /// mix factor is a texture's alpha channel.
    fn mix(
        &mut self,
        ctx: Ctx<'_>,
        node: NodeId,
        has_alpha: bool,
    ) -> FResult<(MaterialNode, Option<String>)> {
        let name = ctx.node(node).name.clone();
        let (Some(link_a), Some(link_b)) = (ctx.graph.link_into(node, 1), ctx.graph.link_into(node, 2))
        else {
            return Err(Report::new(FlattenError::MissingMixInput(name)));
        };
        let (node_a, node_b) = (link_a.from_node, link_b.from_node);

        let fac_index = ctx
            .node(node)
            .input_index("Fac")
            .ok_or_else(|| missing_input(ctx.node(node), "Fac"))?;
        let Some(fac_link) = ctx.graph.link_into(node, fac_index) else {
            let fac = ctx.node(node).inputs[fac_index]
                .default
                .as_float()
                .ok_or_else(|| missing_input(ctx.node(node), "Fac"))?;
            return Ok((self.blend(ctx, node, node_a, node_b, fac)?, None));
        };

        let fac_node = fac_link.from_node;
        match ctx.node(fac_node).kind.known() {
            Some(NodeKind::Value) => {
                let fac = ctx
                    .node(fac_node)
                    .outputs
                    .first()
                    .and_then(|s| s.default.as_float())
                    .ok_or_else(|| missing_input(ctx.node(fac_node), "Value"))?;
                Ok((self.blend(ctx, node, node_a, node_b, fac)?, None))
            }
            Some(NodeKind::Fresnel | NodeKind::LayerWeight) => {
                Ok((self.fresnel(ctx, node, fac_link, node_a, node_b)?, None))
            }
            Some(kind) if kind.is_texture() => {
                if has_alpha {
                    return Err(Report::new(FlattenError::MultipleAlpha(name)));
                }
                if fac_link.from_socket != "Alpha" {
                    return Err(Report::new(FlattenError::AlphaSocket(name)));
                }
                let other = if ctx.is(node_a, NodeKind::BsdfTransparent) {
                    node_b
                } else if ctx.is(node_b, NodeKind::BsdfTransparent) {
                    node_a
                } else {
                    return Err(Report::new(FlattenError::AlphaWithoutTransparent(name)));
                };
                let inner = if ctx.is(other, NodeKind::MixShader) {
                    self.mix(ctx, other, true)?.0
                } else if ctx.is(other, NodeKind::BsdfGlass) {
                    self.glass(ctx, other)?
                } else {
                    self.leaf(ctx, other)?
                };
                let alpha = self.image_input(ctx, fac_link, true)?;
                Ok((inner, Some(alpha)))
            }
            _ => Err(Report::new(FlattenError::InvalidFactor(name))),
        }
    }

    fn blend(
        &mut self,
        ctx: Ctx<'_>,
        node: NodeId,
        node_a: NodeId,
        node_b: NodeId,
        fac: f32,
    ) -> FResult<MaterialNode> {
        let layer_a = self.leaf(ctx, node_a)?;
        let layer_b = self.leaf(ctx, node_b)?;
        if !valid_pair(&layer_a, &layer_b, BLEND_PAIRS) {
            return Err(Report::new(FlattenError::InvalidBlend {
                a: kind_label(ctx.node(node_a)),
                b: kind_label(ctx.node(node_b)),
                node: ctx.node(node).name.clone(),
            }));
        }
        // Diffuse surfaces that also emit keep both layers at full weight.
        let emitting_diffuse = [(node_a, node_b), (node_b, node_a)].iter().any(|(d, e)| {
            ctx.is(*d, NodeKind::BsdfDiffuse) && ctx.is(*e, NodeKind::Emission)
        });
        let (factor_a, factor_b) = if emitting_diffuse {
            (1.0, 1.0)
        } else {
            (1.0 - fac, fac)
        };
        Ok(MaterialNode::Blend(BlendParams {
            layer_a: Box::new(layer_a),
            layer_b: Box::new(layer_b),
            factor_a,
            factor_b,
        }))
    }

    fn fresnel(
        &mut self,
        ctx: Ctx<'_>,
        node: NodeId,
        fac_link: &Link,
        node_a: NodeId,
        node_b: NodeId,
    ) -> FResult<MaterialNode> {
        let name = ctx.node(node).name.clone();
        let fac_node = fac_link.from_node;
        let ior = if ctx.is(fac_node, NodeKind::LayerWeight) {
            if fac_link.from_socket == "Facing" {
                return Err(Report::new(FlattenError::FacingOutput(name)));
            }
            1.0 / (1.0 - value_only(ctx.graph, fac_node, "Blend")?.max(0.001))
        } else {
            value_only(ctx.graph, fac_node, "IOR")?
        };
        if ctx.graph.is_linked(fac_node, "Normal") {
            self.diagnostics
                .warn(ctx.material, "normal input is currently ignored");
        }

        let is_glossy =
            |id: NodeId| ctx.is(id, NodeKind::BsdfGlossy) || ctx.is(id, NodeKind::BsdfAnisotropic);
        let glossy_refraction = if is_glossy(node_a) && ctx.is(node_b, NodeKind::BsdfRefraction) {
            Some((node_a, node_b))
        } else if is_glossy(node_b) && ctx.is(node_a, NodeKind::BsdfRefraction) {
            Some((node_b, node_a))
        } else {
            None
        };

        if let Some((glossy, refraction)) = glossy_refraction
            && !ctx.graph.is_linked(glossy, "Color")
        {
            return self.collapse_microfacet(ctx, &name, glossy, refraction, ior);
        }

        let refraction = self.leaf(ctx, node_a)?;
        let reflection = self.leaf(ctx, node_b)?;
        if !valid_pair(&reflection, &refraction, FRESNEL_PAIRS) {
            return Err(Report::new(FlattenError::InvalidFresnel {
                a: kind_label(ctx.node(node_a)),
                b: kind_label(ctx.node(node_b)),
                node: name,
            }));
        }
        Ok(MaterialNode::Fresnel(FresnelParams {
            ior,
            reflection: Box::new(reflection),
            refraction: Box::new(refraction),
        }))
    }

    /// A glossy layer over a refraction layer, mixed by fresnel, is the full
    /// microfacet model. The refractive layer's parameters win.
    fn collapse_microfacet(
        &mut self,
        ctx: Ctx<'_>,
        mix_name: &str,
        glossy: NodeId,
        refraction: NodeId,
        fresnel_ior: f32,
    ) -> FResult<MaterialNode> {
        let mut walter = self.walter(ctx, refraction)?;
        let torrance = self.torrance(ctx, glossy)?;

        if torrance.roughness != Roughness::Isotropic(walter.roughness.clone()) {
            self.disagree(ctx, mix_name, "roughness");
        }
        if torrance.ndf != walter.ndf {
            self.disagree(ctx, mix_name, "ndf");
        }
        let refraction_color = value_only_color(ctx.graph, refraction, "Color").ok();
        let glossy_color = value_only_color(ctx.graph, glossy, "Color").ok();
        if refraction_color != glossy_color {
            self.disagree(ctx, mix_name, "absorption");
        }
        if torrance.shadowing != walter.shadowing {
            self.disagree(ctx, mix_name, "shadowing model");
        }
        if walter.ior != fresnel_ior {
            self.diagnostics.warn(
                ctx.material,
                format!(
                    "refractive layer disagrees with fresnel node about the IOR; using fresnel node's value (node '{mix_name}')"
                ),
            );
            walter.ior = fresnel_ior;
        }
        Ok(MaterialNode::Microfacet(walter))
    }

    fn disagree(&mut self, ctx: Ctx<'_>, mix_name: &str, what: &str) {
        self.diagnostics.warn(
            ctx.material,
            format!(
                "microfacet layers disagree about {what}; using refractive layer's value (node '{mix_name}')"
            ),
        );
    }

    // ── Root-only outputs ──

    fn displacement(&mut self, ctx: Ctx<'_>, output: NodeId) -> FResult<Option<Displacement>> {
        let Some(link) = ctx.graph.link_into_named(output, "Displacement") else {
            return Ok(None);
        };
        let disp = link.from_node;
        if !ctx.is(disp, NodeKind::Displacement) {
            self.diagnostics.warn(
                ctx.material,
                "displacement output is not recognized (must be Displacement node first)",
            );
            return Ok(None);
        }
        let Some(height) = ctx.graph.link_into_named(disp, "Height") else {
            self.diagnostics
                .warn(ctx.material, "displacement height needs an image texture input");
            return Ok(None);
        };
        if !ctx.is(height.from_node, NodeKind::TexImage) {
            self.diagnostics
                .warn(ctx.material, "displacement height input must be an image texture");
            return Ok(None);
        }
        for input in ["Midlevel", "Scale"] {
            if ctx.graph.is_linked(disp, input) {
                self.diagnostics.warn(
                    ctx.material,
                    format!("displacement {} input must be scalar", input.to_lowercase()),
                );
                return Ok(None);
            }
        }
        let map = self.image_input(ctx, height, true)?;
        Ok(Some(Displacement {
            map,
            bias: value_only(ctx.graph, disp, "Midlevel")?,
            scale: value_only(ctx.graph, disp, "Scale")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bake::NoBaker;
    use crate::test_support::{graph_material, nodes};

    struct RecordingBaker(Vec<String>);

    impl TextureBaker for RecordingBaker {
        fn bake(&mut self, request: &BakeRequest<'_>) -> Result<(), Report<crate::bake::BakeError>> {
            self.0.push(request.path.to_string());
            Ok(())
        }
    }

    fn flatten(material: &MaterialData) -> (FResult<Option<Material>>, Diagnostics) {
        let mut diag = Diagnostics::new();
        let mut baker = NoBaker;
        let result = Flattener::new(false, &mut baker, &mut diag).flatten(material);
        (result, diag)
    }

    #[test]
    fn plain_diffuse_becomes_lambert() {
        let material = graph_material("Wall", |g, out| {
            let d = g.add_node(nodes::diffuse([0.8, 0.8, 0.8], 0.0));
            g.connect(d, "BSDF", out, 0);
        });
        let (result, diag) = flatten(&material);
        let m = result.unwrap().unwrap();
        assert_eq!(
            m.root,
            MaterialNode::Lambert(LambertParams {
                albedo: Texturable::Value([0.8, 0.8, 0.8])
            })
        );
        assert!(diag.is_empty());
    }

    #[test]
    fn rough_diffuse_keeps_unsquared_roughness() {
        let material = graph_material("Cloth", |g, out| {
            let d = g.add_node(nodes::diffuse([0.5; 3], 0.4));
            g.connect(d, "BSDF", out, 0);
        });
        let m = flatten(&material).0.unwrap().unwrap();
        let on = m.root.oren_nayar().unwrap();
        assert_eq!(on.roughness, 0.4);
    }

    #[test]
    fn linked_diffuse_roughness_is_rejected() {
        let material = graph_material("Bad", |g, out| {
            let d = g.add_node(nodes::diffuse([0.5; 3], 0.4));
            let v = g.add_node(nodes::value(0.3));
            g.connect(v, "Value", d, 1);
            g.connect(d, "BSDF", out, 0);
        });
        let err = flatten(&material).0.unwrap_err();
        assert!(matches!(err.current_context(), FlattenError::LinkedInput { .. }));
    }

    #[test]
    fn unconnected_output_is_skipped() {
        let material = graph_material("Empty", |_, _| {});
        assert!(flatten(&material).0.unwrap().is_none());
        let no_nodes = MaterialData {
            name: "Legacy".into(),
            graph: None,
            outer_medium: None,
        };
        assert!(flatten(&no_nodes).0.unwrap().is_none());
    }

    #[test]
    fn glossy_is_squared() {
        let material = graph_material("Metal", |g, out| {
            let s = g.add_node(nodes::glossy([0.9; 3], 0.5, Distribution::Beckmann));
            g.connect(s, "BSDF", out, 0);
        });
        let m = flatten(&material).0.unwrap().unwrap();
        let t = m.root.torrance().unwrap();
        assert_eq!(t.roughness, Roughness::Isotropic(Texturable::Value(0.25)));
        assert_eq!(t.ndf, Ndf::Beckmann);
    }

    #[test]
    fn anisotropy_splits_roughness() {
        let material = graph_material("Brushed", |g, out| {
            let s = g.add_node(nodes::anisotropic([0.9; 3], 0.5, -0.5));
            g.connect(s, "BSDF", out, 0);
        });
        let m = flatten(&material).0.unwrap().unwrap();
        let t = m.root.torrance().unwrap();
        let Roughness::Anisotropic([u, v]) = t.roughness else {
            panic!("expected anisotropic roughness");
        };
        assert!((u - 0.375).abs() < 1e-6);
        assert!((v - 0.125).abs() < 1e-6);
    }

    #[test]
    fn fresnel_glossy_over_refraction_collapses() {
        let material = graph_material("Glass", |g, out| {
            let gl = g.add_node(nodes::glossy([1.0; 3], 0.1, Distribution::Ggx));
            let rf = g.add_node(nodes::refraction([1.0; 3], 0.1, 1.5));
            let fr = g.add_node(nodes::fresnel(1.5));
            let mix = g.add_node(nodes::mix(0.5));
            g.connect(fr, "Fac", mix, 0);
            g.connect(gl, "BSDF", mix, 1);
            g.connect(rf, "BSDF", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let (result, diag) = flatten(&material);
        let m = result.unwrap().unwrap();
        let w = m.root.microfacet().unwrap();
        assert_eq!(w.ior, 1.5);
        let Texturable::Value(r) = w.roughness else {
            panic!("expected scalar roughness");
        };
        assert!((r - 0.01).abs() < 1e-6);
        assert!(diag.is_empty(), "{:?}", diag.warnings());
    }

    #[test]
    fn fresnel_ior_mismatch_uses_fresnel_value() {
        let material = graph_material("Glass", |g, out| {
            let gl = g.add_node(nodes::glossy([1.0; 3], 0.1, Distribution::Ggx));
            let rf = g.add_node(nodes::refraction([1.0; 3], 0.1, 1.33));
            let fr = g.add_node(nodes::fresnel(1.5));
            let mix = g.add_node(nodes::mix(0.5));
            g.connect(fr, "Fac", mix, 0);
            g.connect(rf, "BSDF", mix, 1);
            g.connect(gl, "BSDF", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let (result, diag) = flatten(&material);
        let w = result.unwrap().unwrap().root.unwrap_microfacet();
        assert_eq!(w.ior, 1.5);
        assert!(diag.mentions("IOR"));
    }

    #[test]
    fn layer_weight_fresnel_layers() {
        let material = graph_material("Plastic", |g, out| {
            let d = g.add_node(nodes::diffuse([0.2; 3], 0.0));
            let s = g.add_node(nodes::glossy([1.0; 3], 0.2, Distribution::Ggx));
            let lw = g.add_node(nodes::layer_weight(0.5));
            let mix = g.add_node(nodes::mix(0.5));
            g.connect(lw, "Fresnel", mix, 0);
            g.connect(d, "BSDF", mix, 1);
            g.connect(s, "BSDF", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let m = flatten(&material).0.unwrap().unwrap();
        let f = m.root.fresnel().unwrap();
        assert!((f.ior - 2.0).abs() < 1e-6);
        assert!(f.refraction.is_lambert());
        assert!(f.reflection.is_torrance());
    }

    #[test]
    fn facing_output_is_rejected() {
        let material = graph_material("Rim", |g, out| {
            let d = g.add_node(nodes::diffuse([0.2; 3], 0.0));
            let s = g.add_node(nodes::glossy([1.0; 3], 0.2, Distribution::Ggx));
            let lw = g.add_node(nodes::layer_weight(0.5));
            let mix = g.add_node(nodes::mix(0.5));
            g.connect(lw, "Facing", mix, 0);
            g.connect(d, "BSDF", mix, 1);
            g.connect(s, "BSDF", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let err = flatten(&material).0.unwrap_err();
        assert!(matches!(err.current_context(), FlattenError::FacingOutput(_)));
    }

    #[test]
    fn diffuse_and_emission_blend_at_full_weight() {
        let material = graph_material("Lamp", |g, out| {
            let d = g.add_node(nodes::diffuse([0.5; 3], 0.0));
            let e = g.add_node(nodes::emission([1.0, 0.9, 0.8], 4.0));
            let mix = g.add_node(nodes::mix(0.3));
            g.connect(d, "BSDF", mix, 1);
            g.connect(e, "Emission", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let m = flatten(&material).0.unwrap().unwrap();
        assert!(m.is_emissive());
        let b = m.root.blend().unwrap();
        assert_eq!((b.factor_a, b.factor_b), (1.0, 1.0));
    }

    #[test]
    fn value_node_sets_blend_factor() {
        let material = graph_material("Coat", |g, out| {
            let d = g.add_node(nodes::diffuse([0.5; 3], 0.0));
            let s = g.add_node(nodes::glossy([1.0; 3], 0.2, Distribution::Ggx));
            let v = g.add_node(nodes::value(0.25));
            let mix = g.add_node(nodes::mix(0.9));
            g.connect(v, "Value", mix, 0);
            g.connect(d, "BSDF", mix, 1);
            g.connect(s, "BSDF", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let b = flatten(&material).0.unwrap().unwrap().root.unwrap_blend();
        assert_eq!((b.factor_a, b.factor_b), (0.75, 0.25));
    }

    #[test]
    fn invalid_blend_pair_is_rejected() {
        let material = graph_material("Odd", |g, out| {
            let a = g.add_node(nodes::emission([1.0; 3], 1.0));
            let b = g.add_node(nodes::emission([1.0; 3], 1.0));
            let mix = g.add_node(nodes::mix(0.5));
            g.connect(a, "Emission", mix, 1);
            g.connect(b, "Emission", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let err = flatten(&material).0.unwrap_err();
        assert!(matches!(err.current_context(), FlattenError::InvalidBlend { .. }));
    }

    #[test]
    fn texture_alpha_wraps_the_opaque_branch() {
        let material = graph_material("Leaf", |g, out| {
            let tex = g.add_node(nodes::image_texture("//textures/leaf.png"));
            let t = g.add_node(nodes::transparent());
            let d = g.add_node(nodes::diffuse([0.1, 0.6, 0.1], 0.0));
            let mix = g.add_node(nodes::mix(0.5));
            g.connect(tex, "Alpha", mix, 0);
            g.connect(t, "BSDF", mix, 1);
            g.connect(d, "BSDF", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let m = flatten(&material).0.unwrap().unwrap();
        assert!(m.root.is_lambert());
        assert_eq!(m.alpha.as_deref(), Some("textures/leaf.png"));
    }

    #[test]
    fn texture_color_factor_is_rejected() {
        let material = graph_material("Leaf", |g, out| {
            let tex = g.add_node(nodes::image_texture("leaf.png"));
            let t = g.add_node(nodes::transparent());
            let d = g.add_node(nodes::diffuse([0.1; 3], 0.0));
            let mix = g.add_node(nodes::mix(0.5));
            g.connect(tex, "Color", mix, 0);
            g.connect(t, "BSDF", mix, 1);
            g.connect(d, "BSDF", mix, 2);
            g.connect(mix, "Shader", out, 0);
        });
        let err = flatten(&material).0.unwrap_err();
        assert!(matches!(err.current_context(), FlattenError::AlphaSocket(_)));
    }

    #[test]
    fn procedural_color_is_baked_when_enabled() {
        let material = graph_material("Wood", |g, out| {
            let noise = g.add_node(nodes::procedural_texture("Noise Texture"));
            let d = g.add_node(nodes::diffuse([0.5; 3], 0.0));
            g.connect(noise, "Color", d, 0);
            g.connect(d, "BSDF", out, 0);
        });
        let mut diag = Diagnostics::new();
        let mut baker = RecordingBaker(Vec::new());
        let m = Flattener::new(true, &mut baker, &mut diag)
            .flatten(&material)
            .unwrap()
            .unwrap();
        let expected = "baked_textures/Wood_Noise Texture.png";
        assert_eq!(
            m.root.unwrap_lambert().albedo,
            Texturable::Texture(expected.to_string())
        );
        assert_eq!(baker.0, vec![expected.to_string()]);
    }

    #[test]
    fn glass_with_textured_color_is_rejected() {
        let material = graph_material("Frosted", |g, out| {
            let tex = g.add_node(nodes::image_texture("frost.png"));
            let glass = g.add_node(nodes::glass([1.0; 3], 0.0, 1.5));
            g.connect(tex, "Color", glass, 0);
            g.connect(glass, "BSDF", out, 0);
        });
        let err = flatten(&material).0.unwrap_err();
        assert!(matches!(err.current_context(), FlattenError::TexturedGlass(_)));
    }

    #[test]
    fn blackbody_emission_is_a_temperature() {
        let material = graph_material("Hot", |g, out| {
            let bb = g.add_node(nodes::blackbody(3200.0));
            let e = g.add_node(nodes::emission([1.0; 3], 2.0));
            g.connect(bb, "Color", e, 0);
            g.connect(e, "Emission", out, 0);
        });
        let m = flatten(&material).0.unwrap().unwrap();
        let e = m.root.unwrap_emissive();
        assert_eq!(e.emission, Emission::Temperature(3200.0));
        assert_eq!(e.scale, [2.0; 3]);
    }

    #[test]
    fn unsupported_leaf_names_its_type() {
        let material = graph_material("Holdout", |g, out| {
            let n = g.add_node(ShaderNode {
                kind: Recognized::Unknown("ShaderNodeHoldout".into()),
                ..ShaderNode::new("Holdout", NodeKind::Value)
            });
            g.connect(n, "Holdout", out, 0);
        });
        let err = flatten(&material).0.unwrap_err();
        assert!(err.to_string().contains("ShaderNodeHoldout"));
    }
}
