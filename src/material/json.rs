//! Descriptor rendering of flattened materials.

use serde_json::{Map, Value};

use super::{
    ColorInput, Emission, Material, MaterialNode, Roughness, ScalarInput, Texturable, WalterParams,
};

/// Keys the exporter owns inside a material entry. They are removed before
/// a fresh conversion is written so stale parameters of a previous material
/// type never survive; all other keys are left alone.
pub const MATERIAL_KEYS: &[&str] = &[
    "alpha",
    "displacement",
    "type",
    "albedo",
    "roughness",
    "ndf",
    "absorption",
    "radiance",
    "temperature",
    "scale",
    "factorA",
    "factorB",
    "layerA",
    "layerB",
    "layerReflection",
    "layerRefraction",
    "clearcoat",
    "clearcoatRoughness",
    "sheen",
    "sheenTint",
    "specularTint",
    "specTrans",
    "scatterDistance",
    "metallic",
    "baseColor",
    "ior",
    "shadowingModel",
    "anisotropic",
    "outerMedium",
];

pub fn prune_material_keys(entry: &mut Map<String, Value>) {
    entry.retain(|k, _| !MATERIAL_KEYS.contains(&k.as_str()));
}

pub(crate) fn float(v: f32) -> Value {
    Value::from(f64::from(v))
}

pub(crate) fn floats(v: &[f32]) -> Value {
    Value::Array(v.iter().copied().map(float).collect())
}

fn color(input: &ColorInput) -> Value {
    match input {
        Texturable::Value(c) => floats(c),
        Texturable::Texture(path) => Value::String(path.clone()),
    }
}

fn scalar(input: &ScalarInput) -> Value {
    match input {
        Texturable::Value(v) => float(*v),
        Texturable::Texture(path) => Value::String(path.clone()),
    }
}

/// The material entry as it appears under `materials` in the descriptor.
/// `type` always comes first.
pub fn material_to_json(material: &Material) -> Map<String, Value> {
    let mut map = node_to_json(&material.root);
    if let Some(alpha) = &material.alpha {
        map.insert("alpha".into(), Value::String(alpha.clone()));
    }
    if let Some(d) = &material.displacement {
        let mut disp = Map::new();
        disp.insert("map".into(), Value::String(d.map.clone()));
        disp.insert("bias".into(), float(d.bias));
        disp.insert("scale".into(), float(d.scale));
        map.insert("displacement".into(), Value::Object(disp));
    }
    if let Some(m) = &material.outer_medium {
        let mut medium = Map::new();
        medium.insert("ior".into(), float(m.ior));
        medium.insert("absorption".into(), floats(&m.absorption));
        map.insert("outerMedium".into(), Value::Object(medium));
    }
    map
}

fn walter_fields(map: &mut Map<String, Value>, w: &WalterParams) {
    map.insert("absorption".into(), color(&w.absorption));
    map.insert("roughness".into(), scalar(&w.roughness));
    map.insert("shadowingModel".into(), w.shadowing.as_str().into());
    map.insert("ndf".into(), w.ndf.as_str().into());
    map.insert("ior".into(), float(w.ior));
}

pub fn node_to_json(node: &MaterialNode) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("type".into(), node.type_name().into());
    match node {
        MaterialNode::Lambert(p) => {
            map.insert("albedo".into(), color(&p.albedo));
        }
        MaterialNode::OrenNayar(p) => {
            map.insert("albedo".into(), color(&p.albedo));
            map.insert("roughness".into(), float(p.roughness));
        }
        MaterialNode::Torrance(p) => {
            map.insert("albedo".into(), color(&p.albedo));
            let roughness = match &p.roughness {
                Roughness::Isotropic(r) => scalar(r),
                Roughness::Anisotropic(r) => floats(r),
            };
            map.insert("roughness".into(), roughness);
            map.insert("ndf".into(), p.ndf.as_str().into());
            map.insert("shadowingModel".into(), p.shadowing.as_str().into());
        }
        MaterialNode::Walter(p) | MaterialNode::Microfacet(p) => walter_fields(&mut map, p),
        MaterialNode::Emissive(p) => {
            match &p.emission {
                Emission::Radiance(c) => map.insert("radiance".into(), color(c)),
                Emission::Temperature(t) => map.insert("temperature".into(), float(*t)),
            };
            map.insert("scale".into(), floats(&p.scale));
        }
        MaterialNode::Blend(p) => {
            map.insert("layerA".into(), Value::Object(node_to_json(&p.layer_a)));
            map.insert("layerB".into(), Value::Object(node_to_json(&p.layer_b)));
            map.insert("factorA".into(), float(p.factor_a));
            map.insert("factorB".into(), float(p.factor_b));
        }
        MaterialNode::Fresnel(p) => {
            map.insert("ior".into(), float(p.ior));
            map.insert(
                "layerRefraction".into(),
                Value::Object(node_to_json(&p.refraction)),
            );
            map.insert(
                "layerReflection".into(),
                Value::Object(node_to_json(&p.reflection)),
            );
        }
        MaterialNode::Disney(p) => {
            map.insert("baseColor".into(), color(&p.base_color));
            map.insert("scatterDistance".into(), floats(&p.scatter_distance));
            for (key, v) in [
                ("metallic", p.metallic),
                ("roughness", p.roughness),
                ("anisotropic", p.anisotropic),
                ("specTrans", p.spec_trans),
                ("ior", p.ior),
                ("specularTint", p.specular_tint),
                ("sheen", p.sheen),
                ("sheenTint", p.sheen_tint),
                ("clearcoat", p.clearcoat),
                ("clearcoatRoughness", p.clearcoat_roughness),
            ] {
                map.insert(key.into(), float(v));
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::material::{Displacement, LambertParams, Medium, Ndf, ShadowingModel};

    #[test]
    fn type_is_the_first_key() {
        let m = Material {
            name: "Glass".into(),
            root: MaterialNode::Microfacet(WalterParams {
                absorption: Texturable::Value([0.0; 3]),
                roughness: Texturable::Value(0.25),
                ndf: Ndf::Ggx,
                shadowing: ShadowingModel::VCavity,
                ior: 1.5,
            }),
            alpha: None,
            displacement: None,
            outer_medium: None,
        };
        let map = material_to_json(&m);
        assert_eq!(map.keys().next().map(String::as_str), Some("type"));
        assert_eq!(map["type"], json!("microfacet"));
        assert_eq!(map["ndf"], json!("GGX"));
        assert_eq!(map["roughness"], json!(0.25));
    }

    #[test]
    fn root_extras_are_rendered() {
        let m = Material {
            name: "Ground".into(),
            root: MaterialNode::Lambert(LambertParams {
                albedo: Texturable::Texture("textures/ground.png".into()),
            }),
            alpha: Some("textures/mask.png".into()),
            displacement: Some(Displacement {
                map: "textures/height.png".into(),
                bias: 0.5,
                scale: 2.0,
            }),
            outer_medium: Some(Medium {
                ior: 1.0,
                absorption: [0.0; 3],
            }),
        };
        let map = material_to_json(&m);
        assert_eq!(map["albedo"], json!("textures/ground.png"));
        assert_eq!(map["alpha"], json!("textures/mask.png"));
        assert_eq!(
            map["displacement"],
            json!({"map": "textures/height.png", "bias": 0.5, "scale": 2.0})
        );
        assert_eq!(map["outerMedium"]["ior"], json!(1.0));
    }

    #[test]
    fn pruning_keeps_foreign_keys() {
        let mut entry = json!({
            "type": "torrance",
            "albedo": [1.0, 1.0, 1.0],
            "roughness": 0.1,
            "comment": "hand tuned",
        });
        let map = entry.as_object_mut().unwrap();
        prune_material_keys(map);
        assert_eq!(map.len(), 1);
        assert_eq!(map["comment"], json!("hand tuned"));
    }
}
