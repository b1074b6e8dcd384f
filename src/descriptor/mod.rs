//! The scene descriptor: a JSON document with cameras, lights, materials and
//! scenarios, merged into any document already at the destination.
//!
//! Keys this exporter owns are overwritten for entities that still exist.
//! Foreign top-level keys, foreign per-entity keys and entities the scene no
//! longer has are kept verbatim. Material assignments and instance masks of
//! every scenario are recomputed from scratch.

use std::collections::BTreeSet;

use rootcause::prelude::*;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::Diagnostics;
use crate::format::object::is_instance;
use crate::material::MaterialTable;
use crate::material::json::{float, floats, material_to_json, prune_material_keys};
use crate::scene::{Frame, ObjectId, ObjectKind, SceneSource};

mod cameras;
pub mod format;
mod lights;

pub use format::to_readable_string;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("existing descriptor is malformed: {0}")]
    Malformed(String),
    #[error("no camera found")]
    NoCamera,
    #[error("light '{0}' could not be exported")]
    Light(String),
    #[error("light '{0}' has no emission node connected to its output")]
    LightWithoutEmission(String),
    #[error("light '{0}' is goniometric (color input other than black-body); not supported")]
    GoniometricLight(String),
    #[error("background could not be exported: {0}")]
    Background(String),
    #[error("scene access failed")]
    Scene,
}

type DResult<T> = Result<T, Report<DescriptorError>>;

/// Inputs of one descriptor build.
pub struct DescriptorWriter<'a> {
    pub scene: &'a dyn SceneSource,
    pub materials: &'a MaterialTable,
    /// Frames sampled for camera and light paths.
    pub frames: &'a [Frame],
    pub version: &'a str,
    /// Path of the binary file, relative to the descriptor.
    pub binary: &'a str,
    pub overwrite_default_scenario: bool,
    pub diagnostics: &'a mut Diagnostics,
}

impl DescriptorWriter<'_> {
    /// Build the document, merged into `existing` when there is one.
    pub fn write(mut self, existing: Option<Value>) -> DResult<Value> {
        let mut doc = match existing {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(Report::new(DescriptorError::Malformed(
                    "top level is not an object".into(),
                )));
            }
        };

        let active = self
            .scene
            .scenes()
            .get(self.scene.active_scene())
            .map(|s| s.name.clone())
            .unwrap_or_default();
        doc.insert("version".into(), self.version.into());
        doc.insert("binary".into(), self.binary.into());
        if self.overwrite_default_scenario || !doc.contains_key("defaultScenario") {
            doc.insert("defaultScenario".into(), active.clone().into());
        }
        for key in ["cameras", "lights", "materials", "scenarios"] {
            section(&mut doc, key)?;
        }

        if self.scene.scenes().len() > 1 {
            self.diagnostics.warn(
                active.as_str(),
                "multiple scenes found; only the active scene's objects are exported, the others only get scenarios",
            );
        }

        info!("writing cameras");
        let cameras = section(&mut doc, "cameras")?;
        let exported = cameras::write_cameras(&mut self, cameras)?;
        debug!("{exported} cameras exported");
        // Cameras kept from an existing descriptor still count.
        if cameras.is_empty() {
            return Err(Report::new(DescriptorError::NoCamera));
        }

        info!("writing lights");
        let lights = lights::write_lights(&mut self, section(&mut doc, "lights")?)?;

        info!("writing materials");
        self.write_materials(section(&mut doc, "materials")?)?;

        info!("writing scenarios");
        self.write_scenarios(&mut doc, &lights)?;
        Ok(Value::Object(doc))
    }

    fn write_materials(&mut self, materials: &mut Map<String, Value>) -> DResult<()> {
        for entry in self.materials.entries() {
            let target = entity(materials, &entry.name)?;
            let Some(material) = &entry.material else {
                debug!("material '{}' has no surface; keeping its entry", entry.name);
                continue;
            };
            prune_material_keys(target);
            target.extend(material_to_json(material));
        }
        Ok(())
    }

    fn write_scenarios(&mut self, doc: &mut Map<String, Value>, lights: &[ObjectId]) -> DResult<()> {
        let scene = self.scene;
        let first_camera = section(doc, "cameras")?.keys().next().cloned();
        let assignments: Map<String, Value> = self
            .materials
            .entries()
            .iter()
            .map(|e| (e.name.clone(), Value::String(e.name.clone())))
            .collect();
        let instances: Vec<(ObjectId, &str)> = scene
            .object_ids()
            .filter_map(|id| {
                let object = scene.object(id)?;
                is_instance(object).then_some((id, object.name.as_str()))
            })
            .collect();
        let light_set: BTreeSet<ObjectId> = lights.iter().copied().collect();

        let mut backgrounds = Vec::new();
        for info in scene.scenes() {
            let background = match &info.world {
                Some(world) => match lights::background(world, self.diagnostics) {
                    Ok(bg) => bg,
                    Err(err) => {
                        self.diagnostics.warn(
                            info.name.as_str(),
                            format!("background light did not get set: {}", err.current_context()),
                        );
                        None
                    }
                },
                None => None,
            };
            backgrounds.push(background);
        }

        for (info, background) in scene.scenes().iter().zip(backgrounds) {
            let mut scene_lights: Vec<Value> = info
                .objects
                .iter()
                .filter(|id| light_set.contains(*id))
                .filter_map(|id| scene.object(*id))
                .map(|o| Value::String(o.name.clone()))
                .collect();
            if let Some(bg) = background {
                let name = format!("{}_Background", info.name);
                section(doc, "lights")?.insert(name.clone(), Value::Object(bg));
                scene_lights.push(Value::String(name));
            }

            let camera = info
                .camera
                .and_then(|id| scene.object(id))
                .filter(|o| o.kind.camera_ref().is_some_and(|c| c.projection.is_known()))
                .map(|o| o.name.clone())
                .or_else(|| first_camera.clone())
                .unwrap_or_default();

            let scenario = entity(section(doc, "scenarios")?, &info.name)?;
            scenario.insert("camera".into(), camera.into());
            scenario.insert(
                "resolution".into(),
                Value::Array(info.resolution.iter().map(|r| Value::from(*r)).collect()),
            );
            scenario.insert("lights".into(), Value::Array(scene_lights));
            scenario.insert("lod".into(), Value::from(0));
            scenario.insert("materialAssignments".into(), Value::Object(assignments.clone()));

            let properties = entity(scenario, "instanceProperties")?;
            for props in properties.values_mut() {
                if let Value::Object(p) = props {
                    p.retain(|k, _| k != "mask");
                }
            }
            properties.retain(|_, v| !matches!(v, Value::Object(p) if p.is_empty()));
            for &(id, name) in &instances {
                if !info.contains(id) {
                    entity(properties, name)?.insert("mask".into(), Value::Bool(true));
                }
            }
        }
        Ok(())
    }

    /// World matrix of `object` at every exported frame.
    fn sample<T>(
        &self,
        object: ObjectId,
        mut f: impl FnMut(glam::Mat4) -> T,
    ) -> DResult<Vec<T>> {
        self.frames
            .iter()
            .map(|&frame| {
                self.scene
                    .world_matrix(object, frame)
                    .map(&mut f)
                    .context(DescriptorError::Scene)
            })
            .collect()
    }
}

/// A top-level section, created empty when missing.
fn section<'m>(doc: &'m mut Map<String, Value>, key: &str) -> DResult<&'m mut Map<String, Value>> {
    entity(doc, key)
}

/// The object stored under `key`, created empty when missing.
fn entity<'m>(map: &'m mut Map<String, Value>, key: &str) -> DResult<&'m mut Map<String, Value>> {
    match map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
    {
        Value::Object(inner) => Ok(inner),
        _ => Err(Report::new(DescriptorError::Malformed(format!(
            "'{key}' is not an object"
        )))),
    }
}

/// Collapse a per-frame path to a single entry when every sample is equal.
fn collapse<T: PartialEq>(mut samples: Vec<T>) -> Vec<T> {
    if samples.windows(2).all(|w| w[0] == w[1]) {
        samples.truncate(1);
    }
    samples
}

fn vector_path(samples: Vec<[f32; 3]>) -> Value {
    Value::Array(collapse(samples).iter().map(|v| floats(v)).collect())
}

fn scalar_path(samples: Vec<f32>) -> Value {
    Value::Array(collapse(samples).into_iter().map(float).collect())
}

fn remove_keys(entry: &mut Map<String, Value>, keys: &[&str]) {
    entry.retain(|k, _| !keys.contains(&k.as_str()));
}

fn object_name(scene: &dyn SceneSource, id: ObjectId) -> String {
    scene
        .object(id)
        .map_or_else(|| format!("{id:?}"), |o| o.name.clone())
}

fn objects_where<'s>(
    scene: &'s dyn SceneSource,
    pred: impl Fn(&ObjectKind) -> bool + 's,
) -> impl Iterator<Item = ObjectId> + 's {
    scene
        .object_ids()
        .filter(move |id| scene.object(*id).is_some_and(|o| o.users > 0 && pred(&o.kind)))
}
