//! Export entry point.
//!
//! One call flattens the used materials, encodes the binary scene and
//! merges the JSON descriptor. Both files are written next to their
//! destination first and only renamed into place once both are complete.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bon::Builder;
use rootcause::prelude::*;
use serde_json::Value;
use tracing::{debug, info};

use crate::bake::{NoBaker, TextureBaker};
use crate::descriptor::{DescriptorError, DescriptorWriter, to_readable_string};
use crate::error::{Diagnostics, ExportError, Warning};
use crate::format::{BinaryBuffer, FormatError};
use crate::format::animation::write_animation;
use crate::format::materials::write_materials;
use crate::format::object::{ObjectOptions, ObjectWriter};
use crate::material::{Flattener, MaterialTable};
use crate::scene::SceneSource;

/// Descriptor format version written by this exporter.
pub const DESCRIPTOR_VERSION: &str = "1.6";

type EResult<T> = Result<T, Report<ExportError>>;

/// Options recognized by an export run.
#[derive(Debug, Clone, Builder)]
pub struct ExportOptions {
    /// Only export selected objects.
    #[builder(default)]
    pub selection_only: bool,
    /// Store normals octahedral-encoded in 32 bits.
    #[builder(default)]
    pub compress_normals: bool,
    /// Deflate vertex, face and attribute blocks.
    #[builder(default)]
    pub deflate: bool,
    #[builder(default)]
    pub triangulate: bool,
    /// Replace `defaultScenario` of an existing descriptor with the active scene.
    #[builder(default = true)]
    pub overwrite_default_scenario: bool,
    /// Export the whole frame range instead of the current frame.
    #[builder(default)]
    pub export_animation: bool,
    /// Bake procedural texture inputs through the host.
    #[builder(default)]
    pub bake_textures: bool,
    #[builder(default = DESCRIPTOR_VERSION.to_string(), into)]
    pub version: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions::builder().build()
    }
}

impl ExportOptions {
    fn object_options(&self) -> ObjectOptions {
        ObjectOptions {
            selection_only: self.selection_only,
            deflate: self.deflate,
            compress_normals: self.compress_normals,
            triangulate: self.triangulate,
            export_animation: self.export_animation,
        }
    }
}

/// Outcome of a successful export.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub descriptor: PathBuf,
    pub binary: PathBuf,
    pub warnings: Vec<Warning>,
}

/// Both export products, before anything touches the file system.
#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub binary: Vec<u8>,
    pub descriptor: String,
    pub warnings: Vec<Warning>,
}

pub struct Exporter<'a> {
    scene: &'a dyn SceneSource,
    baker: Box<dyn TextureBaker + 'a>,
    options: ExportOptions,
}

impl<'a> Exporter<'a> {
    /// An exporter without texture baking support.
    pub fn new(scene: &'a dyn SceneSource, options: ExportOptions) -> Self {
        Exporter {
            scene,
            baker: Box::new(NoBaker),
            options,
        }
    }

    pub fn with_baker(mut self, baker: impl TextureBaker + 'a) -> Self {
        self.baker = Box::new(baker);
        self
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Export to `descriptor_path`. The binary lands next to it with the
    /// `mff` extension. On error neither destination file is touched.
    pub fn export(&mut self, descriptor_path: &Path) -> EResult<ExportReport> {
        let binary_path = descriptor_path.with_extension("mff");
        let binary_name = binary_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let existing = match fs::read_to_string(descriptor_path) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_error(e, descriptor_path)),
        };

        let output = self
            .build(existing.as_deref(), &binary_name)
            .map_err(|e| match e.current_context() {
                ExportError::MalformedDescriptor { .. } => e.context(ExportError::MalformedDescriptor {
                    path: descriptor_path.display().to_string(),
                }),
                _ => e,
            })?;

        info!("writing {}", binary_path.display());
        let binary = PendingFile::write(&binary_path, &output.binary)?;
        info!("writing {}", descriptor_path.display());
        let descriptor = PendingFile::write(descriptor_path, output.descriptor.as_bytes())?;
        binary.commit()?;
        descriptor.commit()?;

        Ok(ExportReport {
            descriptor: descriptor_path.to_path_buf(),
            binary: binary_path,
            warnings: output.warnings,
        })
    }

    /// Run the whole pipeline in memory. `existing` is the text of a
    /// previous descriptor to merge into; `binary_name` is the binary's
    /// path relative to the descriptor.
    pub fn build(&mut self, existing: Option<&str>, binary_name: &str) -> EResult<ExportOutput> {
        let scene = self.scene;
        let mut diagnostics = Diagnostics::new();
        let info = scene
            .scenes()
            .get(scene.active_scene())
            .ok_or_else(|| Report::new(ExportError::Descriptor))?;
        let frames = info.frames(self.options.export_animation);
        debug!("sampling frames {frames:?}");

        // Parse first so a broken descriptor aborts before any encoding.
        let existing = existing
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| {
                Report::new(e).context(ExportError::MalformedDescriptor {
                    path: binary_name.to_string(),
                })
            })?;

        info!("flattening materials");
        let table = {
            let mut flattener = Flattener::new(
                self.options.bake_textures,
                self.baker.as_mut(),
                &mut diagnostics,
            );
            MaterialTable::flatten_used(scene, &mut flattener)?
        };

        info!("encoding binary scene");
        let mut buf = BinaryBuffer::new();
        write_materials(&mut buf, &table).context(ExportError::Binary)?;
        let bones = write_animation(&mut buf, scene, &frames, self.options.export_animation)
            .context(ExportError::Binary)?;
        ObjectWriter {
            scene,
            materials: &table,
            bones: &bones,
            frames: &frames,
            current_frame: info.frame_current,
            options: self.options.object_options(),
            diagnostics: &mut diagnostics,
        }
        .write(&mut buf)
        .map_err(|e| {
            let context = match e.current_context() {
                FormatError::Object(name) | FormatError::SingularTransform(name) => {
                    ExportError::Object { name: name.clone() }
                }
                _ => ExportError::Binary,
            };
            e.context(context)
        })?;
        let binary = buf.finish();

        info!("building scene descriptor");
        let document = DescriptorWriter {
            scene,
            materials: &table,
            frames: &frames,
            version: &self.options.version,
            binary: binary_name,
            overwrite_default_scenario: self.options.overwrite_default_scenario,
            diagnostics: &mut diagnostics,
        }
        .write(existing)
        .map_err(|e| {
            let context = match e.current_context() {
                DescriptorError::NoCamera => ExportError::NoCamera,
                DescriptorError::Malformed(_) => ExportError::MalformedDescriptor {
                    path: binary_name.to_string(),
                },
                _ => ExportError::Descriptor,
            };
            e.context(context)
        })?;

        Ok(ExportOutput {
            binary,
            descriptor: to_readable_string(&document),
            warnings: diagnostics.into_warnings(),
        })
    }
}

fn io_error(e: io::Error, path: &Path) -> Report<ExportError> {
    Report::new(e).context(ExportError::Io {
        path: path.display().to_string(),
    })
}

/// A file written to a sibling temporary path. Dropping it without
/// [`PendingFile::commit`] removes the temporary.
struct PendingFile {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl PendingFile {
    fn write(target: &Path, data: &[u8]) -> EResult<Self> {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        let temp = target.with_file_name(name);
        let pending = PendingFile {
            temp,
            target: target.to_path_buf(),
            committed: false,
        };
        fs::write(&pending.temp, data).map_err(|e| io_error(e, &pending.temp))?;
        Ok(pending)
    }

    fn commit(mut self) -> EResult<()> {
        fs::rename(&self.temp, &self.target).map_err(|e| io_error(e, &self.target))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}
