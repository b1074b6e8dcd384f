/// Texture bake collaborator used for procedural shader inputs
pub mod bake;
/// Scene descriptor (JSON) writer and its readable formatter
pub mod descriptor;
/// Error definitions and the warning sink shared by every export stage
pub mod error;
/// Top-level export entry point and options
pub mod export;
/// Binary `.mff` writer and reader
pub mod format;
/// Shader graph flattening into the closed set of material primitives
pub mod material;
/// Coordinate conversion, dual quaternions and normal compression
pub mod math;
/// Generic wrapper for values that may or may not match a known variant.
pub mod recognized;
/// Read-only view of the authoring tool's scene graph
pub mod scene;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Diagnostics, ExportError, Warning};
pub use export::{ExportOptions, ExportReport, Exporter};
