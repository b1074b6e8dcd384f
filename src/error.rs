use std::fmt;

use thiserror::Error;
use tracing::warn;

/// Failures that abort a whole export. Nothing is written to the
/// destination paths when one of these is returned.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("existing scene descriptor {path} could not be merged")]
    MalformedDescriptor { path: String },
    #[error("material '{name}' could not be converted")]
    Material { name: String },
    #[error("object '{name}' could not be encoded")]
    Object { name: String },
    #[error("there are no materials in the scene")]
    NoMaterials,
    #[error("{0} materials exceed the 16-bit material index")]
    TooManyMaterials(usize),
    #[error("no camera found")]
    NoCamera,
    #[error("scene descriptor could not be built")]
    Descriptor,
    #[error("binary scene could not be built")]
    Binary,
    #[error("I/O error on {path}")]
    Io { path: String },
}

/// A recoverable problem. The export continued with a documented substitute
/// or skipped the entity named by `subject`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Warning {
    pub subject: String,
    pub message: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

/// Collects warnings raised during one export run.
///
/// Every warning is also emitted through `tracing` at the moment it is
/// recorded, so hosts that only install a subscriber still see them.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        let warning = Warning {
            subject: subject.into(),
            message: message.into(),
        };
        warn!(subject = %warning.subject, "{}", warning.message);
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    /// True if any recorded warning mentions `needle` in its message.
    pub fn mentions(&self, needle: &str) -> bool {
        self.warnings.iter().any(|w| w.message.contains(needle))
    }
}
