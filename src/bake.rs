//! Texture baking is delegated to the host. The exporter only decides which
//! node output needs rasterizing and where the image should land.

use rootcause::Report;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BakeError {
    #[error("baking node '{node}' of material '{material}' failed: {reason}")]
    Failed {
        material: String,
        node: String,
        reason: String,
    },
}

/// One node output to rasterize into an image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BakeRequest<'a> {
    pub material: &'a str,
    pub node: &'a str,
    pub output_socket: &'a str,
    /// Bake into the strength channel instead of color.
    pub is_scalar: bool,
    /// Destination, relative to the descriptor's directory.
    pub path: &'a str,
}

/// Host-side baker.
///
/// Baking is blocking and usually creates temporary host objects, images and
/// links. Implementations must tear those down before returning, on error
/// paths too.
pub trait TextureBaker {
    fn bake(&mut self, request: &BakeRequest<'_>) -> Result<(), Report<BakeError>>;
}

/// Baker for hosts that cannot bake. Every request fails.
#[derive(Debug, Default)]
pub struct NoBaker;

impl TextureBaker for NoBaker {
    fn bake(&mut self, request: &BakeRequest<'_>) -> Result<(), Report<BakeError>> {
        Err(Report::new(BakeError::Failed {
            material: request.material.to_string(),
            node: request.node.to_string(),
            reason: "no texture baker available".to_string(),
        }))
    }
}

/// Where the baked image of `node` in `material` is stored.
pub fn baked_texture_path(material: &str, node: &str) -> String {
    format!("baked_textures/{material}_{node}.png")
}

/// Strip the host's `//` blend-relative marker from an image path.
pub fn relative_image_path(path: &str) -> String {
    path.replace("//", "")
}
