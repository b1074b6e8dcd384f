//! The binary `.mff` scene format.
//!
//! A file is four tagged sections in fixed order: `Mats` (material names),
//! `Bone` (skeletal animation), `Objs` (objects with their LOD blocks) and
//! `Inst` (instances). Every multi-byte value is little-endian; strings are
//! a `u32` byte length followed by UTF-8 without terminator.

use thiserror::Error;

pub mod animation;
pub mod buffer;
pub mod geometry;
pub mod materials;
pub mod object;
pub mod reader;

pub use buffer::{BinaryBuffer, OffsetHandle};

pub const TAG_MATERIALS: &[u8; 4] = b"Mats";
pub const TAG_BONES: &[u8; 4] = b"Bone";
pub const TAG_OBJECTS: &[u8; 4] = b"Objs";
pub const TAG_OBJECT: &[u8; 4] = b"Obj_";
pub const TAG_LOD: &[u8; 4] = b"LOD_";
pub const TAG_ATTRIBUTE: &[u8; 4] = b"Attr";
pub const TAG_INSTANCES: &[u8; 4] = b"Inst";

/// Keyframe value of records that are not animated.
pub const STATIC_KEYFRAME: u32 = 0xFFFF_FFFF;
/// Previous-object and instance-id value meaning "none".
pub const NO_INDEX: u32 = 0xFFFF_FFFF;

/// Global flags stored in the `Objs` header.
pub const FLAG_DEFLATE: u32 = 1;
pub const FLAG_COMPRESSED_NORMALS: u32 = 2;

/// Per-object flag: some face uses an emissive material.
pub const OBJECT_FLAG_EMISSIVE: u32 = 1;

/// Attribute type codes.
pub const ATTR_TYPE_FLOAT2: u32 = 16;
pub const ATTR_TYPE_FLOAT3: u32 = 17;
pub const ATTR_TYPE_SKIN_WEIGHTS: u32 = 19;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("{what} of {len} does not fit the 32-bit field")]
    TooLarge { what: &'static str, len: usize },
    #[error("deflating a {0} byte block failed")]
    Compression(usize),
    #[error("object '{0}' could not be written")]
    Object(String),
    #[error("instance '{0}' has a singular transform")]
    SingularTransform(String),
    #[error("frame {0} cannot be stored as a keyframe")]
    NegativeFrame(i32),
    #[error("scene access failed")]
    Scene,
}
