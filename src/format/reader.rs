//! Reader for written `.mff` files.
//!
//! Sections and records are reached through the stored offsets rather than
//! by scanning, so every jump table is validated against the tag it must
//! land on.

use std::borrow::Cow;
use std::io::Read;

use flate2::read::ZlibDecoder;
use rootcause::Report;
use thiserror::Error;
use winnow::Parser;
use winnow::binary::{le_f32, le_u16, le_u32, le_u64};
use winnow::error::{ContextError, ErrMode};
use winnow::token::take;

use super::{
    FLAG_COMPRESSED_NORMALS, FLAG_DEFLATE, TAG_ATTRIBUTE, TAG_BONES, TAG_INSTANCES, TAG_LOD,
    TAG_MATERIALS, TAG_OBJECT, TAG_OBJECTS,
};
use crate::math::decode_octahedral;

type WResult<T> = Result<T, ErrMode<ContextError>>;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("data too short: need {need} bytes at offset 0x{offset:X}, have {have}")]
    DataTooShort {
        offset: usize,
        need: usize,
        have: usize,
    },
    #[error("expected tag '{expected}' at offset 0x{offset:X}, found '{found}'")]
    BadTag {
        offset: usize,
        expected: String,
        found: String,
    },
    #[error("block at 0x{offset:X} holds {found} bytes, expected {expected}")]
    BlockSize {
        offset: usize,
        expected: usize,
        found: usize,
    },
    #[error("block at 0x{offset:X} could not be inflated")]
    Inflate { offset: usize },
    #[error("parse error: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MffFile {
    pub materials: Vec<String>,
    pub bones: BoneSection,
    pub flags: u32,
    pub objects: Vec<ObjectRecord>,
    pub instances: Vec<InstanceRecord>,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoneSection {
    pub bone_count: u32,
    pub keyframes: u32,
    /// Dual quaternions, keyframe-major.
    pub transforms: Vec<[f32; 8]>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectRecord {
    /// Absolute offset of the `Obj_` tag.
    pub offset: u64,
    pub name: String,
    pub flags: u32,
    pub keyframe: u32,
    pub prev: u32,
    pub min: [f32; 3],
    pub max: [f32; 3],
    pub lods: Vec<LodRecord>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LodRecord {
    /// Absolute offset of the `LOD_` tag.
    pub offset: u64,
    pub triangles: u32,
    pub quads: u32,
    pub spheres: u32,
    pub vertices: u32,
    pub edges: u32,
    pub vertex_attributes: u32,
    pub face_attributes: u32,
    pub sphere_attributes: u32,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub data: LodData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LodData {
    Mesh(MeshData),
    Sphere {
        center: [f32; 3],
        radius: f32,
        material: u16,
    },
}

impl Default for LodData {
    fn default() -> Self {
        LodData::Mesh(MeshData::default())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    /// Decoded back to floats when the file stores compressed normals.
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub attributes: Vec<AttributeRecord>,
    pub triangles: Vec<[u32; 3]>,
    pub quads: Vec<[u32; 4]>,
    pub materials: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRecord {
    pub name: String,
    pub meta: String,
    pub meta_flags: u32,
    pub type_code: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstanceRecord {
    pub name: String,
    pub object: u32,
    pub keyframe: u32,
    pub id: u32,
    /// World-to-instance transform, first three rows.
    pub rows: [[f32; 4]; 3],
}

// ── Winnow sub-parsers ──────────────────────────────────────────────────────

fn parse_string(input: &mut &[u8]) -> WResult<String> {
    let len = le_u32.parse_next(input)?;
    let bytes = take(len as usize).parse_next(input)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn parse_f32s<const N: usize>(input: &mut &[u8]) -> WResult<[f32; N]> {
    let mut out = [0.0; N];
    for v in &mut out {
        *v = le_f32.parse_next(input)?;
    }
    Ok(out)
}

fn parse_u32s<const N: usize>(input: &mut &[u8]) -> WResult<[u32; N]> {
    let mut out = [0; N];
    for v in &mut out {
        *v = le_u32.parse_next(input)?;
    }
    Ok(out)
}

fn parse_instance(input: &mut &[u8]) -> WResult<InstanceRecord> {
    let name = parse_string(input)?;
    let object = le_u32.parse_next(input)?;
    let keyframe = le_u32.parse_next(input)?;
    let id = le_u32.parse_next(input)?;
    let rows = [parse_f32s(input)?, parse_f32s(input)?, parse_f32s(input)?];
    Ok(InstanceRecord {
        name,
        object,
        keyframe,
        id,
        rows,
    })
}

fn parse_attribute(input: &mut &[u8]) -> WResult<(String, String, u32, u32, Vec<u8>)> {
    let name = parse_string(input)?;
    let meta = parse_string(input)?;
    let meta_flags = le_u32.parse_next(input)?;
    let type_code = le_u32.parse_next(input)?;
    let size = le_u64.parse_next(input)?;
    let data = take(size as usize).parse_next(input)?;
    Ok((name, meta, meta_flags, type_code, data.to_vec()))
}

// ── Reader ──────────────────────────────────────────────────────────────────

struct Reader<'d> {
    data: &'d [u8],
    deflate: bool,
    compressed_normals: bool,
}

impl<'d> Reader<'d> {
    fn input_at(&self, offset: usize) -> Result<&'d [u8], Report<ReadError>> {
        self.data.get(offset..).ok_or_else(|| {
            Report::new(ReadError::DataTooShort {
                offset,
                need: 0,
                have: self.data.len(),
            })
        })
    }

    fn offset_of(&self, input: &[u8]) -> usize {
        self.data.len() - input.len()
    }

    /// Run `parser` on `input`, labelling failures with `what`.
    fn parse<T>(
        &self,
        input: &mut &'d [u8],
        what: &str,
        parser: impl FnOnce(&mut &'d [u8]) -> WResult<T>,
    ) -> Result<T, Report<ReadError>> {
        let offset = self.offset_of(input);
        parser(input).map_err(|e: ErrMode<ContextError>| {
            Report::new(ReadError::ParseError(format!("{what} at 0x{offset:X}: {e}")))
        })
    }

    fn expect_tag(&self, input: &mut &'d [u8], tag: &[u8; 4]) -> Result<(), Report<ReadError>> {
        let offset = self.offset_of(input);
        let found: &[u8] = self.parse(input, "tag", |i| take(4usize).parse_next(i))?;
        if found != tag {
            return Err(Report::new(ReadError::BadTag {
                offset,
                expected: String::from_utf8_lossy(tag).into_owned(),
                found: String::from_utf8_lossy(found).into_owned(),
            }));
        }
        Ok(())
    }

    fn inflate(&self, compressed: &[u8], raw: usize, offset: usize) -> Result<Vec<u8>, Report<ReadError>> {
        let mut out = Vec::with_capacity(raw);
        ZlibDecoder::new(compressed)
            .read_to_end(&mut out)
            .map_err(|_| Report::new(ReadError::Inflate { offset }))?;
        if out.len() != raw {
            return Err(Report::new(ReadError::BlockSize {
                offset,
                expected: raw,
                found: out.len(),
            }));
        }
        Ok(out)
    }

    /// Read the next data block of `size` uncompressed bytes.
    fn block(&self, input: &mut &'d [u8], size: usize) -> Result<Cow<'d, [u8]>, Report<ReadError>> {
        if size == 0 {
            return Ok(Cow::Borrowed(&[]));
        }
        let offset = self.offset_of(input);
        if !self.deflate {
            let bytes = self.parse(input, "block", |i| take(size).parse_next(i))?;
            return Ok(Cow::Borrowed(bytes));
        }
        let (compressed, raw) = self.parse(input, "block header", |i| {
            Ok((le_u32.parse_next(i)?, le_u32.parse_next(i)?))
        })?;
        if raw as usize != size {
            return Err(Report::new(ReadError::BlockSize {
                offset,
                expected: size,
                found: raw as usize,
            }));
        }
        let bytes = self.parse(input, "block", |i| take(compressed as usize).parse_next(i))?;
        Ok(Cow::Owned(self.inflate(bytes, size, offset)?))
    }

    fn attribute(&self, input: &mut &'d [u8]) -> Result<AttributeRecord, Report<ReadError>> {
        let offset = self.offset_of(input);
        let inflated;
        let mut body: &[u8] = if self.deflate {
            let (compressed, raw) = self.parse(input, "attribute header", |i| {
                Ok((le_u32.parse_next(i)?, le_u32.parse_next(i)?))
            })?;
            let bytes = self.parse(input, "attribute", |i| take(compressed as usize).parse_next(i))?;
            inflated = self.inflate(bytes, raw as usize, offset)?;
            &inflated
        } else {
            *input
        };
        let before = body.len();
        let tag: &[u8] = winnow_tag(&mut body).map_err(|e: ErrMode<ContextError>| {
            Report::new(ReadError::ParseError(format!("attribute at 0x{offset:X}: {e}")))
        })?;
        if tag != TAG_ATTRIBUTE {
            return Err(Report::new(ReadError::BadTag {
                offset,
                expected: String::from_utf8_lossy(TAG_ATTRIBUTE).into_owned(),
                found: String::from_utf8_lossy(tag).into_owned(),
            }));
        }
        let (name, meta, meta_flags, type_code, data) =
            parse_attribute(&mut body).map_err(|e: ErrMode<ContextError>| {
                Report::new(ReadError::ParseError(format!("attribute at 0x{offset:X}: {e}")))
            })?;
        if !self.deflate {
            let consumed = before - body.len();
            *input = &input[consumed..];
        }
        Ok(AttributeRecord {
            name,
            meta,
            meta_flags,
            type_code,
            data,
        })
    }

    fn lod(&self, offset: usize) -> Result<LodRecord, Report<ReadError>> {
        let input = &mut self.input_at(offset)?;
        self.expect_tag(input, TAG_LOD)?;
        let [triangles, quads, spheres, vertices, edges, vertex_attributes, face_attributes, sphere_attributes] =
            self.parse(input, "LOD header", parse_u32s::<8>)?;

        let data = if spheres > 0 {
            let block = self.block(input, 18)?;
            let sphere = &mut &block[..];
            let (center, radius, material) = self.parse_detached(sphere, offset, "sphere", |i| {
                Ok((parse_f32s::<3>(i)?, le_f32.parse_next(i)?, le_u16.parse_next(i)?))
            })?;
            LodData::Sphere {
                center,
                radius,
                material,
            }
        } else {
            let v = vertices as usize;
            let normal_size = if self.compressed_normals { 4 } else { 12 };
            let block = self.block(input, v * (12 + normal_size + 8))?;
            let mut mesh = self.parse_detached(&mut &block[..], offset, "vertices", |i| {
                let mut mesh = MeshData::default();
                for _ in 0..v {
                    mesh.positions.push(parse_f32s(i)?);
                }
                for _ in 0..v {
                    let normal = if self.compressed_normals {
                        decode_octahedral(le_u32.parse_next(i)?).to_array()
                    } else {
                        parse_f32s(i)?
                    };
                    mesh.normals.push(normal);
                }
                for _ in 0..v {
                    mesh.uvs.push(parse_f32s(i)?);
                }
                Ok(mesh)
            })?;
            for _ in 0..vertex_attributes {
                mesh.attributes.push(self.attribute(input)?);
            }
            let block = self.block(input, triangles as usize * 12)?;
            mesh.triangles = self.parse_detached(&mut &block[..], offset, "triangles", |i| {
                (0..triangles).map(|_| parse_u32s(i)).collect()
            })?;
            let block = self.block(input, quads as usize * 16)?;
            mesh.quads = self.parse_detached(&mut &block[..], offset, "quads", |i| {
                (0..quads).map(|_| parse_u32s(i)).collect()
            })?;
            let faces = triangles as usize + quads as usize;
            let block = self.block(input, faces * 2)?;
            mesh.materials = self.parse_detached(&mut &block[..], offset, "materials", |i| {
                (0..faces).map(|_| le_u16.parse_next(i)).collect()
            })?;
            LodData::Mesh(mesh)
        };
        Ok(LodRecord {
            offset: offset as u64,
            triangles,
            quads,
            spheres,
            vertices,
            edges,
            vertex_attributes,
            face_attributes,
            sphere_attributes,
            data,
        })
    }

    /// Parse a block that no longer lives inside `data` (it was inflated).
    fn parse_detached<T>(
        &self,
        input: &mut &[u8],
        offset: usize,
        what: &str,
        parser: impl FnOnce(&mut &[u8]) -> WResult<T>,
    ) -> Result<T, Report<ReadError>> {
        parser(input).map_err(|e: ErrMode<ContextError>| {
            Report::new(ReadError::ParseError(format!(
                "{what} of LOD at 0x{offset:X}: {e}"
            )))
        })
    }

    fn object(&self, offset: usize) -> Result<ObjectRecord, Report<ReadError>> {
        let input = &mut self.input_at(offset)?;
        self.expect_tag(input, TAG_OBJECT)?;
        let name = self.parse(input, "object name", parse_string)?;
        let [flags, keyframe, prev] = self.parse(input, "object header", parse_u32s::<3>)?;
        let (min, max) = self.parse(input, "bounding box", |i| Ok((parse_f32s(i)?, parse_f32s(i)?)))?;
        let count = self.parse(input, "LOD count", |i| le_u32.parse_next(i))?;
        let jumps: Vec<u64> = self.parse(input, "LOD table", |i| {
            (0..count).map(|_| le_u64.parse_next(i)).collect()
        })?;
        let lods = jumps
            .into_iter()
            .map(|at| self.lod(at as usize))
            .collect::<Result<_, _>>()?;
        Ok(ObjectRecord {
            offset: offset as u64,
            name,
            flags,
            keyframe,
            prev,
            min,
            max,
            lods,
        })
    }
}

fn winnow_tag<'i>(input: &mut &'i [u8]) -> WResult<&'i [u8]> {
    take(4usize).parse_next(input)
}

/// Parse a complete `.mff` file.
pub fn read_mff(data: &[u8]) -> Result<MffFile, Report<ReadError>> {
    let mut reader = Reader {
        data,
        deflate: false,
        compressed_normals: false,
    };

    // ── Mats ──
    let input = &mut reader.input_at(0)?;
    reader.expect_tag(input, TAG_MATERIALS)?;
    let (materials_end, materials) = reader.parse(input, "material table", |i| {
        let end = le_u64.parse_next(i)?;
        let count = le_u32.parse_next(i)?;
        let names = (0..count).map(|_| parse_string(i)).collect::<WResult<Vec<_>>>()?;
        Ok((end, names))
    })?;

    // ── Bone ──
    let input = &mut reader.input_at(materials_end as usize)?;
    reader.expect_tag(input, TAG_BONES)?;
    let (bones_end, bones) = reader.parse(input, "bone section", |i| {
        let end = le_u64.parse_next(i)?;
        let bone_count = le_u32.parse_next(i)?;
        let keyframes = le_u32.parse_next(i)?;
        let total = bone_count as usize * keyframes as usize;
        let transforms = (0..total).map(|_| parse_f32s::<8>(i)).collect::<WResult<_>>()?;
        Ok((
            end,
            BoneSection {
                bone_count,
                keyframes,
                transforms,
            },
        ))
    })?;

    // ── Objs ──
    let input = &mut reader.input_at(bones_end as usize)?;
    reader.expect_tag(input, TAG_OBJECTS)?;
    let (instances_start, flags, jumps) = reader.parse(input, "object table", |i| {
        let start = le_u64.parse_next(i)?;
        let flags = le_u32.parse_next(i)?;
        let count = le_u32.parse_next(i)?;
        let jumps = (0..count).map(|_| le_u64.parse_next(i)).collect::<WResult<Vec<_>>>()?;
        Ok((start, flags, jumps))
    })?;
    reader.deflate = flags & FLAG_DEFLATE != 0;
    reader.compressed_normals = flags & FLAG_COMPRESSED_NORMALS != 0;
    let objects = jumps
        .into_iter()
        .map(|at| reader.object(at as usize))
        .collect::<Result<_, _>>()?;

    // ── Inst ──
    let input = &mut reader.input_at(instances_start as usize)?;
    reader.expect_tag(input, TAG_INSTANCES)?;
    let instances = reader.parse(input, "instance table", |i| {
        let count = le_u32.parse_next(i)?;
        (0..count).map(|_| parse_instance(i)).collect::<WResult<Vec<_>>>()
    })?;

    Ok(MffFile {
        materials,
        bones,
        flags,
        objects,
        instances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BinaryBuffer;

    fn minimal(objs: impl FnOnce(&mut BinaryBuffer)) -> Vec<u8> {
        let mut buf = BinaryBuffer::new();
        buf.put_tag(TAG_MATERIALS);
        let end = buf.reserve_u64();
        buf.put_u32(1);
        buf.put_string("Wall").unwrap();
        buf.patch_here(end);
        buf.put_tag(TAG_BONES);
        let end = buf.reserve_u64();
        buf.put_u32(0);
        buf.put_u32(0);
        buf.patch_here(end);
        objs(&mut buf);
        buf.finish()
    }

    #[test]
    fn reads_an_empty_scene() {
        let bytes = minimal(|buf| {
            buf.put_tag(TAG_OBJECTS);
            let start = buf.reserve_u64();
            buf.put_u32(FLAG_DEFLATE);
            buf.put_u32(0);
            buf.patch_here(start);
            buf.put_tag(TAG_INSTANCES);
            buf.put_u32(0);
        });
        let file = read_mff(&bytes).unwrap();
        assert_eq!(file.materials, vec!["Wall".to_string()]);
        assert_eq!(file.flags, FLAG_DEFLATE);
        assert!(file.objects.is_empty());
        assert!(file.instances.is_empty());
    }

    #[test]
    fn misplaced_jumps_are_reported() {
        let bytes = minimal(|buf| {
            buf.put_tag(TAG_OBJECTS);
            buf.put_u64(0);
            buf.put_u32(0);
            buf.put_u32(1);
            // Points back at the material table instead of an object.
            buf.put_u64(0);
        });
        let err = read_mff(&bytes).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ReadError::BadTag { offset: 0, found, .. } if found == "Mats"
        ));
    }

    #[test]
    fn truncated_files_fail_cleanly() {
        let bytes = minimal(|buf| buf.put_tag(TAG_OBJECTS));
        let err = read_mff(&bytes).unwrap_err();
        assert!(matches!(err.current_context(), ReadError::ParseError(_)));
    }
}
