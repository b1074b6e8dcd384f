use std::io::Write;
use std::marker::PhantomData;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use glam::Vec3;
use rootcause::Report;

use super::FormatError;

mod sealed {
    pub trait Sealed {}
    impl Sealed for u32 {}
    impl Sealed for u64 {}
}

/// Fixed-width fields that can be reserved and patched later.
pub trait PatchValue: sealed::Sealed + Copy {
    const SIZE: usize;
    fn write_le(self, out: &mut [u8]);
}

impl PatchValue for u32 {
    const SIZE: usize = 4;
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }
}

impl PatchValue for u64 {
    const SIZE: usize = 8;
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }
}

/// A forward reference into a [`BinaryBuffer`].
///
/// Handles are neither `Clone` nor `Copy` and patching consumes them, so each
/// reserved field is patched at most once.
#[must_use = "a reserved field must be patched before the buffer is finished"]
#[derive(Debug)]
pub struct OffsetHandle<T: PatchValue> {
    offset: usize,
    _width: PhantomData<T>,
}

impl<T: PatchValue> OffsetHandle<T> {
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Growable little-endian output buffer with reserve/patch support.
#[derive(Debug, Default)]
pub struct BinaryBuffer {
    data: Vec<u8>,
    outstanding: usize,
}

/// zlib level used for every deflated block.
const DEFLATE_LEVEL: u32 = 8;

impl BinaryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write position, which is also the absolute offset of the next
    /// byte.
    pub fn position(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn put_tag(&mut self, tag: &[u8; 4]) {
        self.data.extend_from_slice(tag);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_vec3(&mut self, v: Vec3) {
        for c in v.to_array() {
            self.put_f32(c);
        }
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_string(&mut self, s: &str) -> Result<(), Report<FormatError>> {
        self.put_u32(len_u32("string", s.len())?);
        self.put_bytes(s.as_bytes());
        Ok(())
    }

    /// Write a zeroed placeholder to be filled in by [`BinaryBuffer::patch`].
    pub fn reserve<T: PatchValue>(&mut self) -> OffsetHandle<T> {
        let offset = self.data.len();
        self.data.resize(offset + T::SIZE, 0);
        self.outstanding += 1;
        OffsetHandle {
            offset,
            _width: PhantomData,
        }
    }

    pub fn reserve_u32(&mut self) -> OffsetHandle<u32> {
        self.reserve()
    }

    pub fn reserve_u64(&mut self) -> OffsetHandle<u64> {
        self.reserve()
    }

    pub fn patch<T: PatchValue>(&mut self, handle: OffsetHandle<T>, value: T) {
        value.write_le(&mut self.data[handle.offset..handle.offset + T::SIZE]);
        self.outstanding -= 1;
    }

    /// Patch `handle` with the current write position.
    pub fn patch_here(&mut self, handle: OffsetHandle<u64>) {
        let here = self.data.len() as u64;
        self.patch(handle, here);
    }

    /// Append a data block, deflated when `deflate` is set.
    ///
    /// Deflated blocks are prefixed with their compressed and uncompressed
    /// sizes. Empty blocks write nothing at all.
    pub fn put_block(&mut self, data: &[u8], deflate: bool) -> Result<(), Report<FormatError>> {
        if data.is_empty() {
            return Ok(());
        }
        if !deflate {
            self.put_bytes(data);
            return Ok(());
        }
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(DEFLATE_LEVEL));
        encoder
            .write_all(data)
            .map_err(|_| Report::new(FormatError::Compression(data.len())))?;
        let compressed = encoder
            .finish()
            .map_err(|_| Report::new(FormatError::Compression(data.len())))?;
        self.put_u32(len_u32("compressed block", compressed.len())?);
        self.put_u32(len_u32("block", data.len())?);
        self.put_bytes(&compressed);
        Ok(())
    }

    /// Number of reserved fields not yet patched.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn finish(self) -> Vec<u8> {
        debug_assert_eq!(
            self.outstanding, 0,
            "binary buffer finished with unpatched fields"
        );
        self.data
    }
}

pub(crate) fn len_u32(what: &'static str, len: usize) -> Result<u32, Report<FormatError>> {
    u32::try_from(len).map_err(|_| Report::new(FormatError::TooLarge { what, len }))
}

/// Little-endian scratch encoding for blocks built before they are appended.
pub(crate) trait PutLe {
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_f32(&mut self, v: f32);
}

impl PutLe for Vec<u8> {
    fn put_u16(&mut self, v: u16) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.extend_from_slice(&v.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::ZlibDecoder;

    use super::*;

    #[test]
    fn reserved_fields_are_patched_in_place() {
        let mut buf = BinaryBuffer::new();
        buf.put_tag(b"Test");
        let end = buf.reserve_u64();
        let count = buf.reserve_u32();
        buf.put_u32(7);
        buf.patch(count, 1);
        buf.patch_here(end);
        assert_eq!(buf.outstanding(), 0);
        let bytes = buf.finish();
        assert_eq!(&bytes[..4], b"Test");
        assert_eq!(u64::from_le_bytes(bytes[4..12].try_into().unwrap()), 20);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unpatched")]
    fn unpatched_fields_are_caught() {
        let mut buf = BinaryBuffer::new();
        let _handle = buf.reserve_u32();
        buf.finish();
    }

    #[test]
    fn deflated_blocks_carry_both_sizes() {
        let data: Vec<u8> = (0..200u32).flat_map(|i| (i % 7).to_le_bytes()).collect();
        let mut buf = BinaryBuffer::new();
        buf.put_block(&data, true).unwrap();
        let bytes = buf.finish();
        let compressed = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let raw = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        assert_eq!(raw, data.len());
        assert_eq!(bytes.len(), 8 + compressed);
        let mut out = Vec::new();
        ZlibDecoder::new(&bytes[8..]).read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn empty_blocks_write_nothing() {
        let mut buf = BinaryBuffer::new();
        buf.put_block(&[], true).unwrap();
        buf.put_block(&[], false).unwrap();
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut buf = BinaryBuffer::new();
        buf.put_string("Wood").unwrap();
        assert_eq!(buf.finish(), b"\x04\x00\x00\x00Wood");
    }
}
