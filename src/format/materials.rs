use rootcause::Report;

use super::{BinaryBuffer, FormatError, TAG_MATERIALS, buffer::len_u32};
use crate::material::MaterialTable;

/// Write the `Mats` section: the end offset of the section, the material
/// count and every material name in index order.
pub fn write_materials(
    buf: &mut BinaryBuffer,
    table: &MaterialTable,
) -> Result<(), Report<FormatError>> {
    buf.put_tag(TAG_MATERIALS);
    let end = buf.reserve_u64();
    buf.put_u32(len_u32("material count", table.len())?);
    for entry in table.entries() {
        buf.put_string(&entry.name)?;
    }
    buf.patch_here(end);
    Ok(())
}
