//! Metadata-only PE inspection.
//!
//! An RPC server binary carries its interface identifier as a 16-byte blob
//! in a well-known raw-data resource slot (`RT_RCDATA`, id 1). This module
//! reads that blob without executing the binary or resolving its imports:
//! the file is read into a transient buffer, headers and the resource
//! directory are walked with bounds checks, and the buffer is released on
//! every exit path by ownership. Corrupt or inaccessible input yields
//! `None` with a diagnostic, never a panic.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::guid::InterfaceId;

/// Resource type for application-defined raw data.
const RT_RCDATA: u32 = 10;

/// Resource id of the interface-identity slot.
const IDENTITY_RESOURCE_ID: u32 = 1;

/// High bit of a resource directory entry offset marks a subdirectory.
const SUBDIR_FLAG: u32 = 0x8000_0000;

// =============================================================================
// Types
// =============================================================================

/// Section header information needed for RVA translation.
#[derive(Debug, Clone)]
struct SectionInfo {
    virtual_address: u32,
    virtual_size: u32,
    pointer_to_raw_data: u32,
    size_of_raw_data: u32,
}

/// The slice of PE metadata the resource walk needs.
#[derive(Debug)]
struct PeLayout {
    sections: Vec<SectionInfo>,
    resource_rva: u32,
    resource_size: u32,
}

// =============================================================================
// Extraction
// =============================================================================

/// Read the interface identifier embedded in `path`.
///
/// Returns `None` when the file cannot be read, is not a PE image, has no
/// identity resource, or the resource is shorter than an identifier.
pub fn extract_interface_id(path: &Path) -> Option<InterfaceId> {
    let image = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %path.display(), %err, "failed to read binary");
            return None;
        }
    };

    let Some(layout) = parse_layout(&image) else {
        debug!(path = %path.display(), "not a loadable PE image");
        return None;
    };

    let Some((offset, size)) = find_identity_resource(&image, &layout) else {
        debug!(path = %path.display(), "no identity resource");
        return None;
    };

    if (size as usize) < InterfaceId::SIZE || offset + InterfaceId::SIZE > image.len() {
        debug!(path = %path.display(), size, "identity resource too short");
        return None;
    }

    let mut bytes = [0u8; InterfaceId::SIZE];
    bytes.copy_from_slice(&image[offset..offset + InterfaceId::SIZE]);
    Some(InterfaceId::from_le_bytes(bytes))
}

// =============================================================================
// Header Parsing
// =============================================================================

fn read_u16(image: &[u8], offset: usize) -> Option<u16> {
    let bytes = image.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(image: &[u8], offset: usize) -> Option<u32> {
    let bytes = image.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_layout(image: &[u8]) -> Option<PeLayout> {
    if image.len() < 64 || image[0] != 0x4D || image[1] != 0x5A {
        return None;
    }

    let e_lfanew = read_u32(image, 0x3C)? as usize;
    if !(64..=1024).contains(&e_lfanew) {
        return None;
    }

    let signature = image.get(e_lfanew..e_lfanew + 4)?;
    if signature != b"PE\0\0" {
        return None;
    }

    let number_of_sections = read_u16(image, e_lfanew + 6)?;
    let size_of_optional_header = read_u16(image, e_lfanew + 20)? as usize;
    if number_of_sections == 0 || number_of_sections > 96 {
        return None;
    }

    let opt_offset = e_lfanew + 24;
    let magic = read_u16(image, opt_offset)?;
    // Data directory table position depends on PE32 vs PE32+.
    let (count_offset, dirs_offset) = match magic {
        0x10B => (opt_offset + 92, opt_offset + 96),
        0x20B => (opt_offset + 108, opt_offset + 112),
        _ => return None,
    };

    // Resource table is data directory index 2.
    let dir_count = read_u32(image, count_offset)?;
    if dir_count < 3 {
        return None;
    }
    let resource_rva = read_u32(image, dirs_offset + 2 * 8)?;
    let resource_size = read_u32(image, dirs_offset + 2 * 8 + 4)?;
    if resource_rva == 0 || resource_size == 0 {
        return None;
    }

    let section_table_offset = opt_offset + size_of_optional_header;
    let mut sections = Vec::with_capacity(number_of_sections as usize);
    for i in 0..number_of_sections as usize {
        let offset = section_table_offset + i * 40;
        sections.push(SectionInfo {
            virtual_size: read_u32(image, offset + 8)?,
            virtual_address: read_u32(image, offset + 12)?,
            size_of_raw_data: read_u32(image, offset + 16)?,
            pointer_to_raw_data: read_u32(image, offset + 20)?,
        });
    }

    Some(PeLayout {
        sections,
        resource_rva,
        resource_size,
    })
}

/// Translate an RVA to a file offset through the section table.
fn rva_to_offset(layout: &PeLayout, rva: u32) -> Option<usize> {
    for section in &layout.sections {
        let span = section.virtual_size.max(section.size_of_raw_data);
        if rva >= section.virtual_address && rva - section.virtual_address < span {
            let delta = rva - section.virtual_address;
            return Some(section.pointer_to_raw_data as usize + delta as usize);
        }
    }
    None
}

// =============================================================================
// Resource Directory Walk
// =============================================================================

/// Find the id entry `want` in the resource directory at `dir_offset`
/// (relative to the resource section base) and return its offset field.
fn find_id_entry(image: &[u8], resource_base: usize, dir_offset: u32, want: u32) -> Option<u32> {
    let dir = resource_base + dir_offset as usize;
    let named = read_u16(image, dir + 12)? as usize;
    let ids = read_u16(image, dir + 14)? as usize;

    // Id entries follow the named entries.
    for i in named..named + ids {
        let entry = dir + 16 + i * 8;
        let id = read_u32(image, entry)?;
        if id == want {
            return read_u32(image, entry + 4);
        }
    }
    None
}

/// First entry of the directory at `dir_offset`, regardless of its id. Used
/// at the language level, where any variant of the resource will do.
fn first_entry(image: &[u8], resource_base: usize, dir_offset: u32) -> Option<u32> {
    let dir = resource_base + dir_offset as usize;
    let named = read_u16(image, dir + 12)? as usize;
    let ids = read_u16(image, dir + 14)? as usize;
    if named + ids == 0 {
        return None;
    }
    read_u32(image, dir + 16 + 4)
}

/// Walk type / id / language levels down to the identity resource's data
/// entry and return its `(file_offset, size)`.
fn find_identity_resource(image: &[u8], layout: &PeLayout) -> Option<(usize, u32)> {
    let resource_base = rva_to_offset(layout, layout.resource_rva)?;

    let type_entry = find_id_entry(image, resource_base, 0, RT_RCDATA)?;
    if type_entry & SUBDIR_FLAG == 0 {
        return None;
    }
    let name_entry = find_id_entry(
        image,
        resource_base,
        type_entry & !SUBDIR_FLAG,
        IDENTITY_RESOURCE_ID,
    )?;
    if name_entry & SUBDIR_FLAG == 0 {
        return None;
    }
    let data_entry = first_entry(image, resource_base, name_entry & !SUBDIR_FLAG)?;
    if data_entry & SUBDIR_FLAG != 0 {
        return None;
    }

    let entry = resource_base + data_entry as usize;
    let data_rva = read_u32(image, entry)?;
    let size = read_u32(image, entry + 4)?;
    if size > layout.resource_size {
        return None;
    }

    let offset = rva_to_offset(layout, data_rva)?;
    Some((offset, size))
}

// =============================================================================
// Test Image Builder
// =============================================================================

/// Build a minimal PE32+ image with a single `.rsrc` section carrying the
/// identity resource. Shared by the extractor and scanner tests.
#[cfg(test)]
pub(crate) fn build_image_with_identity(payload: &[u8]) -> Vec<u8> {
    const SECTION_RVA: u32 = 0x1000;
    const SECTION_RAW: u32 = 0x200;

    // Resource section: root dir -> RCDATA subdir -> id-1 subdir ->
    // language entry -> data entry -> payload.
    let mut rsrc = vec![0u8; 0x58 + payload.len()];
    let dir = |buf: &mut [u8], at: usize, ids: u16| {
        buf[at + 14..at + 16].copy_from_slice(&ids.to_le_bytes());
    };
    let entry = |buf: &mut [u8], at: usize, id: u32, offset: u32| {
        buf[at..at + 4].copy_from_slice(&id.to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&offset.to_le_bytes());
    };
    dir(&mut rsrc, 0x00, 1);
    entry(&mut rsrc, 0x10, RT_RCDATA, SUBDIR_FLAG | 0x18);
    dir(&mut rsrc, 0x18, 1);
    entry(&mut rsrc, 0x28, IDENTITY_RESOURCE_ID, SUBDIR_FLAG | 0x30);
    dir(&mut rsrc, 0x30, 1);
    entry(&mut rsrc, 0x40, 0x409, 0x48);
    // Data entry: RVA within the section, size, code page, reserved.
    rsrc[0x48..0x4C].copy_from_slice(&(SECTION_RVA + 0x58).to_le_bytes());
    rsrc[0x4C..0x50].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    rsrc[0x58..].copy_from_slice(payload);

    let mut image = vec![0u8; (SECTION_RAW + SECTION_RAW.max(rsrc.len() as u32)) as usize];
    // DOS header.
    image[0] = 0x4D;
    image[1] = 0x5A;
    image[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
    // PE signature + COFF header.
    image[0x80..0x84].copy_from_slice(&[0x50, 0x45, 0x00, 0x00]);
    image[0x84..0x86].copy_from_slice(&0x8664u16.to_le_bytes());
    image[0x86..0x88].copy_from_slice(&1u16.to_le_bytes()); // one section
    image[0x94..0x96].copy_from_slice(&0xF0u16.to_le_bytes()); // optional header size
    // Optional header (PE32+).
    let opt = 0x98;
    image[opt..opt + 2].copy_from_slice(&0x20Bu16.to_le_bytes());
    image[opt + 108..opt + 112].copy_from_slice(&16u32.to_le_bytes());
    // Resource directory entry (index 2).
    image[opt + 112 + 16..opt + 112 + 20].copy_from_slice(&SECTION_RVA.to_le_bytes());
    image[opt + 112 + 20..opt + 112 + 24].copy_from_slice(&(rsrc.len() as u32).to_le_bytes());
    // Section header for .rsrc.
    let sect = opt + 0xF0;
    image[sect..sect + 5].copy_from_slice(b".rsrc");
    image[sect + 8..sect + 12].copy_from_slice(&(rsrc.len() as u32).to_le_bytes());
    image[sect + 12..sect + 16].copy_from_slice(&SECTION_RVA.to_le_bytes());
    image[sect + 16..sect + 20].copy_from_slice(&(rsrc.len() as u32).to_le_bytes());
    image[sect + 20..sect + 24].copy_from_slice(&SECTION_RAW.to_le_bytes());

    image[SECTION_RAW as usize..SECTION_RAW as usize + rsrc.len()].copy_from_slice(&rsrc);
    image
}
