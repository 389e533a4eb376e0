//! Light-weight PE header parse.
//!
//! Only the header graph is decomposed: DOS header, NT headers, data
//! directories, the debug directory and its CodeView record. That is
//! enough to locate every non-deterministic field; section contents are
//! never interpreted.

use crate::domain::patch::FileOffset;
use crate::infra::error::{CanonError, CanonResult};
use goblin::pe::PE;

/// Data directory index of the export table.
pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
/// Data directory index of the resource table.
pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
/// Data directory index of the debug directory.
pub const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;

/// Debug directory entry type carrying the CodeView PDB reference.
pub const IMAGE_DEBUG_TYPE_CODEVIEW: u32 = 2;

/// Size of one IMAGE_DEBUG_DIRECTORY entry.
pub const DEBUG_DIRECTORY_ENTRY_SIZE: u32 = 28;

/// CodeView 7.0 record signature ("RSDS").
const CV_SIGNATURE_RSDS: &[u8; 4] = b"RSDS";

/// A data directory entry as read from the optional header.
#[derive(Debug, Clone, Copy)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// One IMAGE_DEBUG_DIRECTORY entry, with the file offset of its
/// TimeDateStamp field already resolved.
#[derive(Debug, Clone, Copy)]
pub struct DebugDirectoryEntry {
    pub timestamp_offset: FileOffset,
    pub entry_type: u32,
    pub size_of_data: u32,
    pub pointer_to_raw_data: u32,
}

/// The CodeView (CvInfoPdb70) record a debug directory entry points at.
#[derive(Debug, Clone)]
pub struct CodeViewRecord {
    /// File offset of the 16-byte PDB signature.
    pub guid_offset: FileOffset,
    /// File offset of the 4-byte PDB age.
    pub age_offset: FileOffset,
    pub guid: [u8; 16],
    pub age: u32,
    /// PDB path embedded by the linker, NUL-terminated in the record.
    pub pdb_path: String,
}

#[derive(Debug, Clone, Copy)]
struct SectionRange {
    virtual_address: u32,
    pointer_to_raw_data: u32,
    size_of_raw_data: u32,
}

/// A parsed PE image held in memory.
#[derive(Debug)]
pub struct PeImage {
    bytes: Vec<u8>,
    pe_offset: usize,
    pe32_plus: bool,
    number_of_rva_and_sizes: u32,
    size_of_headers: u32,
    sections: Vec<SectionRange>,
}

impl PeImage {
    /// Parse the PE headers of `bytes`.
    pub fn parse(bytes: Vec<u8>) -> CanonResult<Self> {
        if bytes.len() < 64 || &bytes[0..2] != b"MZ" {
            return Err(CanonError::PeStructure(
                "not a PE file (missing MZ signature)".into(),
            ));
        }

        let pe = PE::parse(&bytes)?;
        let pe_offset = pe.header.dos_header.pe_pointer as usize;
        if pe_offset + 4 > bytes.len() || &bytes[pe_offset..pe_offset + 4] != b"PE\0\0" {
            return Err(CanonError::PeStructure("missing PE signature".into()));
        }

        let optional_header = pe
            .header
            .optional_header
            .ok_or_else(|| CanonError::PeStructure("missing optional header".into()))?;
        let pe32_plus = optional_header.standard_fields.magic == 0x20b;
        let number_of_rva_and_sizes = optional_header.windows_fields.number_of_rva_and_sizes;
        let size_of_headers = optional_header.windows_fields.size_of_headers;

        let sections = pe
            .sections
            .iter()
            .map(|section| SectionRange {
                virtual_address: section.virtual_address,
                pointer_to_raw_data: section.pointer_to_raw_data,
                size_of_raw_data: section.size_of_raw_data,
            })
            .collect();

        Ok(Self {
            bytes,
            pe_offset,
            pe32_plus,
            number_of_rva_and_sizes,
            size_of_headers,
            sections,
        })
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Translate a relative virtual address to a file offset.
    ///
    /// Addresses below SizeOfHeaders map to themselves; everything else is
    /// resolved through the section table. Addresses landing in a
    /// section's virtual-only tail (past its raw data) do not translate.
    #[must_use]
    pub fn translate(&self, rva: u32) -> Option<FileOffset> {
        if rva < self.size_of_headers {
            return Some(rva);
        }
        for section in &self.sections {
            if rva < section.virtual_address {
                continue;
            }
            let delta = rva - section.virtual_address;
            if delta < section.size_of_raw_data {
                return Some(section.pointer_to_raw_data + delta);
            }
        }
        None
    }

    /// File offset of FileHeader.TimeDateStamp.
    #[must_use]
    pub fn file_header_timestamp_offset(&self) -> FileOffset {
        (self.pe_offset + 8) as FileOffset
    }

    /// File offset of OptionalHeader.CheckSum (same for PE32 and PE32+).
    #[must_use]
    pub fn checksum_offset(&self) -> FileOffset {
        (self.pe_offset + 24 + 64) as FileOffset
    }

    fn data_directory_base(&self) -> usize {
        self.pe_offset + 24 + if self.pe32_plus { 112 } else { 96 }
    }

    /// Read a data directory entry, or `None` if the image has no such
    /// entry or the directory is absent (zero virtual address).
    pub fn data_directory(&self, index: usize) -> CanonResult<Option<DataDirectory>> {
        if index as u32 >= self.number_of_rva_and_sizes {
            return Ok(None);
        }
        let offset = self.data_directory_base() + index * 8;
        let virtual_address = self.read_u32(offset as FileOffset)?;
        let size = self.read_u32(offset as FileOffset + 4)?;
        if virtual_address == 0 {
            return Ok(None);
        }
        Ok(Some(DataDirectory {
            virtual_address,
            size,
        }))
    }

    /// Decode the debug directory into its entries. An absent debug
    /// directory yields an empty list.
    pub fn debug_directory_entries(&self) -> CanonResult<Vec<DebugDirectoryEntry>> {
        let Some(directory) = self.data_directory(IMAGE_DIRECTORY_ENTRY_DEBUG)? else {
            return Ok(Vec::new());
        };
        let base = self.translate(directory.virtual_address).ok_or_else(|| {
            CanonError::PeStructure(format!(
                "failed to translate debug directory address {:#x} to a file offset",
                directory.virtual_address
            ))
        })?;

        let count = directory.size / DEBUG_DIRECTORY_ENTRY_SIZE;
        let mut entries = Vec::with_capacity(count as usize);
        for index in 0..count {
            let entry_offset = base + index * DEBUG_DIRECTORY_ENTRY_SIZE;
            entries.push(DebugDirectoryEntry {
                timestamp_offset: entry_offset + 4,
                entry_type: self.read_u32(entry_offset + 12)?,
                size_of_data: self.read_u32(entry_offset + 16)?,
                pointer_to_raw_data: self.read_u32(entry_offset + 24)?,
            });
        }
        Ok(entries)
    }

    /// Decode the CvInfoPdb70 record referenced by a CodeView debug entry.
    pub fn codeview_record(&self, entry: &DebugDirectoryEntry) -> CanonResult<CodeViewRecord> {
        let base = entry.pointer_to_raw_data;
        if entry.size_of_data < 24 + 1 {
            return Err(CanonError::PeStructure(format!(
                "CodeView record of {} bytes is too short",
                entry.size_of_data
            )));
        }
        let end = base
            .checked_add(entry.size_of_data)
            .filter(|end| *end as usize <= self.bytes.len())
            .ok_or_else(|| {
                CanonError::PeStructure("CodeView record extends past end of file".into())
            })? as usize;

        let signature = self.read_slice(base, 4)?;
        if signature != CV_SIGNATURE_RSDS {
            return Err(CanonError::PeStructure(format!(
                "CodeView record has unsupported signature {signature:02x?} (expected RSDS)"
            )));
        }

        let mut guid = [0u8; 16];
        guid.copy_from_slice(self.read_slice(base + 4, 16)?);
        let age = self.read_u32(base + 20)?;

        let path_start = base as usize + 24;
        let path_end = self.bytes[path_start..end]
            .iter()
            .position(|byte| *byte == 0)
            .map(|nul| path_start + nul)
            .ok_or_else(|| {
                CanonError::PeStructure("CodeView PDB path is not NUL-terminated".into())
            })?;
        let pdb_path = String::from_utf8_lossy(&self.bytes[path_start..path_end]).into_owned();

        Ok(CodeViewRecord {
            guid_offset: base + 4,
            age_offset: base + 20,
            guid,
            age,
            pdb_path,
        })
    }

    /// Read a little-endian u32 at an absolute file offset.
    pub fn read_u32(&self, offset: FileOffset) -> CanonResult<u32> {
        let slice = self.read_slice(offset, 4)?;
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    }

    fn read_slice(&self, offset: FileOffset, len: usize) -> CanonResult<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => Ok(&self.bytes[start..end]),
            None => Err(CanonError::PeStructure(format!(
                "read of {len} bytes at offset {offset:#x} is out of bounds"
            ))),
        }
    }
}
