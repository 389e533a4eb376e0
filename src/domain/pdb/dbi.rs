//! Fixed byte layouts of the PDB streams the rewriter touches.
//!
//! All fields are little-endian, read through bounds-checked slice
//! access so unaligned buffers are fine. Layouts per the DBI stream
//! documentation (llvm.org/docs/PDB/DbiStream.html).

use crate::infra::error::{CanonError, CanonResult};
use scroll::{Pread, LE};

/// Size of the `PdbInfoHeader70` prefix of the header info stream.
pub const PDB_INFO_HEADER_SIZE: usize = 28;
/// Offset of the timestamp field; age and signature follow contiguously.
pub const PDB_INFO_TIMESTAMP_OFFSET: usize = 4;
pub const PDB_INFO_AGE_OFFSET: usize = 8;
pub const PDB_INFO_SIGNATURE_OFFSET: usize = 12;

/// Header of the PDB header info stream (stream 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdbInfoHeader70 {
    pub version: u32,
    pub timestamp: u32,
    pub age: u32,
    pub signature: [u8; 16],
}

impl PdbInfoHeader70 {
    pub fn parse(bytes: &[u8]) -> CanonResult<Self> {
        if bytes.len() < PDB_INFO_HEADER_SIZE {
            return Err(CanonError::PdbStructure(
                "PDB header info stream too short".into(),
            ));
        }
        let mut signature = [0u8; 16];
        signature.copy_from_slice(&bytes[PDB_INFO_SIGNATURE_OFFSET..PDB_INFO_HEADER_SIZE]);
        Ok(Self {
            version: bytes.pread_with(0, LE)?,
            timestamp: bytes.pread_with(PDB_INFO_TIMESTAMP_OFFSET, LE)?,
            age: bytes.pread_with(PDB_INFO_AGE_OFFSET, LE)?,
            signature,
        })
    }
}

/// Size of the DBI stream header.
pub const DBI_HEADER_SIZE: usize = 64;
/// Offset of the age field inside the DBI header.
pub const DBI_AGE_OFFSET: usize = 8;

/// Header of the DBI stream (stream 3). Only the fields the rewriter
/// consults are lifted; the header bytes themselves pass through.
#[derive(Debug, Clone, Copy)]
pub struct DbiHeader {
    pub version_signature: i32,
    pub version_header: u32,
    pub age: u32,
    pub global_stream_index: u16,
    pub public_stream_index: u16,
    pub sym_record_stream: u16,
    pub mod_info_size: u32,
    pub section_contribution_size: u32,
}

impl DbiHeader {
    pub fn parse(bytes: &[u8]) -> CanonResult<Self> {
        if bytes.len() < DBI_HEADER_SIZE {
            return Err(CanonError::PdbStructure("DBI stream too short".into()));
        }
        Ok(Self {
            version_signature: bytes.pread_with(0x00, LE)?,
            version_header: bytes.pread_with(0x04, LE)?,
            age: bytes.pread_with(0x08, LE)?,
            global_stream_index: bytes.pread_with(0x0C, LE)?,
            public_stream_index: bytes.pread_with(0x10, LE)?,
            sym_record_stream: bytes.pread_with(0x14, LE)?,
            mod_info_size: bytes.pread_with(0x18, LE)?,
            section_contribution_size: bytes.pread_with(0x1C, LE)?,
        })
    }
}

/// Size of the fixed prefix of a module info record. Two NUL-terminated
/// strings and padding to a 4-byte boundary follow each record.
pub const MODULE_INFO_BASE_SIZE: usize = 64;
/// Offset of the per-module `offsets` scratch field the linker leaves
/// populated with meaningless values.
pub const MODULE_INFO_OFFSETS_OFFSET: usize = 52;

/// Size of one section contribution record.
pub const SECTION_CONTRIB_SIZE: usize = 28;
/// Offsets of the two 16-bit alignment holes in a section contribution.
pub const SECTION_CONTRIB_PAD1_OFFSET: usize = 2;
pub const SECTION_CONTRIB_PAD2_OFFSET: usize = 18;
