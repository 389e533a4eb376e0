//! PE (Portable Executable) domain types and operations.
//!
//! Provides the light-weight header decomposition used to locate
//! non-deterministic fields, plus the standard PE checksum.

pub mod checksum;
pub mod image;

pub use checksum::{calculate_pe_checksum, update_file_checksum, update_pe_checksum};
pub use image::{
    CodeViewRecord, DataDirectory, DebugDirectoryEntry, PeImage, DEBUG_DIRECTORY_ENTRY_SIZE,
    IMAGE_DEBUG_TYPE_CODEVIEW, IMAGE_DIRECTORY_ENTRY_DEBUG, IMAGE_DIRECTORY_ENTRY_EXPORT,
    IMAGE_DIRECTORY_ENTRY_RESOURCE,
};
