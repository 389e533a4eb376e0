//! `PeScanner` service: walks the PE headers and marks every
//! non-deterministic field in a patch address space.

use crate::domain::constants::{CANONICAL_AGE, CANONICAL_TIMESTAMP};
use crate::domain::patch::{FileOffset, PatchAddressSpace, PatchData, PatchRange};
use crate::domain::pe::image::{
    PeImage, IMAGE_DEBUG_TYPE_CODEVIEW, IMAGE_DIRECTORY_ENTRY_EXPORT,
    IMAGE_DIRECTORY_ENTRY_RESOURCE,
};
use crate::infra::error::{CanonError, CanonResult};

/// Patch label of the derived PDB signature; reserved while scanning,
/// resolved after hashing.
pub const PDB_GUID_LABEL: &str = "PDB GUID";
/// Patch label of the checksum sentinel; stays pending through patching.
pub const PE_CHECKSUM_LABEL: &str = "PE Checksum";

pub struct PeScanner {
    produce_pdb: bool,
}

impl PeScanner {
    /// `produce_pdb` controls whether the CodeView GUID and age are
    /// marked; without a PDB they are left untouched.
    #[must_use]
    pub fn new(produce_pdb: bool) -> Self {
        Self { produce_pdb }
    }

    /// Populate a patch address space with every field that must change.
    pub fn scan(&self, image: &PeImage) -> CanonResult<PatchAddressSpace> {
        log::info!("Finding PE fields that need updating.");
        let mut space = PatchAddressSpace::new();
        let timestamp = CANONICAL_TIMESTAMP.to_le_bytes().to_vec();

        mark(
            &mut space,
            image.file_header_timestamp_offset(),
            4,
            PatchData::new("PE Timestamp", timestamp.clone()),
        )?;

        self.mark_data_directory_timestamp(
            image,
            &mut space,
            IMAGE_DIRECTORY_ENTRY_EXPORT,
            "Export Directory",
        )?;
        self.mark_data_directory_timestamp(
            image,
            &mut space,
            IMAGE_DIRECTORY_ENTRY_RESOURCE,
            "Resource Directory",
        )?;

        self.mark_debug_directories(image, &mut space)?;

        // Reserved last: the checksum is computed by a post-pass over the
        // fully patched file, so its bytes stay pending.
        mark(
            &mut space,
            image.checksum_offset(),
            4,
            PatchData::pending(PE_CHECKSUM_LABEL),
        )?;

        Ok(space)
    }

    /// Mark a data directory's TimeDateStamp if the directory exists and
    /// currently carries one. A zero stamp means "no timestamp recorded"
    /// and is left alone.
    fn mark_data_directory_timestamp(
        &self,
        image: &PeImage,
        space: &mut PatchAddressSpace,
        index: usize,
        name: &str,
    ) -> CanonResult<()> {
        let Some(directory) = image.data_directory(index)? else {
            log::info!("PE file contains no data directory {index}.");
            return Ok(());
        };
        let directory_offset = image.translate(directory.virtual_address).ok_or_else(|| {
            CanonError::PeStructure(format!(
                "failed to translate {name} address {:#x} to a file offset",
                directory.virtual_address
            ))
        })?;

        // Characteristics is the first field; TimeDateStamp follows.
        let timestamp_offset = directory_offset + 4;
        if image.read_u32(timestamp_offset)? == 0 {
            return Ok(());
        }

        mark(
            space,
            timestamp_offset,
            4,
            PatchData::new(
                format!("{name} Timestamp"),
                CANONICAL_TIMESTAMP.to_le_bytes().to_vec(),
            ),
        )
    }

    /// Mark every debug directory entry's timestamp, and the CodeView
    /// record's GUID and age when a PDB is being produced.
    fn mark_debug_directories(
        &self,
        image: &PeImage,
        space: &mut PatchAddressSpace,
    ) -> CanonResult<()> {
        let entries = image.debug_directory_entries()?;
        let mut codeview = None;

        for (index, entry) in entries.iter().enumerate() {
            mark(
                space,
                entry.timestamp_offset,
                4,
                PatchData::new(
                    format!("Debug Directory {index} Timestamp"),
                    CANONICAL_TIMESTAMP.to_le_bytes().to_vec(),
                ),
            )?;

            if entry.entry_type == IMAGE_DEBUG_TYPE_CODEVIEW {
                if codeview.is_some() {
                    return Err(CanonError::PeStructure(
                        "found multiple CodeView debug directories".into(),
                    ));
                }
                codeview = Some(image.codeview_record(entry)?);
            }
        }

        if self.produce_pdb {
            let codeview = codeview.ok_or_else(|| {
                CanonError::PeStructure("failed to find CodeView debug directory".into())
            })?;
            mark(
                space,
                codeview.age_offset,
                4,
                PatchData::new("PDB Age", CANONICAL_AGE.to_le_bytes().to_vec()),
            )?;
            mark(
                space,
                codeview.guid_offset,
                16,
                PatchData::pending(PDB_GUID_LABEL),
            )?;
        }

        Ok(())
    }
}

fn mark(
    space: &mut PatchAddressSpace,
    offset: FileOffset,
    size: u32,
    data: PatchData,
) -> CanonResult<()> {
    let label = data.label().to_string();
    let range = PatchRange::new(offset, size)?;
    space.insert(range, data).map_err(|e| {
        log::error!("Failed to mark {label}: {e}");
        e
    })
}
