//! `FilePatcher` service: stamps a patch address space onto a file and
//! refreshes the PE checksum.

use crate::domain::patch::PatchAddressSpace;
use crate::domain::pe::checksum::update_file_checksum;
use crate::infra::error::{CanonError, CanonResult};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

pub struct FilePatcher;

impl Default for FilePatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FilePatcher {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Copy `input` to `output` when the paths differ, then write every
    /// resolved patch entry in ascending order and recompute the PE
    /// checksum over the result.
    ///
    /// Entries whose bytes are still pending are skipped: that is the
    /// checksum sentinel, which the checksum pass fills afterwards.
    pub fn apply(
        &self,
        space: &PatchAddressSpace,
        input: &Path,
        output: &Path,
    ) -> CanonResult<()> {
        if !paths_alias(input, output) {
            std::fs::copy(input, output).map_err(|e| {
                CanonError::Io(format!(
                    "failed to copy {} to {}: {e}",
                    input.display(),
                    output.display()
                ))
            })?;
        }

        log::info!("Patching file: {}", output.display());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(output)
            .map_err(|e| {
                CanonError::Io(format!(
                    "unable to open file for updating {}: {e}",
                    output.display()
                ))
            })?;

        for (range, data) in space.iter() {
            let Some(bytes) = data.bytes() else {
                log::debug!("  leaving {} for the checksum pass", data.label());
                continue;
            };
            log::info!(
                "  patching {}, {} bytes at offset {:#x}",
                data.label(),
                range.size(),
                range.start()
            );
            file.seek(SeekFrom::Start(u64::from(range.start())))
                .map_err(|e| {
                    CanonError::Io(format!(
                        "failed to seek to {:#x} of {}: {e}",
                        range.start(),
                        output.display()
                    ))
                })?;
            file.write_all(bytes).map_err(|e| {
                CanonError::Io(format!(
                    "failed to write {} bytes at {:#x} of {}: {e}",
                    range.size(),
                    range.start(),
                    output.display()
                ))
            })?;
        }
        drop(file);
        log::info!("Finished patching file: {}", output.display());

        log::info!("Updating checksum for PE file: {}", output.display());
        update_file_checksum(output)
    }
}

/// Whether two paths refer to the same file on disk. Copying a file onto
/// itself would truncate it, so this must be resolved before copying.
fn paths_alias(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
