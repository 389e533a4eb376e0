//! `GuidHasher` service: derives the PDB signature from the PE contents.
//!
//! The signature is the MD5 of the image with every patched range
//! elided, so two identical inputs always couple to the same PDB and
//! the signature never depends on the bytes being rewritten.

use crate::domain::patch::PatchAddressSpace;
use crate::infra::error::{CanonError, CanonResult};
use crate::services::scanner::PDB_GUID_LABEL;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub struct GuidHasher;

impl GuidHasher {
    /// Hash the PE at `path`, skipping exactly the ranges in `space`, and
    /// resolve the pending "PDB GUID" entry with the digest.
    pub fn derive(pe_path: &Path, space: &mut PatchAddressSpace) -> CanonResult<[u8; 16]> {
        log::info!("Calculating PDB GUID from PE file contents.");

        let mut file = File::open(pe_path).map_err(|e| {
            CanonError::Io(format!("failed to open {}: {e}", pe_path.display()))
        })?;
        let file_length = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        let mut context = Md5::new();
        let mut cursor: u64 = 0;
        for (range, _) in space.iter() {
            let start = u64::from(range.start());
            if cursor < start {
                md5_consume(&mut file, start - cursor, &mut context)?;
            }
            file.seek(SeekFrom::Current(i64::from(range.size())))?;
            cursor = u64::from(range.end());
        }
        if cursor < file_length {
            md5_consume(&mut file, file_length - cursor, &mut context)?;
        }

        let digest: [u8; 16] = context.finalize().into();
        log::info!("Final GUID is {}.", hex_digest(&digest));

        space.set_bytes(PDB_GUID_LABEL, digest.to_vec())?;
        Ok(digest)
    }
}

/// Feed `count` bytes from `reader` into the digest in fixed buffers.
fn md5_consume(reader: &mut impl Read, count: u64, context: &mut Md5) -> CanonResult<()> {
    let mut buffer = [0u8; 4096];
    let mut remaining = count;
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        reader.read_exact(&mut buffer[..chunk]).map_err(|e| {
            CanonError::Io(format!("error reading {chunk} bytes for hashing: {e}"))
        })?;
        context.update(&buffer[..chunk]);
        remaining -= chunk as u64;
    }
    Ok(())
}

/// MD5 of an entire file, with its length. Used for summary output.
pub fn md5_file(path: &Path) -> CanonResult<(u64, [u8; 16])> {
    let mut file = File::open(path)
        .map_err(|e| CanonError::Io(format!("failed to open {}: {e}", path.display())))?;
    let length = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;

    let mut context = Md5::new();
    md5_consume(&mut file, length, &mut context)?;
    Ok((length, context.finalize().into()))
}

/// Lowercase hex rendering of a digest.
#[must_use]
pub fn hex_digest(digest: &[u8]) -> String {
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::patch::{PatchData, PatchRange};
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn digest_skips_exactly_the_marked_ranges() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let file = write_temp(&data);

        let mut space = PatchAddressSpace::new();
        space
            .insert(
                PatchRange::new(100, 4).unwrap(),
                PatchData::new("a", vec![0; 4]),
            )
            .unwrap();
        space
            .insert(
                PatchRange::new(5000, 16).unwrap(),
                PatchData::pending(PDB_GUID_LABEL),
            )
            .unwrap();

        let digest = GuidHasher::derive(file.path(), &mut space).unwrap();

        // Reference: hash the same bytes with the ranges removed.
        let mut expected = Md5::new();
        expected.update(&data[..100]);
        expected.update(&data[104..5000]);
        expected.update(&data[5016..]);
        let expected: [u8; 16] = expected.finalize().into();
        assert_eq!(digest, expected);

        // The pending GUID entry now carries the digest.
        let resolved = space
            .iter()
            .find(|(_, d)| d.label() == PDB_GUID_LABEL)
            .unwrap()
            .1;
        assert_eq!(resolved.bytes(), Some(&digest[..]));
    }

    #[test]
    fn digest_is_insensitive_to_bytes_inside_ranges() {
        let mut data = vec![0x11u8; 4096];
        let file_a = write_temp(&data);
        data[200..216].fill(0xEE);
        let file_b = write_temp(&data);

        let space_for = |path: &std::path::Path| {
            let mut space = PatchAddressSpace::new();
            space
                .insert(
                    PatchRange::new(200, 16).unwrap(),
                    PatchData::pending(PDB_GUID_LABEL),
                )
                .unwrap();
            GuidHasher::derive(path, &mut space).unwrap()
        };
        assert_eq!(space_for(file_a.path()), space_for(file_b.path()));
    }

    #[test]
    fn hex_digest_formats_lowercase() {
        assert_eq!(hex_digest(&[0x00, 0xAB, 0x0F]), "00ab0f");
    }
}
