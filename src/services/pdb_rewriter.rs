//! `PdbRewriter` service: rewrites a PDB into canonical form.
//!
//! The streams are normalized in memory and the whole container is then
//! re-serialized, so the output is canonical as long as the container
//! writer is. Only four streams are touched; everything else passes
//! through byte-identical.

use crate::domain::constants::{CANONICAL_AGE, CANONICAL_TIMESTAMP};
use crate::domain::pdb::dbi::{
    DbiHeader, DBI_AGE_OFFSET, DBI_HEADER_SIZE, MODULE_INFO_BASE_SIZE, MODULE_INFO_OFFSETS_OFFSET,
    PDB_INFO_HEADER_SIZE, PDB_INFO_TIMESTAMP_OFFSET, SECTION_CONTRIB_PAD1_OFFSET,
    SECTION_CONTRIB_PAD2_OFFSET, SECTION_CONTRIB_SIZE,
};
use crate::domain::pdb::msf::{PdbFile, PDB_DBI_STREAM, PDB_HEADER_INFO_STREAM, PDB_OLD_DIRECTORY_STREAM};
use crate::infra::error::{CanonError, CanonResult};
use scroll::{Pwrite, LE};
use std::path::Path;

/// Stream index value meaning "no stream".
const INVALID_STREAM_INDEX: u16 = 0xFFFF;

pub struct PdbRewriter {
    timestamp: u32,
    age: u32,
}

impl Default for PdbRewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PdbRewriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: CANONICAL_TIMESTAMP,
            age: CANONICAL_AGE,
        }
    }

    /// Normalize every non-deterministic stream of `pdb` in memory,
    /// stamping `guid` as the new signature.
    pub fn normalize(&self, pdb: &mut PdbFile, guid: [u8; 16]) -> CanonResult<()> {
        // A freshly generated PDB carries no old directory, and after the
        // rewrite it would reference pages that no longer exist.
        pdb.replace_stream(PDB_OLD_DIRECTORY_STREAM, Some(Vec::new()));

        self.update_header_stream(pdb, guid)?;
        let dbi_header = self.normalize_dbi_stream(pdb)?;
        self.normalize_symbol_record_stream(pdb, dbi_header.sym_record_stream)?;
        self.normalize_public_symbol_stream(pdb, dbi_header.public_stream_index)?;
        Ok(())
    }

    /// Overwrite timestamp, age and signature in the header info stream;
    /// every other header field is preserved.
    fn update_header_stream(&self, pdb: &mut PdbFile, guid: [u8; 16]) -> CanonResult<()> {
        log::info!("Updating PDB header.");
        let stream = pdb.stream_mut(PDB_HEADER_INFO_STREAM).ok_or_else(|| {
            CanonError::PdbStructure("no header info stream in PDB file".into())
        })?;
        if stream.len() < PDB_INFO_HEADER_SIZE {
            return Err(CanonError::PdbStructure(
                "PDB header info stream too short".into(),
            ));
        }
        let mut offset = PDB_INFO_TIMESTAMP_OFFSET;
        stream.gwrite_with::<u32>(self.timestamp, &mut offset, LE)?;
        stream.gwrite_with::<u32>(self.age, &mut offset, LE)?;
        stream[offset..offset + 16].copy_from_slice(&guid);
        Ok(())
    }

    /// Rewrite the DBI age and blank the linker scratch fields in the
    /// module info and section contribution substreams.
    fn normalize_dbi_stream(&self, pdb: &mut PdbFile) -> CanonResult<DbiHeader> {
        log::info!("Updating PDB DBI stream.");
        let age = self.age;
        let stream = pdb
            .stream_mut(PDB_DBI_STREAM)
            .ok_or_else(|| CanonError::PdbStructure("no DBI stream in PDB file".into()))?;

        let header = DbiHeader::parse(stream)?;
        stream.pwrite_with::<u32>(age, DBI_AGE_OFFSET, LE)?;

        // Module info substream.
        let module_info_end = DBI_HEADER_SIZE
            .checked_add(header.mod_info_size as usize)
            .filter(|end| *end <= stream.len())
            .ok_or_else(|| {
                CanonError::PdbStructure("invalid DBI header mod_info_size".into())
            })?;
        let mut cursor = DBI_HEADER_SIZE;
        while cursor < module_info_end {
            if cursor + MODULE_INFO_BASE_SIZE > module_info_end {
                return Err(CanonError::PdbStructure(
                    "module info record overruns its substream".into(),
                ));
            }
            stream.pwrite_with::<u32>(0, cursor + MODULE_INFO_OFFSETS_OFFSET, LE)?;
            cursor += MODULE_INFO_BASE_SIZE;

            // Module name and object file name, both NUL-terminated.
            for _ in 0..2 {
                while cursor < module_info_end && stream[cursor] != 0 {
                    cursor += 1;
                }
                if cursor >= module_info_end {
                    return Err(CanonError::PdbStructure(
                        "unterminated module info string".into(),
                    ));
                }
                cursor += 1;
            }
            cursor = (cursor + 3) & !3;
        }

        // Section contribution substream, after a 4-byte version word.
        let contrib_start = module_info_end + 4;
        let contrib_end = contrib_start
            .checked_add(header.section_contribution_size as usize)
            .filter(|end| *end <= stream.len())
            .ok_or_else(|| {
                CanonError::PdbStructure(
                    "invalid DBI header section_contribution_size".into(),
                )
            })?;
        let mut cursor = contrib_start;
        while cursor + SECTION_CONTRIB_SIZE <= contrib_end {
            stream.pwrite_with::<u16>(0, cursor + SECTION_CONTRIB_PAD1_OFFSET, LE)?;
            stream.pwrite_with::<u16>(0, cursor + SECTION_CONTRIB_PAD2_OFFSET, LE)?;
            cursor += SECTION_CONTRIB_SIZE;
        }

        Ok(header)
    }

    /// Zero the tail padding of every symbol record. The linker fills the
    /// bytes between a record's name terminator and its 4-byte-aligned end
    /// with whatever was in its buffers.
    fn normalize_symbol_record_stream(&self, pdb: &mut PdbFile, index: u16) -> CanonResult<()> {
        log::info!("Updating PDB symbol record stream.");
        if index == INVALID_STREAM_INDEX {
            return Err(CanonError::PdbStructure(
                "DBI header names no symbol record stream".into(),
            ));
        }
        let stream = pdb.stream_mut(index as usize).ok_or_else(|| {
            CanonError::PdbStructure(format!("missing symbol record stream {index}"))
        })?;

        let len = stream.len();
        let mut position = 0usize;
        while position < len {
            if position + 2 > len {
                return Err(CanonError::PdbStructure(
                    "truncated symbol record length".into(),
                ));
            }
            let size = u16::from_le_bytes([stream[position], stream[position + 1]]) as usize;
            position += 2;

            // Each record is the length word, a u16 record type, then the
            // payload, with the whole record padded to a multiple of 4.
            if size < 2 || (size + 2) % 4 != 0 {
                return Err(CanonError::PdbStructure(format!(
                    "symbol record at offset {} has invalid size {size}",
                    position - 2
                )));
            }
            if position + size > len {
                return Err(CanonError::PdbStructure(format!(
                    "symbol record at offset {} overruns the stream",
                    position - 2
                )));
            }
            let end = position + size;
            if size == 2 {
                // Type-only record; nothing after the type to scrub.
                position = end;
                continue;
            }

            // At most the last 3 bytes are padding. Find the record's NUL
            // terminator among them and zero everything from there on.
            let mut tail = end - 3;
            while tail + 1 < end && stream[tail] != 0 {
                tail += 1;
            }
            stream[tail..end].fill(0);
            position = end;
        }
        Ok(())
    }

    /// The public symbol info header has a 4-byte hole at offset 24 that
    /// the linker leaves uninitialized.
    fn normalize_public_symbol_stream(&self, pdb: &mut PdbFile, index: u16) -> CanonResult<()> {
        if index == INVALID_STREAM_INDEX {
            return Err(CanonError::PdbStructure(
                "DBI header names no public symbol info stream".into(),
            ));
        }
        let stream = pdb.stream_mut(index as usize).ok_or_else(|| {
            CanonError::PdbStructure(format!("missing public symbol info stream {index}"))
        })?;
        if stream.len() < 28 {
            return Err(CanonError::PdbStructure(
                "public symbol info stream too short".into(),
            ));
        }
        stream.pwrite_with::<u32>(0, 24, LE)?;
        Ok(())
    }

    /// Write the rewritten PDB next to its destination and atomically
    /// replace it, so a failed run never leaves a half-written PDB.
    pub fn write_atomic(&self, pdb: &PdbFile, output_pdb: &Path) -> CanonResult<()> {
        let output_dir = match output_pdb.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file_name = output_pdb.file_name().ok_or_else(|| {
            CanonError::Io(format!(
                "output PDB path {} has no file name",
                output_pdb.display()
            ))
        })?;

        // Stay on the same volume so the final rename is atomic.
        let temp_dir = tempfile::TempDir::new_in(output_dir).map_err(|e| {
            CanonError::Io(format!(
                "failed to create temporary directory in {}: {e}",
                output_dir.display()
            ))
        })?;
        let temp_path = temp_dir.path().join(file_name);

        log::info!("Creating temporary PDB file: {}", temp_path.display());
        pdb.write(&temp_path)?;

        std::fs::rename(&temp_path, output_pdb).map_err(|e| {
            CanonError::Io(format!(
                "unable to replace PDB file {}: {e}",
                output_pdb.display()
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pdb::dbi::PdbInfoHeader70;

    fn header_stream(timestamp: u32, age: u32, guid: [u8; 16]) -> Vec<u8> {
        let mut bytes = vec![0u8; 32];
        bytes[0..4].copy_from_slice(&20000404u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&timestamp.to_le_bytes());
        bytes[8..12].copy_from_slice(&age.to_le_bytes());
        bytes[12..28].copy_from_slice(&guid);
        bytes
    }

    fn dbi_stream(age: u32) -> Vec<u8> {
        // Header + one module info record + version word + two contribs.
        let mut bytes = vec![0u8; DBI_HEADER_SIZE];
        bytes[0x00..0x04].copy_from_slice(&(-1i32).to_le_bytes());
        bytes[0x04..0x08].copy_from_slice(&19990903u32.to_le_bytes());
        bytes[0x08..0x0C].copy_from_slice(&age.to_le_bytes());
        bytes[0x10..0x12].copy_from_slice(&5u16.to_le_bytes()); // public symbols
        bytes[0x14..0x16].copy_from_slice(&6u16.to_le_bytes()); // symbol records

        // Module info: 64-byte base, "a.obj\0", "a.lib\0", pad to 4.
        let mut module = vec![0u8; MODULE_INFO_BASE_SIZE];
        module[MODULE_INFO_OFFSETS_OFFSET..MODULE_INFO_OFFSETS_OFFSET + 4]
            .copy_from_slice(&0x1234_5678u32.to_le_bytes());
        module.extend_from_slice(b"a.obj\0a.lib\0");
        bytes[0x18..0x1C].copy_from_slice(&(module.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&module);

        bytes.extend_from_slice(&0xF00D_F00Du32.to_le_bytes()); // version word
        let mut contribs = Vec::new();
        for _ in 0..2 {
            let mut contrib = vec![0x5Au8; SECTION_CONTRIB_SIZE];
            contrib[SECTION_CONTRIB_PAD1_OFFSET..SECTION_CONTRIB_PAD1_OFFSET + 2]
                .copy_from_slice(&0xCCCCu16.to_le_bytes());
            contrib[SECTION_CONTRIB_PAD2_OFFSET..SECTION_CONTRIB_PAD2_OFFSET + 2]
                .copy_from_slice(&0xCCCCu16.to_le_bytes());
            contribs.extend_from_slice(&contrib);
        }
        bytes[0x1C..0x20].copy_from_slice(&(contribs.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&contribs);
        bytes
    }

    fn sample_pdb() -> PdbFile {
        // Record: u16 size, u16 type, payload "foo\0" + 2 junk bytes.
        let mut symbols = Vec::new();
        symbols.extend_from_slice(&14u16.to_le_bytes());
        symbols.extend_from_slice(&0x110Eu16.to_le_bytes());
        symbols.extend_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        symbols.extend_from_slice(b"foo\0");
        symbols.extend_from_slice(&[0xEE, 0xFF]);

        let mut public = vec![0x77u8; 32];
        public[24..28].copy_from_slice(&0xAAAA_AAAAu32.to_le_bytes());

        PdbFile::with_streams(
            512,
            vec![
                Some(vec![0xDDu8; 40]),                        // old directory
                Some(header_stream(0xDEAD_BEEF, 5, [0x11; 16])), // header info
                Some(vec![0x22u8; 16]),                        // passthrough
                Some(dbi_stream(5)),                           // DBI
                None,
                Some(public), // public symbol info
                Some(symbols), // symbol records
            ],
        )
    }

    #[test]
    fn normalize_rewrites_header_and_empties_old_directory() {
        let mut pdb = sample_pdb();
        PdbRewriter::new().normalize(&mut pdb, [0xAB; 16]).unwrap();

        assert_eq!(pdb.stream(PDB_OLD_DIRECTORY_STREAM), Some(&[][..]));

        let header = PdbInfoHeader70::parse(pdb.stream(PDB_HEADER_INFO_STREAM).unwrap()).unwrap();
        assert_eq!(header.version, 20000404);
        assert_eq!(header.timestamp, CANONICAL_TIMESTAMP);
        assert_eq!(header.age, CANONICAL_AGE);
        assert_eq!(header.signature, [0xAB; 16]);
    }

    #[test]
    fn normalize_scrubs_dbi_fields_and_nothing_else() {
        let mut pdb = sample_pdb();
        let before = pdb.stream(PDB_DBI_STREAM).unwrap().to_vec();
        PdbRewriter::new().normalize(&mut pdb, [0xAB; 16]).unwrap();
        let after = pdb.stream(PDB_DBI_STREAM).unwrap();

        let header = DbiHeader::parse(after).unwrap();
        assert_eq!(header.age, CANONICAL_AGE);

        // Module info offsets field is zeroed.
        let offsets_at = DBI_HEADER_SIZE + MODULE_INFO_OFFSETS_OFFSET;
        assert_eq!(&after[offsets_at..offsets_at + 4], &[0, 0, 0, 0]);

        // Both contribs lose their pads, and only their pads.
        let contrib_base = DBI_HEADER_SIZE + header.mod_info_size as usize + 4;
        for record in 0..2 {
            let base = contrib_base + record * SECTION_CONTRIB_SIZE;
            assert_eq!(&after[base + SECTION_CONTRIB_PAD1_OFFSET..base + SECTION_CONTRIB_PAD1_OFFSET + 2], &[0, 0]);
            assert_eq!(&after[base + SECTION_CONTRIB_PAD2_OFFSET..base + SECTION_CONTRIB_PAD2_OFFSET + 2], &[0, 0]);
            // The rest of the record is untouched.
            assert_eq!(after[base], before[base]);
            assert_eq!(after[base + 4], before[base + 4]);
        }

        // Strings pass through unchanged.
        let strings_at = DBI_HEADER_SIZE + MODULE_INFO_BASE_SIZE;
        assert_eq!(&after[strings_at..strings_at + 12], b"a.obj\0a.lib\0");
    }

    #[test]
    fn normalize_zeroes_symbol_record_tail() {
        let mut pdb = sample_pdb();
        PdbRewriter::new().normalize(&mut pdb, [0xAB; 16]).unwrap();

        let symbols = pdb.stream(6).unwrap();
        // Payload prefix intact, name intact, junk tail zeroed.
        assert_eq!(&symbols[4..10], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(&symbols[10..16], b"foo\0\0\0");
    }

    #[test]
    fn normalize_zeroes_public_symbol_hole() {
        let mut pdb = sample_pdb();
        PdbRewriter::new().normalize(&mut pdb, [0xAB; 16]).unwrap();

        let public = pdb.stream(5).unwrap();
        assert_eq!(&public[24..28], &[0, 0, 0, 0]);
        assert_eq!(public[23], 0x77);
        assert_eq!(public[28], 0x77);
    }

    #[test]
    fn type_only_symbol_records_pass_through() {
        let mut symbols = Vec::new();
        symbols.extend_from_slice(&2u16.to_le_bytes());
        symbols.extend_from_slice(&0x0006u16.to_le_bytes());
        let mut pdb = sample_pdb();
        pdb.replace_stream(6, Some(symbols.clone()));

        PdbRewriter::new().normalize(&mut pdb, [0xAB; 16]).unwrap();
        assert_eq!(pdb.stream(6), Some(&symbols[..]));
    }

    #[test]
    fn malformed_symbol_framing_is_fatal() {
        let mut pdb = sample_pdb();
        pdb.replace_stream(6, Some(vec![0x03, 0x00, 0x01])); // size 3: bad alignment
        let err = PdbRewriter::new().normalize(&mut pdb, [0; 16]).unwrap_err();
        assert!(matches!(err, CanonError::PdbStructure(_)));
    }

    #[test]
    fn short_dbi_stream_is_fatal() {
        let mut pdb = sample_pdb();
        let truncated = pdb.stream(PDB_DBI_STREAM).unwrap()[..70].to_vec();
        pdb.replace_stream(PDB_DBI_STREAM, Some(truncated));
        let err = PdbRewriter::new().normalize(&mut pdb, [0; 16]).unwrap_err();
        assert!(matches!(err, CanonError::PdbStructure(_)));
    }
}
