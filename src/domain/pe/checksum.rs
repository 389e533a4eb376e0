//! PE checksum computation and update.
//!
//! The OptionalHeader.CheckSum field is a 16-bit folded complement sum
//! over the whole file with the checksum field itself treated as zero,
//! plus the file length.

use crate::infra::error::{CanonError, CanonResult};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Calculate the PE checksum of `data` with the 4-byte field at
/// `checksum_offset` treated as zero.
#[must_use]
pub fn calculate_pe_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u32 = 0;
    let mut offset: usize = 0;
    let len = data.len();

    while offset + 1 < len {
        // The two 16-bit words making up the checksum field count as zero.
        if offset != checksum_offset && offset != checksum_offset + 2 {
            let val = u32::from(u16::from_le_bytes([data[offset], data[offset + 1]]));
            sum = sum.wrapping_add(val);
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        offset += 2;
    }
    // A trailing odd byte counts as a word with a zero high byte.
    if offset < len {
        sum = sum.wrapping_add(u32::from(data[offset]));
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum = (sum & 0xFFFF) + (sum >> 16);
    sum.wrapping_add(len as u32)
}

/// Update the checksum field inside an in-memory PE image.
pub fn update_pe_checksum(data: &mut [u8], checksum_offset: usize) -> CanonResult<()> {
    if checksum_offset + 4 > data.len() {
        return Err(CanonError::PeStructure(
            "checksum offset exceeds file size".to_string(),
        ));
    }
    let new_checksum = calculate_pe_checksum(data, checksum_offset);
    data[checksum_offset..checksum_offset + 4].copy_from_slice(&new_checksum.to_le_bytes());
    Ok(())
}

/// Locate the checksum field of the PE file at `path`, recompute the
/// checksum over the file contents and write it back in place.
pub fn update_file_checksum(path: &Path) -> CanonResult<()> {
    let mut data = std::fs::read(path)?;
    if data.len() < 64 || &data[0..2] != b"MZ" {
        return Err(CanonError::PeStructure(format!(
            "{} is not a PE file",
            path.display()
        )));
    }
    let pe_offset = u32::from_le_bytes([data[60], data[61], data[62], data[63]]) as usize;
    let checksum_offset = pe_offset + 24 + 64;
    update_pe_checksum(&mut data, checksum_offset)?;

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(checksum_offset as u64))?;
    file.write_all(&data[checksum_offset..checksum_offset + 4])?;
    Ok(())
}
