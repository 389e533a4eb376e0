//! MSF ("multi-stream file") container underlying the PDB format.
//!
//! A PDB is a miniature file system: fixed-size pages, a superblock on
//! page 0, free-page maps on reserved page slots, and a stream directory
//! describing which pages each numbered stream occupies. The reader
//! lifts every stream into a linear byte buffer; the writer lays the
//! whole container out again from scratch so that identical stream
//! contents always produce identical files.

use crate::infra::error::{CanonError, CanonResult};
use scroll::{Pread, Pwrite, LE};
use std::path::Path;

/// Magic bytes of the PDB file format 7.0.
pub const MSF_MAGIC: &[u8; 32] = b"Microsoft C/C++ MSF 7.00\r\n\x1a\x44\x53\x00\x00\x00";

/// Stream index of the previous stream directory.
pub const PDB_OLD_DIRECTORY_STREAM: usize = 0;
/// Stream index of the PDB header info stream.
pub const PDB_HEADER_INFO_STREAM: usize = 1;
/// Stream index of the DBI stream.
pub const PDB_DBI_STREAM: usize = 3;

/// Directory encoding for a stream that is present but has no content.
const NIL_STREAM_SIZE: u32 = u32::MAX;

const SUPERBLOCK_SIZE: usize = 0x38;

/// A PDB lifted into memory: a sparse vector of streams by index.
///
/// `None` marks a nil stream (directory size `0xFFFF_FFFF`); an empty
/// vector is a present stream of zero length. All other streams are the
/// exact bytes the container stores.
#[derive(Debug, Default)]
pub struct PdbFile {
    page_size: u32,
    streams: Vec<Option<Vec<u8>>>,
}

impl PdbFile {
    /// Build a PDB from raw streams. Used by the writer tests and by
    /// fixtures; real files come from [`PdbFile::read`].
    #[must_use]
    pub fn with_streams(page_size: u32, streams: Vec<Option<Vec<u8>>>) -> Self {
        Self { page_size, streams }
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn stream(&self, index: usize) -> Option<&[u8]> {
        self.streams.get(index).and_then(|s| s.as_deref())
    }

    pub fn stream_mut(&mut self, index: usize) -> Option<&mut Vec<u8>> {
        self.streams.get_mut(index).and_then(|s| s.as_mut())
    }

    /// Replace a stream, growing the stream table if needed.
    pub fn replace_stream(&mut self, index: usize, stream: Option<Vec<u8>>) {
        if index >= self.streams.len() {
            self.streams.resize(index + 1, None);
        }
        self.streams[index] = stream;
    }

    /// Read and lift a PDB file from disk.
    pub fn read(path: &Path) -> CanonResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| CanonError::Io(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&bytes)
    }

    /// Parse a PDB from its raw container bytes.
    pub fn parse(bytes: &[u8]) -> CanonResult<Self> {
        if bytes.len() < SUPERBLOCK_SIZE || &bytes[..MSF_MAGIC.len()] != MSF_MAGIC {
            return Err(CanonError::PdbStructure(
                "not a PDB file (missing MSF 7.00 magic)".into(),
            ));
        }

        let page_size: u32 = bytes.pread_with(0x20, LE)?;
        if !matches!(page_size, 512 | 1024 | 2048 | 4096) {
            return Err(CanonError::PdbStructure(format!(
                "invalid MSF page size {page_size}"
            )));
        }
        let directory_size: u32 = bytes.pread_with(0x2C, LE)?;
        let block_map_page: u32 = bytes.pread_with(0x34, LE)?;

        // The block map page lists the pages holding the stream directory.
        let map_offset = block_map_page as usize * page_size as usize;
        if map_offset + page_size as usize > bytes.len() {
            return Err(CanonError::PdbStructure(
                "stream directory block map is out of bounds".into(),
            ));
        }
        let num_directory_pages = pages_needed(directory_size, page_size);
        let mut offset = map_offset;
        let mut directory_pages = Vec::with_capacity(num_directory_pages as usize);
        for _ in 0..num_directory_pages {
            directory_pages.push(bytes.gread_with::<u32>(&mut offset, LE)?);
        }
        let directory = read_pages(bytes, &directory_pages, page_size, directory_size)?;

        // Directory layout: stream count, per-stream sizes, then the
        // concatenated page lists of every non-nil stream.
        let mut offset = 0;
        let num_streams = directory.gread_with::<u32>(&mut offset, LE)?;
        if 4 + u64::from(num_streams) * 4 > u64::from(directory_size) {
            return Err(CanonError::PdbStructure(format!(
                "stream directory of {directory_size} bytes cannot hold {num_streams} streams"
            )));
        }
        let mut sizes = Vec::with_capacity(num_streams as usize);
        for _ in 0..num_streams {
            sizes.push(directory.gread_with::<u32>(&mut offset, LE)?);
        }
        let mut streams = Vec::with_capacity(num_streams as usize);
        for size in sizes {
            if size == NIL_STREAM_SIZE {
                streams.push(None);
                continue;
            }
            let num_pages = pages_needed(size, page_size);
            let mut pages = Vec::with_capacity(num_pages as usize);
            for _ in 0..num_pages {
                pages.push(directory.gread_with::<u32>(&mut offset, LE)?);
            }
            streams.push(Some(read_pages(bytes, &pages, page_size, size)?));
        }

        Ok(Self { page_size, streams })
    }

    /// Serialize the container into canonical form.
    ///
    /// The layout is a pure function of the stream contents: streams in
    /// index order, then the directory, then the directory block map, and
    /// all free-page-map pages zeroed.
    pub fn to_bytes(&self) -> CanonResult<Vec<u8>> {
        let page_size = self.page_size;
        let mut next_page: u32 = 3; // 0 = superblock, 1 and 2 = first free page maps

        let mut stream_pages: Vec<Vec<u32>> = Vec::with_capacity(self.streams.len());
        for stream in &self.streams {
            let len = stream.as_ref().map_or(0, Vec::len) as u32;
            let count = pages_needed(len, page_size);
            let mut pages = Vec::with_capacity(count as usize);
            for _ in 0..count {
                pages.push(alloc_page(&mut next_page, page_size));
            }
            stream_pages.push(pages);
        }

        // Directory: count, sizes, page lists.
        let mut directory = Vec::new();
        directory.extend_from_slice(&(self.streams.len() as u32).to_le_bytes());
        for stream in &self.streams {
            let size = match stream {
                None => NIL_STREAM_SIZE,
                Some(bytes) => bytes.len() as u32,
            };
            directory.extend_from_slice(&size.to_le_bytes());
        }
        for pages in &stream_pages {
            for page in pages {
                directory.extend_from_slice(&page.to_le_bytes());
            }
        }

        let directory_size = directory.len() as u32;
        let num_directory_pages = pages_needed(directory_size, page_size);
        if num_directory_pages * 4 > page_size {
            return Err(CanonError::PdbStructure(format!(
                "stream directory of {directory_size} bytes does not fit a single block map page"
            )));
        }
        let mut directory_pages = Vec::with_capacity(num_directory_pages as usize);
        for _ in 0..num_directory_pages {
            directory_pages.push(alloc_page(&mut next_page, page_size));
        }
        let block_map_page = alloc_page(&mut next_page, page_size);

        let num_pages = next_page;
        let mut out = vec![0u8; num_pages as usize * page_size as usize];

        // Superblock. The free page maps stay zeroed: the canonical file
        // never reuses pages, so nothing is ever freed.
        out[..MSF_MAGIC.len()].copy_from_slice(MSF_MAGIC);
        out.pwrite_with(page_size, 0x20, LE)?;
        out.pwrite_with(1u32, 0x24, LE)?;
        out.pwrite_with(num_pages, 0x28, LE)?;
        out.pwrite_with(directory_size, 0x2C, LE)?;
        out.pwrite_with(0u32, 0x30, LE)?;
        out.pwrite_with(block_map_page, 0x34, LE)?;

        for (stream, pages) in self.streams.iter().zip(&stream_pages) {
            if let Some(bytes) = stream {
                write_pages(&mut out, bytes, pages, page_size);
            }
        }
        write_pages(&mut out, &directory, &directory_pages, page_size);

        let mut offset = block_map_page as usize * page_size as usize;
        for page in &directory_pages {
            out.gwrite_with::<u32>(*page, &mut offset, LE)?;
        }

        Ok(out)
    }

    /// Write the canonical container to `path`.
    pub fn write(&self, path: &Path) -> CanonResult<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)
            .map_err(|e| CanonError::Io(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }
}

fn pages_needed(bytes: u32, page_size: u32) -> u32 {
    bytes.div_ceil(page_size)
}

/// Hand out the next data page, skipping the slots reserved for the free
/// page maps (page index 1 and 2 of every page-size interval).
fn alloc_page(next: &mut u32, page_size: u32) -> u32 {
    while *next % page_size == 1 || *next % page_size == 2 {
        *next += 1;
    }
    let page = *next;
    *next += 1;
    page
}

/// Map a page list to a linear buffer of `size` bytes.
fn read_pages(bytes: &[u8], pages: &[u32], page_size: u32, size: u32) -> CanonResult<Vec<u8>> {
    let mut out = Vec::with_capacity(pages.len() * page_size as usize);
    for page in pages {
        let start = *page as usize * page_size as usize;
        let end = start + page_size as usize;
        if end > bytes.len() {
            return Err(CanonError::PdbStructure(format!(
                "page {page} is out of bounds"
            )));
        }
        out.extend_from_slice(&bytes[start..end]);
    }
    if (size as usize) > out.len() {
        return Err(CanonError::PdbStructure(
            "stream size exceeds its mapped pages".into(),
        ));
    }
    out.truncate(size as usize);
    Ok(out)
}

fn write_pages(out: &mut [u8], bytes: &[u8], pages: &[u32], page_size: u32) {
    let mut cursor = 0usize;
    for page in pages {
        let start = *page as usize * page_size as usize;
        let chunk = (bytes.len() - cursor).min(page_size as usize);
        out[start..start + chunk].copy_from_slice(&bytes[cursor..cursor + chunk]);
        cursor += chunk;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pdb() -> PdbFile {
        PdbFile::with_streams(
            512,
            vec![
                Some(vec![1u8; 10]),
                Some(vec![2u8; 600]), // spans two pages
                None,
                Some(Vec::new()),
                Some((0..255u8).collect()),
            ],
        )
    }

    #[test]
    fn round_trip_preserves_streams() {
        let pdb = sample_pdb();
        let bytes = pdb.to_bytes().unwrap();
        let parsed = PdbFile::parse(&bytes).unwrap();

        assert_eq!(parsed.page_size(), 512);
        assert_eq!(parsed.stream_count(), 5);
        assert_eq!(parsed.stream(0), Some(&[1u8; 10][..]));
        assert_eq!(parsed.stream(1), Some(&[2u8; 600][..]));
        assert_eq!(parsed.stream(2), None);
        assert_eq!(parsed.stream(3), Some(&[][..]));
        assert_eq!(parsed.stream(4).unwrap().len(), 255);
    }

    #[test]
    fn writing_is_deterministic() {
        let pdb = sample_pdb();
        assert_eq!(pdb.to_bytes().unwrap(), pdb.to_bytes().unwrap());

        let reparsed = PdbFile::parse(&pdb.to_bytes().unwrap()).unwrap();
        assert_eq!(pdb.to_bytes().unwrap(), reparsed.to_bytes().unwrap());
    }

    #[test]
    fn data_pages_skip_free_page_map_slots() {
        // With a 512-byte page size the reserved slots recur every 512
        // pages; force enough data to cross the first interval.
        let big = vec![0xABu8; 512 * 600];
        let pdb = PdbFile::with_streams(512, vec![Some(big.clone())]);
        let bytes = pdb.to_bytes().unwrap();
        let parsed = PdbFile::parse(&bytes).unwrap();
        assert_eq!(parsed.stream(0), Some(&big[..]));
    }

    #[test]
    fn replace_stream_grows_table() {
        let mut pdb = PdbFile::with_streams(4096, vec![Some(vec![1])]);
        pdb.replace_stream(4, Some(vec![9, 9]));
        assert_eq!(pdb.stream_count(), 5);
        assert_eq!(pdb.stream(4), Some(&[9u8, 9][..]));
        assert_eq!(pdb.stream(2), None);

        pdb.replace_stream(0, Some(Vec::new()));
        assert_eq!(pdb.stream(0), Some(&[][..]));
    }

    #[test]
    fn rejects_bad_magic() {
        let err = PdbFile::parse(&[0u8; 128]).unwrap_err();
        assert!(matches!(err, CanonError::PdbStructure(_)));
    }
}
