//! Patch address space: an ordered, non-overlapping map from file-offset
//! ranges to replacement bytes.
//!
//! Every edit the scanner wants to make to the image is collected here
//! without being committed. The map is later consumed twice: the GUID
//! hasher skips exactly these ranges, and the file patcher stamps them
//! onto the output file.

use crate::infra::error::{CanonError, CanonResult};
use std::collections::BTreeMap;

/// Byte offset into the PE file on disk (not a virtual address).
pub type FileOffset = u32;

/// Half-open `[start, start + size)` range of file offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRange {
    start: FileOffset,
    size: u32,
}

impl PatchRange {
    /// Create a range. Zero-sized and offset-overflowing ranges are rejected.
    pub fn new(start: FileOffset, size: u32) -> CanonResult<Self> {
        if size == 0 {
            return Err(CanonError::PatchConflict(format!(
                "zero-sized patch range at offset {start:#x}"
            )));
        }
        if start.checked_add(size).is_none() {
            return Err(CanonError::PatchConflict(format!(
                "patch range at offset {start:#x} of size {size} overflows the file offset space"
            )));
        }
        Ok(Self { start, size })
    }

    #[must_use]
    pub fn start(&self) -> FileOffset {
        self.start
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// One past the last offset covered by the range.
    #[must_use]
    pub fn end(&self) -> FileOffset {
        self.start + self.size
    }
}

/// Replacement bytes for a range, or a placeholder to be resolved later.
///
/// A pending entry reserves its range (the GUID hasher must skip it) while
/// the actual bytes are supplied afterwards. The PE checksum entry is the
/// one entry intentionally left pending through patching; the checksum
/// updater fills the field in a post-pass.
#[derive(Debug, Clone)]
pub struct PatchData {
    label: String,
    bytes: Option<Vec<u8>>,
}

impl PatchData {
    pub fn new(label: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            bytes: Some(bytes),
        }
    }

    /// A reserved range whose bytes are supplied later.
    pub fn pending(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            bytes: None,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.bytes.is_none()
    }
}

/// Ordered map of disjoint patch ranges.
#[derive(Debug, Default)]
pub struct PatchAddressSpace {
    entries: BTreeMap<FileOffset, (PatchRange, PatchData)>,
}

impl PatchAddressSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry iff its range is disjoint from all existing ranges.
    /// Adjacency is allowed; any intersection fails and names both labels.
    pub fn insert(&mut self, range: PatchRange, data: PatchData) -> CanonResult<()> {
        if let Some(bytes) = data.bytes() {
            if bytes.len() != range.size() as usize {
                return Err(CanonError::PatchConflict(format!(
                    "replacement data for {} is {} bytes but the range covers {}",
                    data.label(),
                    bytes.len(),
                    range.size()
                )));
            }
        }

        // Predecessor: the last entry starting at or before the new start.
        if let Some((_, (prev, prev_data))) = self.entries.range(..=range.start()).next_back() {
            if prev.end() > range.start() {
                return Err(CanonError::PatchConflict(conflict_message(
                    &range, &data, prev, prev_data,
                )));
            }
        }
        // Successor: the first entry starting after the new start.
        if let Some((_, (next, next_data))) = self
            .entries
            .range(range.start().wrapping_add(1)..)
            .next()
        {
            if next.start() < range.end() {
                return Err(CanonError::PatchConflict(conflict_message(
                    &range, &data, next, next_data,
                )));
            }
        }

        self.entries.insert(range.start(), (range, data));
        Ok(())
    }

    /// Iterate entries in ascending start order.
    pub fn iter(&self) -> impl Iterator<Item = (&PatchRange, &PatchData)> {
        self.entries.values().map(|(range, data)| (range, data))
    }

    /// Resolve a pending entry's bytes after the fact.
    pub fn set_bytes(&mut self, label: &str, bytes: Vec<u8>) -> CanonResult<()> {
        let entry = self
            .entries
            .values_mut()
            .find(|(_, data)| data.label() == label)
            .ok_or_else(|| {
                CanonError::PatchConflict(format!("no patch entry labelled {label}"))
            })?;
        if bytes.len() != entry.0.size() as usize {
            return Err(CanonError::PatchConflict(format!(
                "resolved data for {} is {} bytes but the range covers {}",
                label,
                bytes.len(),
                entry.0.size()
            )));
        }
        entry.1.bytes = Some(bytes);
        Ok(())
    }

    /// Whether any range covers the given offset.
    #[must_use]
    pub fn covers(&self, offset: FileOffset) -> bool {
        self.entries
            .range(..=offset)
            .next_back()
            .is_some_and(|(_, (range, _))| range.end() > offset)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn conflict_message(
    range: &PatchRange,
    data: &PatchData,
    existing: &PatchRange,
    existing_data: &PatchData,
) -> String {
    format!(
        "{} at [{:#x}, {:#x}) overlaps {} at [{:#x}, {:#x})",
        data.label(),
        range.start(),
        range.end(),
        existing_data.label(),
        existing.start(),
        existing.end()
    )
}
