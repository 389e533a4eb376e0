//! Fixed replacement values written into canonicalized files.

/// Replacement for every TimeDateStamp field: Jan 1, 2010 00:00:00 UTC.
///
/// The timestamp cannot be zero because zero is a reserved value in PE
/// data directory entries, and a very old date makes Windows warn about
/// known-incompatible images. A fixed date in the recent past avoids both.
pub const CANONICAL_TIMESTAMP: u32 = 0x4B3D_8200;

/// Replacement PDB age. Written to the PE CodeView record, the PDB header
/// and the DBI header, which must all agree.
pub const CANONICAL_AGE: u32 = 1;
