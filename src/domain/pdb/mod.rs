//! PDB (program database) domain types: the MSF container and the fixed
//! stream layouts the rewriter needs.

pub mod dbi;
pub mod msf;

pub use dbi::{DbiHeader, PdbInfoHeader70};
pub use msf::{PdbFile, PDB_DBI_STREAM, PDB_HEADER_INFO_STREAM, PDB_OLD_DIRECTORY_STREAM};
