//! PE/PDB canonicalization library.
//!
//! Rewrites a Windows PE image and its matching PDB so that two
//! identical builds produce byte-for-byte identical files. Linker
//! timestamps become a fixed constant, the PDB signature becomes an MD5
//! of the image contents (excluding the rewritten fields), tail padding
//! the linker leaves uninitialized is zeroed, and the PE checksum is
//! recomputed over the result.
//!
//! The pipeline: decompose the PE headers, collect every edit in a
//! [`domain::patch::PatchAddressSpace`], derive the signature, rewrite
//! the PDB streams, then stamp the patch onto the image.

pub mod domain;
pub mod infra;
pub mod pipelines;
pub mod services;

pub use domain::constants::{CANONICAL_AGE, CANONICAL_TIMESTAMP};
pub use domain::patch::{PatchAddressSpace, PatchData, PatchRange};
pub use domain::pdb::PdbFile;
pub use domain::pe::PeImage;
pub use infra::error::{CanonError, CanonResult};
pub use pipelines::canonicalize::{CanonicalizeOptions, CanonicalizeWorkflow};
