//! Error types for PE/PDB canonicalization.
//! Error handling types and result definitions shared by all layers.

use thiserror::Error;

/// Result type for canonicalization operations
pub type CanonResult<T> = Result<T, CanonError>;

/// Fatal error kinds for canonicalization operations
#[derive(Error, Debug, miette::Diagnostic)]
pub enum CanonError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("PE structure error: {0}")]
    PeStructure(String),

    #[error("PDB structure error: {0}")]
    PdbStructure(String),

    #[error("patch conflict: {0}")]
    PatchConflict(String),

    #[error("policy error: {0}")]
    Policy(String),
}

impl From<std::io::Error> for CanonError {
    fn from(error: std::io::Error) -> Self {
        CanonError::Io(error.to_string())
    }
}

impl From<goblin::error::Error> for CanonError {
    fn from(error: goblin::error::Error) -> Self {
        CanonError::PeStructure(error.to_string())
    }
}

impl From<scroll::Error> for CanonError {
    fn from(error: scroll::Error) -> Self {
        CanonError::PdbStructure(error.to_string())
    }
}
