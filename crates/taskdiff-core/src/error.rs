//! Error types for taskdiff.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors shared by the lower-level taskdiff crates.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Device string could not be parsed.
    #[error("Invalid device '{0}': expected cpu, cuda[:N], mps or metal[:N]")]
    InvalidDevice(String),

    /// HuggingFace Hub errors.
    #[error("Hub error: {0}")]
    Hub(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
