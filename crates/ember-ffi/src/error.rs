//! Error types for FFI operations.

use thiserror::Error;

/// Result type for FFI operations.
pub type Result<T> = std::result::Result<T, FfiError>;

/// Errors from FFI operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FfiError {
    /// Invalid argument (buffer too short, dimension overflows a C int).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The vendor library is not linked into this build.
    #[error("feature not available: {0}")]
    NotAvailable(String),

    /// The vendor routine produced an unusable result.
    #[error("BLAS error: {0}")]
    BlasError(String),
}
