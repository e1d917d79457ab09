//! Error types for Ember Core.

use crate::tensor::DType;
use thiserror::Error;

/// Result type alias for Ember operations.
pub type Result<T> = std::result::Result<T, EmberError>;

/// Errors that can occur in Ember operations.
#[derive(Error, Debug)]
pub enum EmberError {
    /// Allocation of weights, caches or scratch buffers failed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Dimension count outside `[1, 8]`, zero-sized extent, or non-contiguous reshape.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Shapes of two operands disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Element type differs from the one required.
    #[error("dtype mismatch: expected {expected:?}, got {actual:?}")]
    DTypeMismatch {
        /// Element type the operation needs.
        expected: DType,
        /// Element type it was given.
        actual: DType,
    },

    /// Element type exists but cannot be executed (int8, int4).
    #[error("unsupported dtype: {0:?}")]
    UnsupportedDType(DType),

    /// KV cache would overflow its preallocated capacity.
    #[error("kv cache capacity exceeded: {needed} positions needed, capacity is {capacity}")]
    CapacityExceeded {
        /// Live length after the rejected append.
        needed: usize,
        /// Preallocated capacity.
        capacity: usize,
    },

    /// Malformed or incomplete model configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Model loading error.
    #[error("model error: {0}")]
    ModelError(String),

    /// Backend registry error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Vendor library error.
    #[error("ffi error: {0}")]
    Ffi(#[from] ember_ffi::FfiError),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Allocate `len` copies of `value`, reporting failure instead of aborting.
pub(crate) fn try_alloc<T: Clone>(len: usize, value: T, what: &str) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| {
        EmberError::OutOfMemory(format!(
            "{}: {} elements of {} bytes",
            what,
            len,
            std::mem::size_of::<T>()
        ))
    })?;
    buf.resize(len, value);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_alloc_fills() {
        let buf = try_alloc(4, 1.5f32, "test").unwrap();
        assert_eq!(buf, vec![1.5; 4]);
    }

    #[test]
    fn try_alloc_reports_oom() {
        let err = try_alloc(usize::MAX / 2, 0u64, "huge").unwrap_err();
        assert!(matches!(err, EmberError::OutOfMemory(_)));
    }

    #[test]
    fn dtype_mismatch_message() {
        let err = EmberError::DTypeMismatch {
            expected: DType::F32,
            actual: DType::F16,
        };
        assert_eq!(err.to_string(), "dtype mismatch: expected F32, got F16");
    }
}
