//! # Ember FFI
//!
//! Vendor BLAS bindings for the Ember inference engine.
//!
//! This crate provides safe Rust wrappers around:
//! - Apple Accelerate `cblas_sgemm` / `cblas_sgemv`
//! - `vDSP` reductions and `vvexpf` for vectorized softmax
//!
//! The bindings are compiled only with the `accelerate` feature on macOS.
//! On every other build the wrappers still exist but return
//! [`FfiError::NotAvailable`].

#![warn(missing_docs)]

pub mod accelerate;
pub mod error;

pub use accelerate::Transpose;
pub use error::{FfiError, Result};

/// Check if the Accelerate framework is linked into this build.
pub fn accelerate_available() -> bool {
    accelerate::is_available()
}
