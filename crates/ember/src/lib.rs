//! # Ember
//!
//! Embeddable CPU inference engine for decoder-only transformers.
//!
//! Ember loads a Hugging Face style checkpoint (`config.json` plus
//! safetensors), binds the fastest compute backend the host offers and
//! generates token ids from token ids. Tokenization stays with the caller.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ember::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .model_dir("models/qwen3-0.6b")
//!         .max_context(4096)
//!         .build()?;
//!
//!     let request = GenerateRequest::new(vec![151644, 872, 198]).max_tokens(64);
//!     let result = engine.generate(&request)?;
//!     println!("{:?} ({:.1} tok/s)", result.tokens, result.tokens_per_second());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use ember_core::*;

// Re-export FFI crate (for advanced users)
pub use ember_ffi as ffi;

mod engine;

pub use engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult};

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{Engine, EngineBuilder, EngineConfig, GenerateRequest, GenerateResult};
    pub use ember_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
