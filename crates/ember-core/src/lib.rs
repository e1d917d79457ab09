//! # Ember Core
//!
//! CPU inference engine for decoder-only transformers.
//!
//! This crate provides:
//! - **Tensors** over f32/f16/bf16 storage with owned and borrowed forms
//! - **Capability detection** and a registry of compute backends
//! - **Numeric kernels** (GEMM, norms, activations, RoPE, softmax, sampling)
//!   with scalar, NEON, AVX2/AVX-512, AMX and Accelerate implementations
//! - **Streaming attention** with an online softmax over a preallocated KV cache
//! - **Model loading** from safetensors and a Hugging Face `config.json`,
//!   forward pass and generation loop

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod backend;
pub mod capability;
pub mod error;
pub mod kernels;
pub mod model;
pub mod tensor;

mod pool;

pub use error::{EmberError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attention::AttentionConfig;
    pub use crate::backend::{default_backend, set_default_backend, Backend, BackendOps};
    pub use crate::capability::Capability;
    pub use crate::error::{EmberError, Result};
    pub use crate::kernels::{Activation, SamplingParams, Transpose};
    pub use crate::model::{KvCache, LoadOptions, ModelConfig, Transformer, WeightLoader};
    pub use crate::tensor::{DType, Tensor, TensorMeta, TensorView, TensorViewMut};
}
