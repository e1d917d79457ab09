//! Model loading and inference.
//!
//! Provides the pieces of a decoder-only transformer:
//! - Model configuration (`config.json`)
//! - Weight loading (safetensors)
//! - Layers, rotary tables and KV caches
//! - Forward pass and generation loop
//! - Golden-token regression harness

mod config;
mod golden;
mod kv_cache;
mod layer;
mod linear;
mod loader;
mod mlp;
mod norm;
mod rope;
mod transformer;

pub use config::{EosTokens, ModelConfig, NormKind, DEFAULT_NORM_EPS};
pub use golden::{first_divergence, GoldenCase, GoldenHarness, GoldenOutcome, GoldenResult, GoldenSummary};
pub use kv_cache::{KvCache, LayerCache};
pub use layer::{Attention, TransformerLayer};
pub use linear::Linear;
pub use loader::WeightLoader;
pub use mlp::Mlp;
pub use norm::Norm;
pub use rope::RotaryEmbedding;
pub use transformer::{LoadOptions, Transformer};
