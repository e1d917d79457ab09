//! Model configuration.
//!
//! Reads the HuggingFace `config.json` keys the engine understands. Keys
//! that are absent fall back to the usual HF defaults; unknown keys are
//! ignored.

use crate::attention::AttentionConfig;
use crate::error::{EmberError, Result};
use crate::kernels::{Activation, RopeConfig};
use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_true() -> bool {
    true
}

/// Epsilon used when the config names neither norm epsilon.
pub const DEFAULT_NORM_EPS: f64 = 1e-6;

/// Normalization used by every block of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// RMSNorm with a per-feature weight.
    Rms,
    /// LayerNorm with optional weight and bias.
    Layer,
}

/// `eos_token_id` as HF configs write it: one id or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EosTokens {
    /// A single end-of-sequence id.
    Single(u32),
    /// Several ids, any of which ends generation.
    Multiple(Vec<u32>),
}

impl EosTokens {
    /// The ids as a slice.
    pub fn ids(&self) -> &[u32] {
        match self {
            EosTokens::Single(id) => std::slice::from_ref(id),
            EosTokens::Multiple(ids) => ids,
        }
    }
}

/// Configuration for a transformer model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads; equal to the attention heads when absent.
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// Per-head dimension; `hidden_size / num_attention_heads` when absent.
    #[serde(default)]
    pub head_dim: Option<usize>,
    /// RoPE base frequency.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// RMSNorm epsilon. Its presence selects RMSNorm.
    #[serde(default)]
    pub rms_norm_eps: Option<f64>,
    /// LayerNorm epsilon. Selects LayerNorm when `rms_norm_eps` is absent.
    #[serde(default)]
    pub layer_norm_eps: Option<f64>,
    /// Feed-forward activation.
    #[serde(default)]
    pub hidden_act: Activation,
    /// Whether the q/k/v projections carry biases.
    #[serde(default)]
    pub attention_bias: bool,
    /// Whether the feed-forward projections carry biases.
    #[serde(default)]
    pub mlp_bias: bool,
    /// Beginning-of-sequence id.
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    /// End-of-sequence id(s).
    #[serde(default)]
    pub eos_token_id: Option<EosTokens>,
    /// Whether the output projection reuses the embedding table.
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    /// Rotate interleaved pairs (GPT-J) instead of halves (NeoX).
    #[serde(default)]
    pub rope_interleaved: bool,
    /// Attention span in positions, if limited.
    #[serde(default)]
    pub sliding_window: Option<usize>,
    /// Qwen2-style switch for `sliding_window`.
    #[serde(default)]
    pub use_sliding_window: Option<bool>,
    /// Element type the checkpoint was saved in. Informational.
    #[serde(default)]
    pub torch_dtype: Option<String>,
    /// Model architecture type.
    #[serde(default)]
    pub model_type: String,
}

impl ModelConfig {
    /// Parse and validate a config from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EmberError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
            .map_err(|e| EmberError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject configs no model can be built from.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("max_position_embeddings", self.max_position_embeddings),
            ("num_key_value_heads", self.num_kv_heads()),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(EmberError::Config(format!("{} must be non-zero", name)));
        }
        if self.num_attention_heads % self.num_kv_heads() != 0 {
            return Err(EmberError::Config(format!(
                "{} attention heads cannot be grouped over {} kv heads",
                self.num_attention_heads,
                self.num_kv_heads()
            )));
        }
        let head_dim = self.head_dim();
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(EmberError::Config(format!(
                "head_dim {} must be even and non-zero",
                head_dim
            )));
        }
        if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return Err(EmberError::Config(format!(
                "hidden_size {} is not a multiple of {} heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.rope_theta.is_nan() || self.rope_theta <= 0.0 {
            return Err(EmberError::Config(format!(
                "rope_theta must be positive, got {}",
                self.rope_theta
            )));
        }
        Ok(())
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        match self.head_dim {
            Some(d) => d,
            None if self.num_attention_heads > 0 => self.hidden_size / self.num_attention_heads,
            None => 0,
        }
    }

    /// Number of key/value heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Query heads per KV head.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads().max(1)
    }

    /// Normalization kind and its epsilon.
    pub fn norm(&self) -> (NormKind, f32) {
        match (self.rms_norm_eps, self.layer_norm_eps) {
            (Some(eps), _) => (NormKind::Rms, eps as f32),
            (None, Some(eps)) => (NormKind::Layer, eps as f32),
            (None, None) => (NormKind::Rms, DEFAULT_NORM_EPS as f32),
        }
    }

    /// Attention window, honouring `use_sliding_window: false`.
    pub fn effective_sliding_window(&self) -> Option<usize> {
        match self.use_sliding_window {
            Some(false) => None,
            _ => self.sliding_window.filter(|&w| w > 0),
        }
    }

    /// Geometry handed to the attention kernel.
    pub fn attention_config(&self) -> AttentionConfig {
        let config = AttentionConfig::new(self.num_attention_heads, self.num_kv_heads(), self.head_dim());
        match self.effective_sliding_window() {
            Some(window) => config.with_sliding_window(window),
            None => config,
        }
    }

    /// Geometry handed to the rotary kernel.
    pub fn rope_config(&self) -> RopeConfig {
        RopeConfig::new(self.num_attention_heads, self.num_kv_heads(), self.head_dim())
            .with_interleaved(self.rope_interleaved)
    }

    /// End-of-sequence ids; empty when the config names none.
    pub fn eos_token_ids(&self) -> &[u32] {
        self.eos_token_id.as_ref().map_or(&[], EosTokens::ids)
    }

    /// `torch_dtype` as an element type, when recognized.
    pub fn checkpoint_dtype(&self) -> Option<DType> {
        self.torch_dtype.as_deref().and_then(DType::from_torch_name)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Llama-3-8B-like defaults
        Self {
            vocab_size: 128256,
            hidden_size: 4096,
            intermediate_size: 14336,
            num_attention_heads: 32,
            num_key_value_heads: Some(8),
            num_hidden_layers: 32,
            max_position_embeddings: 8192,
            head_dim: Some(128),
            rope_theta: 500000.0,
            rms_norm_eps: Some(1e-5),
            layer_norm_eps: None,
            hidden_act: Activation::Silu,
            attention_bias: false,
            mlp_bias: false,
            bos_token_id: Some(128000),
            eos_token_id: Some(EosTokens::Multiple(vec![128001, 128009])),
            tie_word_embeddings: false,
            rope_interleaved: false,
            sliding_window: None,
            use_sliding_window: None,
            torch_dtype: Some("bfloat16".to_string()),
            model_type: "llama".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "vocab_size": 16,
        "hidden_size": 8,
        "intermediate_size": 12,
        "num_attention_heads": 2,
        "num_hidden_layers": 1,
        "max_position_embeddings": 32
    }"#;

    #[test]
    fn absent_keys_take_defaults() {
        let config = ModelConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.num_kv_heads(), 2);
        assert_eq!(config.head_dim(), 4);
        assert_eq!(config.rope_theta, 10000.0);
        assert_eq!(config.norm(), (NormKind::Rms, 1e-6));
        assert_eq!(config.hidden_act, Activation::Silu);
        assert!(config.tie_word_embeddings);
        assert!(config.eos_token_ids().is_empty());
        assert_eq!(config.attention_config().sliding_window, None);
    }

    #[test]
    fn qwen_style_config() {
        let json = r#"{
            "vocab_size": 151936,
            "hidden_size": 1024,
            "intermediate_size": 3072,
            "num_attention_heads": 16,
            "num_key_value_heads": 8,
            "num_hidden_layers": 28,
            "max_position_embeddings": 40960,
            "head_dim": 128,
            "rope_theta": 1000000,
            "rms_norm_eps": 1e-06,
            "hidden_act": "silu",
            "attention_bias": false,
            "bos_token_id": 151643,
            "eos_token_id": 151645,
            "sliding_window": 4096,
            "use_sliding_window": false,
            "tie_word_embeddings": true,
            "torch_dtype": "bfloat16",
            "model_type": "qwen3"
        }"#;
        let config = ModelConfig::from_json(json).unwrap();
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.gqa_ratio(), 2);
        assert_eq!(config.eos_token_ids(), &[151645]);
        assert_eq!(config.effective_sliding_window(), None);
        assert_eq!(config.checkpoint_dtype(), Some(DType::BF16));
    }

    #[test]
    fn eos_list_and_layer_norm() {
        let json = r#"{
            "vocab_size": 50257,
            "hidden_size": 768,
            "intermediate_size": 3072,
            "num_attention_heads": 12,
            "num_hidden_layers": 12,
            "max_position_embeddings": 1024,
            "layer_norm_eps": 1e-5,
            "hidden_act": "gelu_new",
            "eos_token_id": [50256, 50257],
            "rope_interleaved": true
        }"#;
        let config = ModelConfig::from_json(json).unwrap();
        assert_eq!(config.norm(), (NormKind::Layer, 1e-5));
        assert_eq!(config.hidden_act, Activation::GeluTanh);
        assert_eq!(config.eos_token_ids(), &[50256, 50257]);
        assert!(config.rope_config().interleaved);
    }

    #[test]
    fn unknown_activation_is_kept() {
        let json = MINIMAL.replace("\"vocab_size\"", "\"hidden_act\": \"swish_v9\", \"vocab_size\"");
        let config = ModelConfig::from_json(&json).unwrap();
        assert_eq!(config.hidden_act, Activation::Unknown);
        assert_eq!(config.hidden_act.resolved(), Activation::Silu);
    }

    #[test]
    fn rejects_bad_geometry() {
        let json = MINIMAL.replace("\"num_attention_heads\": 2", "\"num_attention_heads\": 3");
        assert!(matches!(ModelConfig::from_json(&json), Err(EmberError::Config(_))));

        let json = MINIMAL.replace("\"max_position_embeddings\": 32", "\"max_position_embeddings\": 0");
        assert!(matches!(ModelConfig::from_json(&json), Err(EmberError::Config(_))));

        let json = MINIMAL.replace("\"vocab_size\"", "\"num_key_value_heads\": 3, \"vocab_size\"");
        assert!(matches!(ModelConfig::from_json(&json), Err(EmberError::Config(_))));

        let json = MINIMAL.replace("\"vocab_size\"", "\"head_dim\": 5, \"vocab_size\"");
        assert!(matches!(ModelConfig::from_json(&json), Err(EmberError::Config(_))));
    }

    #[test]
    fn missing_required_key() {
        let json = MINIMAL.replace("\"hidden_size\": 8,", "");
        assert!(matches!(ModelConfig::from_json(&json), Err(EmberError::Config(_))));
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = ModelConfig::from_file(&path).unwrap();
        assert_eq!(config.vocab_size, 16);
        assert!(ModelConfig::from_file(&dir.path().join("missing.json")).is_err());
    }
}
