//! Transformer layer implementation.
//!
//! A single transformer decoder layer combining:
//! - Pre-attention norm
//! - Grouped Query Attention over the layer's KV cache
//! - Post-attention norm
//! - Feed-forward block
//!
//! Both sub-blocks add into the residual stream in place.

use super::config::ModelConfig;
use super::kv_cache::LayerCache;
use super::linear::Linear;
use super::loader::WeightLoader;
use super::mlp::Mlp;
use super::norm::Norm;
use super::rope::RotaryEmbedding;
use crate::attention::AttentionConfig;
use crate::backend::Backend;
use crate::error::{try_alloc, EmberError, Result};
use crate::kernels::RopeConfig;

/// Self-attention block.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    /// Per-head RMSNorm on queries (Qwen3).
    q_norm: Option<Norm>,
    /// Per-head RMSNorm on keys (Qwen3).
    k_norm: Option<Norm>,
    config: AttentionConfig,
    rope: RopeConfig,
}

impl Attention {
    /// Assemble from projections.
    pub fn new(
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        o_proj: Linear,
        config: AttentionConfig,
        rope: RopeConfig,
    ) -> Result<Self> {
        let q_width = config.num_heads * config.head_dim;
        let kv_width = config.num_kv_heads * config.head_dim;
        let hidden = q_proj.in_features();
        if !config.is_valid()
            || q_proj.out_features() != q_width
            || k_proj.out_features() != kv_width
            || v_proj.out_features() != kv_width
            || k_proj.in_features() != hidden
            || v_proj.in_features() != hidden
            || o_proj.in_features() != q_width
            || o_proj.out_features() != hidden
        {
            return Err(EmberError::ShapeMismatch(format!(
                "attention projections do not fit {} heads / {} kv heads of {}",
                config.num_heads, config.num_kv_heads, config.head_dim
            )));
        }
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm: None,
            k_norm: None,
            config,
            rope,
        })
    }

    /// Attach per-head query/key norms.
    pub fn with_qk_norm(mut self, q_norm: Option<Norm>, k_norm: Option<Norm>) -> Result<Self> {
        for norm in q_norm.iter().chain(k_norm.iter()) {
            if norm.dim() != self.config.head_dim {
                return Err(EmberError::ShapeMismatch(format!(
                    "qk norm of width {} for head_dim {}",
                    norm.dim(),
                    self.config.head_dim
                )));
            }
        }
        self.q_norm = q_norm;
        self.k_norm = k_norm;
        Ok(self)
    }

    /// Load `<prefix>.{q,k,v,o}_proj` and optional `q_norm`/`k_norm`.
    pub fn load(loader: &mut WeightLoader, prefix: &str, config: &ModelConfig) -> Result<Self> {
        let bias = config.attention_bias;
        let q_proj = Linear::load(loader, &format!("{}.q_proj", prefix), bias)?;
        let k_proj = Linear::load(loader, &format!("{}.k_proj", prefix), bias)?;
        let v_proj = Linear::load(loader, &format!("{}.v_proj", prefix), bias)?;
        let o_proj = Linear::load(loader, &format!("{}.o_proj", prefix), false)?;
        let (kind, eps) = config.norm();
        let q_norm = Norm::load_optional(loader, &format!("{}.q_norm", prefix), kind, eps)?;
        let k_norm = Norm::load_optional(loader, &format!("{}.k_norm", prefix), kind, eps)?;
        Self::new(q_proj, k_proj, v_proj, o_proj, config.attention_config(), config.rope_config())?
            .with_qk_norm(q_norm, k_norm)
    }

    /// Kernel geometry.
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Attend `x` (`[tokens, hidden]`) at `positions`, appending this
    /// chunk's keys and values to `cache` first; write `[tokens, hidden]`
    /// into `out`.
    pub fn forward(
        &self,
        backend: &Backend,
        x: &[f32],
        positions: &[usize],
        rotary: &RotaryEmbedding,
        cache: &mut LayerCache,
        out: &mut [f32],
    ) -> Result<()> {
        let tokens = positions.len();
        let q_len = tokens * self.config.num_heads * self.config.head_dim;
        let kv_len = tokens * self.config.num_kv_heads * self.config.head_dim;

        let mut q = try_alloc(q_len, 0.0f32, "attention q")?;
        let mut k = try_alloc(kv_len, 0.0f32, "attention k")?;
        let mut v = try_alloc(kv_len, 0.0f32, "attention v")?;
        let mut attn = try_alloc(q_len, 0.0f32, "attention output")?;

        self.q_proj.forward(backend, x, &mut q)?;
        self.k_proj.forward(backend, x, &mut k)?;
        self.v_proj.forward(backend, x, &mut v)?;
        if let Some(norm) = &self.q_norm {
            norm.forward_in_place(backend, &mut q)?;
        }
        if let Some(norm) = &self.k_norm {
            norm.forward_in_place(backend, &mut k)?;
        }
        rotary.apply(backend, &mut q, &mut k, positions, &self.rope)?;

        cache.append(backend, &k, &v)?;
        backend.attention(&q, &cache.key(), &cache.value(), &mut attn, positions, &self.config);
        self.o_proj.forward(backend, &attn, out)
    }
}

/// A single transformer decoder layer.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    input_layernorm: Norm,
    attention: Attention,
    post_attention_layernorm: Norm,
    mlp: Mlp,
}

impl TransformerLayer {
    /// Create a new transformer layer.
    pub fn new(
        input_layernorm: Norm,
        attention: Attention,
        post_attention_layernorm: Norm,
        mlp: Mlp,
    ) -> Self {
        Self {
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
        }
    }

    /// Load `model.layers.<layer_idx>.*`.
    pub fn load(loader: &mut WeightLoader, config: &ModelConfig, layer_idx: usize) -> Result<Self> {
        let prefix = format!("model.layers.{}", layer_idx);
        let (kind, eps) = config.norm();
        Ok(Self::new(
            Norm::load(loader, &format!("{}.input_layernorm", prefix), kind, eps)?,
            Attention::load(loader, &format!("{}.self_attn", prefix), config)?,
            Norm::load(loader, &format!("{}.post_attention_layernorm", prefix), kind, eps)?,
            Mlp::load(loader, &format!("{}.mlp", prefix), config.hidden_act, config.mlp_bias)?,
        ))
    }

    /// Run the layer over `hidden` (`[tokens, hidden_size]`) in place.
    ///
    /// On error `hidden` may hold a partly applied layer and `cache` may
    /// already hold this chunk; the caller discards both.
    pub fn forward(
        &self,
        backend: &Backend,
        hidden: &mut [f32],
        positions: &[usize],
        rotary: &RotaryEmbedding,
        cache: &mut LayerCache,
    ) -> Result<()> {
        let mut normed = try_alloc(hidden.len(), 0.0f32, "layer norm output")?;
        let mut delta = try_alloc(hidden.len(), 0.0f32, "layer block output")?;

        self.input_layernorm.forward(backend, hidden, &mut normed)?;
        self.attention
            .forward(backend, &normed, positions, rotary, cache, &mut delta)?;
        add_in_place(hidden, &delta);

        self.post_attention_layernorm.forward(backend, hidden, &mut normed)?;
        self.mlp.forward(backend, &normed, &mut delta)?;
        add_in_place(hidden, &delta);
        Ok(())
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }
}

fn add_in_place(acc: &mut [f32], delta: &[f32]) {
    for (a, d) in acc.iter_mut().zip(delta) {
        *a += d;
    }
}
