//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. This module owns the per-position cosine and sine
//! tables; the rotation itself is a backend op.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::backend::Backend;
use crate::error::{try_alloc, EmberError, Result};
use crate::kernels::RopeConfig;

/// Precomputed rotation tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// `[max_positions, head_dim / 2]` cosines.
    cos: Vec<f32>,
    /// `[max_positions, head_dim / 2]` sines.
    sin: Vec<f32>,
    head_dim: usize,
    max_positions: usize,
}

impl RotaryEmbedding {
    /// Build tables for positions `0..max_positions`.
    ///
    /// Frequency `i` is `theta^(-2i / head_dim)`; angles are computed in
    /// f64 and rounded once.
    pub fn new(head_dim: usize, max_positions: usize, theta: f64) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(EmberError::Config(format!(
                "rotary head_dim {} must be even and non-zero",
                head_dim
            )));
        }
        let half = head_dim / 2;
        let inv_freq: Vec<f64> = (0..half)
            .map(|i| theta.powf(-(2.0 * i as f64) / head_dim as f64))
            .collect();

        let len = max_positions * half;
        let mut cos = try_alloc(len, 0.0f32, "rope cos table")?;
        let mut sin = try_alloc(len, 0.0f32, "rope sin table")?;
        for pos in 0..max_positions {
            let row = pos * half..(pos + 1) * half;
            for ((c, s), &f) in cos[row.clone()].iter_mut().zip(&mut sin[row]).zip(&inv_freq) {
                let (s64, c64) = (pos as f64 * f).sin_cos();
                *c = c64 as f32;
                *s = s64 as f32;
            }
        }

        Ok(Self {
            cos,
            sin,
            head_dim,
            max_positions,
        })
    }

    /// Rotate `q` (`[tokens, heads, head_dim]`) and `k`
    /// (`[tokens, kv_heads, head_dim]`) for `positions`.
    pub fn apply(
        &self,
        backend: &Backend,
        q: &mut [f32],
        k: &mut [f32],
        positions: &[usize],
        config: &RopeConfig,
    ) -> Result<()> {
        if config.head_dim != self.head_dim {
            return Err(EmberError::ShapeMismatch(format!(
                "rope tables built for head_dim {}, called with {}",
                self.head_dim, config.head_dim
            )));
        }
        if let Some(&pos) = positions.iter().max() {
            if pos >= self.max_positions {
                return Err(EmberError::CapacityExceeded {
                    needed: pos + 1,
                    capacity: self.max_positions,
                });
            }
        }
        backend.rope(q, k, positions, &self.cos, &self.sin, config);
        Ok(())
    }

    /// Cosine row for `pos`.
    pub fn cos(&self, pos: usize) -> Option<&[f32]> {
        let half = self.head_dim / 2;
        self.cos.get(pos * half..(pos + 1) * half)
    }

    /// Sine row for `pos`.
    pub fn sin(&self, pos: usize) -> Option<&[f32]> {
        let half = self.head_dim / 2;
        self.sin.get(pos * half..(pos + 1) * half)
    }

    /// Get the maximum sequence length this embedding supports.
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
