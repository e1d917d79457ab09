//! Causal scaled-dot-product attention over a KV cache.
//!
//! Provides three implementations with identical contracts:
//! - [`streaming_attention`] - single pass with an online softmax (running
//!   max and normalizer); the path every CPU backend uses
//! - [`two_pass_attention`] - materializes each score row first; a plain
//!   reference for testing
//! - [`gathered_attention`] - gathers one KV head into contiguous f32 rows
//!   and runs vector-matrix products plus a row softmax; used for f16
//!   caches by the Accelerate backend, falling back to streaming when its
//!   scratch cannot be allocated
//!
//! `q` and `out` are `[tokens, heads, head_dim]`; the caches are
//! `[capacity, kv_heads, head_dim]` and may hold any float type. A query at
//! absolute position `p` reads cache rows `0..=p` only (or the last
//! `sliding_window` of them).

mod config;
mod gathered;
mod streaming;

pub use config::AttentionConfig;
pub use gathered::gathered_attention;
pub use streaming::{streaming_attention, two_pass_attention};

#[cfg(all(target_os = "macos", feature = "accelerate"))]
pub(crate) use gathered::{gathered_with, GatherKernels};
pub(crate) use streaming::streaming_with;

use crate::kernels::is_dense_float;
use crate::tensor::{TensorMeta, TensorView};
use tracing::debug;

/// Checked geometry of one attention call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub(crate) heads: usize,
    pub(crate) kv_heads: usize,
    pub(crate) head_dim: usize,
}

impl Geometry {
    /// Validate one call; `None` (logged) if the arguments do not fit or
    /// there is nothing to compute.
    pub(crate) fn check(
        q: &[f32],
        keys: &TensorView<'_>,
        values: &TensorView<'_>,
        out: &[f32],
        positions: &[usize],
        config: &AttentionConfig,
    ) -> Option<Self> {
        if !config.is_valid() {
            debug!(?config, "attention: invalid head configuration");
            return None;
        }
        let (heads, kv_heads, head_dim) = (config.num_heads, config.num_kv_heads, config.head_dim);
        if !is_dense_float(keys, 3)
            || !keys.same_shape(values)
            || !is_dense_float(values, 3)
            || keys.dims()[1..] != [kv_heads, head_dim]
        {
            debug!(keys = ?keys.dims(), values = ?values.dims(), "attention: caches do not match [capacity, kv_heads, head_dim]");
            return None;
        }
        let tokens = positions.len();
        if tokens == 0 {
            return None;
        }
        let width = tokens * heads * head_dim;
        if q.len() != width || out.len() != width {
            debug!(q = q.len(), out = out.len(), width, "attention: q/out size mismatch");
            return None;
        }
        let capacity = keys.dims()[0];
        if let Some(&pos) = positions.iter().find(|&&p| p >= capacity) {
            debug!(pos, capacity, "attention: position beyond cache");
            return None;
        }
        Some(Self {
            heads,
            kv_heads,
            head_dim,
        })
    }

    /// Storage offset of cache row `pos` for KV head `kv_head`.
    pub(crate) fn cache_offset(&self, pos: usize, kv_head: usize) -> usize {
        (pos * self.kv_heads + kv_head) * self.head_dim
    }

    /// Range of query head `head` of token `t` in `q` and `out`.
    pub(crate) fn head_range(&self, t: usize, head: usize) -> std::ops::Range<usize> {
        let start = (t * self.heads + head) * self.head_dim;
        start..start + self.head_dim
    }
}

/// Cache row at `offset` as f32, borrowed when the cache is f32.
pub(crate) fn cache_row<'s>(
    direct: Option<&'s [f32]>,
    cache: &TensorView<'_>,
    offset: usize,
    buf: &'s mut [f32],
) -> &'s [f32] {
    match direct {
        Some(data) => &data[offset..offset + buf.len()],
        None => {
            cache.read_f32(offset, buf);
            buf
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::kernels::test_util::random_vec;
    use crate::tensor::{DType, Tensor};

    /// Random caches `[capacity, kv_heads, head_dim]` in `dtype`.
    pub(crate) fn caches(dtype: DType, capacity: usize, kv_heads: usize, head_dim: usize, seed: u64) -> (Tensor, Tensor) {
        let len = capacity * kv_heads * head_dim;
        let dims = [capacity, kv_heads, head_dim];
        let keys = Tensor::from_f32_as(dtype, &dims, &random_vec(len, seed)).unwrap();
        let values = Tensor::from_f32_as(dtype, &dims, &random_vec(len, seed + 1)).unwrap();
        (keys, values)
    }
}
