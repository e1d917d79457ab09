//! Preallocated KV cache.
//!
//! Each layer owns a key and a value tensor shaped
//! `[capacity, kv_heads, head_dim]` and a live length. Appends write rows
//! `live_len..live_len + tokens` through the backend and advance the live
//! length; nothing is ever reallocated, so kernels may rely on fixed strides.

use crate::backend::Backend;
use crate::error::{EmberError, Result};
use crate::tensor::{DType, Tensor, TensorMeta, TensorView};

/// KV cache for a single layer.
#[derive(Debug, Clone)]
pub struct LayerCache {
    key: Tensor,
    value: Tensor,
    len: usize,
}

impl LayerCache {
    /// Allocate a zeroed cache for `capacity` positions.
    pub fn new(dtype: DType, capacity: usize, kv_heads: usize, head_dim: usize) -> Result<Self> {
        if !dtype.is_executable() {
            return Err(EmberError::UnsupportedDType(dtype));
        }
        let dims = [capacity, kv_heads, head_dim];
        Ok(Self {
            key: Tensor::zeros(dtype, &dims)?,
            value: Tensor::zeros(dtype, &dims)?,
            len: 0,
        })
    }

    /// Live length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Positions the cache can hold.
    pub fn capacity(&self) -> usize {
        self.key.dims()[0]
    }

    /// Elements in one cached position (`kv_heads * head_dim`).
    pub fn row_len(&self) -> usize {
        self.key.dims()[1] * self.key.dims()[2]
    }

    /// Element type of the cached rows.
    pub fn dtype(&self) -> DType {
        self.key.dtype()
    }

    /// Whole key tensor, live or not.
    pub fn key(&self) -> TensorView<'_> {
        self.key.view()
    }

    /// Whole value tensor, live or not.
    pub fn value(&self) -> TensorView<'_> {
        self.value.view()
    }

    /// Append `k` and `v` (`[tokens, kv_heads, head_dim]` each) and return
    /// the new live length. Nothing is written when the rows do not fit.
    pub fn append(&mut self, backend: &Backend, k: &[f32], v: &[f32]) -> Result<usize> {
        let row = self.row_len();
        if k.len() != v.len() || k.len() % row != 0 {
            return Err(EmberError::ShapeMismatch(format!(
                "kv append of {} keys and {} values with rows of {}",
                k.len(),
                v.len(),
                row
            )));
        }
        let needed = self.len + k.len() / row;
        if needed > self.capacity() {
            return Err(EmberError::CapacityExceeded {
                needed,
                capacity: self.capacity(),
            });
        }
        let new_len = backend.kv_append(&mut self.key.view_mut(), &mut self.value.view_mut(), k, v, self.len);
        if new_len != needed {
            return Err(EmberError::Backend(format!(
                "kv append advanced to {} instead of {}",
                new_len, needed
            )));
        }
        self.len = new_len;
        Ok(new_len)
    }

    /// Rewind to `len` positions if currently longer.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Rewind to empty without reallocating.
    pub fn reset(&mut self) {
        self.len = 0;
    }
}

/// Full KV cache for all layers.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerCache>,
}

impl KvCache {
    /// Allocate `num_layers` caches of identical geometry.
    pub fn new(
        num_layers: usize,
        dtype: DType,
        capacity: usize,
        kv_heads: usize,
        head_dim: usize,
    ) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|_| LayerCache::new(dtype, capacity, kv_heads, head_dim))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Cache of one layer, `None` past the last layer.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerCache> {
        self.layers.get(layer_idx)
    }

    /// Mutable iteration in layer order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, LayerCache> {
        self.layers.iter_mut()
    }

    /// Live length (from first layer).
    pub fn len(&self) -> usize {
        self.layers.first().map_or(0, LayerCache::len)
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions each layer can hold.
    pub fn capacity(&self) -> usize {
        self.layers.first().map_or(0, LayerCache::capacity)
    }

    /// Rewind every layer to at most `len` positions.
    pub fn truncate(&mut self, len: usize) {
        for layer in &mut self.layers {
            layer.truncate(len);
        }
    }

    /// Rewind every layer to empty.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
