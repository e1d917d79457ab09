//! Attention head geometry.

/// Configuration for attention computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionConfig {
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of KV heads (for GQA).
    pub num_kv_heads: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Score scale (1/sqrt(head_dim) by default).
    pub scale: f32,
    /// Sliding window size (None for full causal attention).
    pub sliding_window: Option<usize>,
}

impl AttentionConfig {
    /// Create a new attention config.
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f32).sqrt(),
            sliding_window: None,
        }
    }

    /// Set sliding window size.
    pub fn with_sliding_window(mut self, window: usize) -> Self {
        self.sliding_window = Some(window);
        self
    }

    /// Number of query heads per KV head (for GQA).
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads.max(1)
    }

    /// KV head serving query head `head`.
    pub fn kv_head(&self, head: usize) -> usize {
        head / self.num_queries_per_kv().max(1)
    }

    /// First cache position a query at `pos` attends to.
    pub fn window_start(&self, pos: usize) -> usize {
        match self.sliding_window {
            Some(window) if window > 0 => (pos + 1).saturating_sub(window),
            _ => 0,
        }
    }

    /// Whether the head counts describe a usable layout.
    pub fn is_valid(&self) -> bool {
        self.num_heads > 0
            && self.num_kv_heads > 0
            && self.head_dim > 0
            && self.num_heads % self.num_kv_heads == 0
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self::new(8, 8, 64) // 8 heads, 64 dim
    }
}
