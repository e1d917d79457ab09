//! Rotary position embedding.
//!
//! Tables are `[positions, head_dim / 2]` cosines and sines. NeoX layout
//! rotates element `i` with `i + head_dim / 2`; GPT-J (interleaved) layout
//! rotates `2i` with `2i + 1`.

use tracing::debug;

/// Head geometry of a RoPE call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RopeConfig {
    /// Query heads.
    pub num_heads: usize,
    /// Key heads.
    pub num_kv_heads: usize,
    /// Elements per head; must be even.
    pub head_dim: usize,
    /// GPT-J pairs instead of NeoX halves.
    pub interleaved: bool,
}

impl RopeConfig {
    /// NeoX-layout config.
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_dim,
            interleaved: false,
        }
    }

    /// Same config with GPT-J interleaving switched on or off.
    pub fn with_interleaved(mut self, interleaved: bool) -> Self {
        self.interleaved = interleaved;
        self
    }
}

/// Rotate `q` and `k` in place.
pub(crate) fn apply(q: &mut [f32], k: &mut [f32], positions: &[usize], cos: &[f32], sin: &[f32], config: &RopeConfig) {
    let RopeConfig {
        num_heads,
        num_kv_heads,
        head_dim,
        interleaved,
    } = *config;
    let tokens = positions.len();
    let half = head_dim / 2;
    if head_dim == 0 || head_dim % 2 != 0 {
        debug!(head_dim, "rope: head_dim must be even and non-zero");
        return;
    }
    if q.len() != tokens * num_heads * head_dim || k.len() != tokens * num_kv_heads * head_dim {
        debug!(q = q.len(), k = k.len(), tokens, "rope: q/k do not match the head geometry");
        return;
    }
    let table_rows = cos.len().min(sin.len()) / half;
    if let Some(&pos) = positions.iter().find(|&&p| p >= table_rows) {
        debug!(pos, table_rows, "rope: position beyond table");
        return;
    }

    let q_token = num_heads * head_dim;
    let k_token = num_kv_heads * head_dim;
    for (t, &pos) in positions.iter().enumerate() {
        let c = &cos[pos * half..(pos + 1) * half];
        let s = &sin[pos * half..(pos + 1) * half];
        for head in q[t * q_token..(t + 1) * q_token].chunks_exact_mut(head_dim) {
            rotate(head, c, s, interleaved);
        }
        for head in k[t * k_token..(t + 1) * k_token].chunks_exact_mut(head_dim) {
            rotate(head, c, s, interleaved);
        }
    }
}

fn rotate(x: &mut [f32], cos: &[f32], sin: &[f32], interleaved: bool) {
    let half = cos.len();
    if interleaved {
        for (pair, (&c, &s)) in x.chunks_exact_mut(2).zip(cos.iter().zip(sin)) {
            let (a, b) = (pair[0], pair[1]);
            pair[0] = a * c - b * s;
            pair[1] = a * s + b * c;
        }
    } else {
        let (lo, hi) = x.split_at_mut(half);
        for ((a, b), (&c, &s)) in lo.iter_mut().zip(hi.iter_mut()).zip(cos.iter().zip(sin)) {
            let (x0, x1) = (*a, *b);
            *a = x0 * c - x1 * s;
            *b = x1 * c + x0 * s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(half: usize, positions: usize) -> (Vec<f32>, Vec<f32>) {
        let mut cos = Vec::new();
        let mut sin = Vec::new();
        for p in 0..positions {
            for i in 0..half {
                let angle = p as f32 / 10000f32.powf(2.0 * i as f32 / (2 * half) as f32);
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }
        (cos, sin)
    }

    #[test]
    fn position_zero_is_identity() {
        let (cos, sin) = tables(2, 4);
        let mut q = vec![1.0, 2.0, 3.0, 4.0];
        let mut k = q.clone();
        apply(&mut q, &mut k, &[0], &cos, &sin, &RopeConfig::new(1, 1, 4));
        assert_eq!(q, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(k, q);
    }

    #[test]
    fn rotation_preserves_norm() {
        let (cos, sin) = tables(4, 16);
        for interleaved in [false, true] {
            let config = RopeConfig::new(2, 1, 8).with_interleaved(interleaved);
            let mut q: Vec<f32> = (0..16).map(|i| i as f32 * 0.1 - 0.7).collect();
            let mut k: Vec<f32> = (0..8).map(|i| i as f32 * 0.2).collect();
            let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
            let (nq, nk) = (norm(&q[..8]), norm(&k));
            apply(&mut q, &mut k, &[9], &cos, &sin, &config);
            assert!((norm(&q[..8]) - nq).abs() < 1e-5);
            assert!((norm(&k) - nk).abs() < 1e-5);
        }
    }

    #[test]
    fn neox_and_gptj_pair_differently() {
        let cos = vec![0.0, 1.0];
        let sin = vec![1.0, 0.0];
        let config = RopeConfig::new(1, 1, 4);
        let mut q = vec![1.0, 2.0, 3.0, 4.0];
        let mut k = vec![0.0; 4];
        apply(&mut q, &mut k, &[0], &cos, &sin, &config);
        // pair (x0, x2) rotated by 90 degrees, (x1, x3) untouched
        assert_eq!(q, vec![-3.0, 2.0, 1.0, 4.0]);

        let mut q = vec![1.0, 2.0, 3.0, 4.0];
        apply(&mut q, &mut k, &[0], &cos, &sin, &config.with_interleaved(true));
        assert_eq!(q, vec![-2.0, 1.0, 3.0, 4.0]);
    }

    #[test]
    fn out_of_table_position_is_noop() {
        let (cos, sin) = tables(2, 2);
        let mut q = vec![1.0; 4];
        let mut k = vec![1.0; 4];
        apply(&mut q, &mut k, &[5], &cos, &sin, &RopeConfig::new(1, 1, 4));
        assert_eq!(q, vec![1.0; 4]);
    }
}
