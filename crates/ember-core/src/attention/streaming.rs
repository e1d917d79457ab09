//! Online-softmax attention and its two-pass reference.

use super::{cache_row, AttentionConfig, Geometry};
use crate::error::try_alloc;
use crate::kernels::scalar::PRIMITIVES;
use crate::kernels::Primitives;
use crate::tensor::TensorView;
use tracing::warn;

/// Single-pass causal attention on the portable primitives.
///
/// Keeps a running maximum `m`, normalizer `sum` and weighted accumulator
/// per head: each score `s` rescales the accumulator by `exp(m - m')` and
/// adds its value row with weight `exp(s - m')`, where `m' = max(m, s)`.
/// No score row is ever stored.
pub fn streaming_attention(
    q: &[f32],
    keys: &TensorView<'_>,
    values: &TensorView<'_>,
    out: &mut [f32],
    positions: &[usize],
    config: &AttentionConfig,
) {
    streaming_with(&PRIMITIVES, q, keys, values, out, positions, config);
}

pub(crate) fn streaming_with(
    prims: &Primitives,
    q: &[f32],
    keys: &TensorView<'_>,
    values: &TensorView<'_>,
    out: &mut [f32],
    positions: &[usize],
    config: &AttentionConfig,
) {
    let Some(geo) = Geometry::check(q, keys, values, out, positions, config) else {
        return;
    };
    let d = geo.head_dim;
    let Ok(mut scratch) = try_alloc(3 * d, 0.0f32, "attention scratch") else {
        warn!(head_dim = d, "attention: could not allocate scratch");
        return;
    };
    let (acc, rest) = scratch.split_at_mut(d);
    let (k_buf, v_buf) = rest.split_at_mut(d);
    let (k_direct, v_direct) = (keys.as_f32(), values.as_f32());

    for (t, &pos) in positions.iter().enumerate() {
        for head in 0..geo.heads {
            let kv_head = config.kv_head(head);
            let qh = &q[geo.head_range(t, head)];
            acc.fill(0.0);
            let mut max = f32::NEG_INFINITY;
            let mut sum = 0.0f32;
            for j in config.window_start(pos)..=pos {
                let offset = geo.cache_offset(j, kv_head);
                let k_row = cache_row(k_direct, keys, offset, k_buf);
                let s = (prims.dot)(qh, k_row) * config.scale;
                if s == f32::NEG_INFINITY {
                    continue;
                }
                let new_max = max.max(s);
                let alpha = (max - new_max).exp();
                let weight = (s - new_max).exp();
                if alpha != 1.0 {
                    (prims.scale)(acc, alpha);
                }
                let v_row = cache_row(v_direct, values, offset, v_buf);
                (prims.axpy)(acc, weight, v_row);
                sum = sum * alpha + weight;
                max = new_max;
            }
            write_head(&mut out[geo.head_range(t, head)], acc, sum);
        }
    }
}

fn write_head(out: &mut [f32], acc: &[f32], sum: f32) {
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for (o, &a) in out.iter_mut().zip(acc) {
            *o = a * inv;
        }
    } else {
        out.fill(0.0);
    }
}

/// Causal attention that materializes each score row, softmaxes it, then
/// takes the weighted sum of value rows.
pub fn two_pass_attention(
    q: &[f32],
    keys: &TensorView<'_>,
    values: &TensorView<'_>,
    out: &mut [f32],
    positions: &[usize],
    config: &AttentionConfig,
) {
    let Some(geo) = Geometry::check(q, keys, values, out, positions, config) else {
        return;
    };
    let d = geo.head_dim;
    let longest = positions.iter().map(|&p| p + 1).max().unwrap_or(0);
    let (Ok(mut scores), Ok(mut row), Ok(mut acc)) = (
        try_alloc(longest, 0.0f32, "attention scores"),
        try_alloc(d, 0.0f32, "attention row"),
        try_alloc(d, 0.0f32, "attention accumulator"),
    ) else {
        warn!(longest, "attention: could not allocate score row");
        return;
    };

    for (t, &pos) in positions.iter().enumerate() {
        let start = config.window_start(pos);
        for head in 0..geo.heads {
            let kv_head = config.kv_head(head);
            let qh = &q[geo.head_range(t, head)];
            let scores = &mut scores[..pos + 1 - start];
            for (s, j) in scores.iter_mut().zip(start..=pos) {
                keys.read_f32(geo.cache_offset(j, kv_head), &mut row);
                *s = qh.iter().zip(&row).map(|(a, b)| a * b).sum::<f32>() * config.scale;
            }
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for s in scores.iter_mut() {
                *s = (*s - max).exp();
                sum += *s;
            }
            acc.fill(0.0);
            for (&w, j) in scores.iter().zip(start..=pos) {
                values.read_f32(geo.cache_offset(j, kv_head), &mut row);
                for (a, &v) in acc.iter_mut().zip(&row) {
                    *a += w * v;
                }
            }
            write_head(&mut out[geo.head_range(t, head)], &acc, sum);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::test_support::caches;
    use crate::kernels::test_util::{assert_close, random_vec};
    use crate::tensor::{DType, Tensor};

    #[test]
    fn single_position_returns_value_row() {
        let config = AttentionConfig::new(1, 1, 4);
        let keys = Tensor::from_f32(&[2, 1, 4], vec![1.0, 0.0, 0.0, 0.0, 9.0, 9.0, 9.0, 9.0]).unwrap();
        let values = Tensor::from_f32(&[2, 1, 4], vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let q = [0.5; 4];
        let mut out = [0.0; 4];
        streaming_attention(&q, &keys.view(), &values.view(), &mut out, &[0], &config);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn equal_scores_average_values() {
        let config = AttentionConfig::new(1, 1, 2);
        let keys = Tensor::from_f32(&[3, 1, 2], vec![0.0; 6]).unwrap();
        let values = Tensor::from_f32(&[3, 1, 2], vec![1.0, 0.0, 2.0, 0.0, 3.0, 6.0]).unwrap();
        let mut out = [0.0; 2];
        streaming_attention(&[1.0, 1.0], &keys.view(), &values.view(), &mut out, &[2], &config);
        assert!((out[0] - 2.0).abs() < 1e-6);
        assert!((out[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn streaming_matches_two_pass() {
        for (len, heads, kv_heads, dtype) in [
            (1, 2, 2, DType::F32),
            (7, 4, 2, DType::F32),
            (64, 4, 1, DType::F16),
            (300, 2, 2, DType::BF16),
        ] {
            let d = 16;
            let config = AttentionConfig::new(heads, kv_heads, d);
            let (keys, values) = caches(dtype, len, kv_heads, d, len as u64);
            let positions: Vec<usize> = (0..len).collect();
            let q = random_vec(len * heads * d, 99);
            let mut fast = vec![0.0; q.len()];
            let mut slow = vec![0.0; q.len()];
            streaming_attention(&q, &keys.view(), &values.view(), &mut fast, &positions, &config);
            two_pass_attention(&q, &keys.view(), &values.view(), &mut slow, &positions, &config);
            assert_close(&fast, &slow, 1e-5);
        }
    }

    #[test]
    fn future_rows_are_never_read() {
        let (len, d) = (10, 8);
        let config = AttentionConfig::new(2, 1, d);
        let (keys, values) = caches(DType::F32, len, 1, d, 3);
        let mut dirty_k = keys.to_f32_vec();
        let mut dirty_v = values.to_f32_vec();
        let p = 4;
        for v in dirty_k[(p + 1) * d..].iter_mut().chain(dirty_v[(p + 1) * d..].iter_mut()) {
            *v = 1.0e6;
        }
        let dirty_k = Tensor::from_f32(&[len, 1, d], dirty_k).unwrap();
        let dirty_v = Tensor::from_f32(&[len, 1, d], dirty_v).unwrap();
        let q = random_vec(2 * d, 4);
        let mut clean = vec![0.0; 2 * d];
        let mut dirty = vec![0.0; 2 * d];
        streaming_attention(&q, &keys.view(), &values.view(), &mut clean, &[p], &config);
        streaming_attention(&q, &dirty_k.view(), &dirty_v.view(), &mut dirty, &[p], &config);
        assert_eq!(clean, dirty);
    }

    #[test]
    fn sliding_window_limits_history() {
        let d = 4;
        let config = AttentionConfig::new(1, 1, d).with_sliding_window(2);
        let (keys, values) = caches(DType::F32, 6, 1, d, 8);
        let q = random_vec(d, 9);
        let mut windowed = vec![0.0; d];
        let mut reference = vec![0.0; d];
        streaming_attention(&q, &keys.view(), &values.view(), &mut windowed, &[5], &config);
        two_pass_attention(&q, &keys.view(), &values.view(), &mut reference, &[5], &config);
        assert_close(&windowed, &reference, 1e-6);

        // only rows 4 and 5 matter
        let tail_k = keys.narrow(4, 2).unwrap().to_f32_vec();
        let tail_v = values.narrow(4, 2).unwrap().to_f32_vec();
        let tail_k = Tensor::from_f32(&[2, 1, d], tail_k).unwrap();
        let tail_v = Tensor::from_f32(&[2, 1, d], tail_v).unwrap();
        let mut tail = vec![0.0; d];
        let full = AttentionConfig::new(1, 1, d);
        streaming_attention(&q, &tail_k.view(), &tail_v.view(), &mut tail, &[1], &full);
        assert_close(&windowed, &tail, 1e-6);
    }

    #[test]
    fn position_past_capacity_leaves_output() {
        let config = AttentionConfig::new(1, 1, 2);
        let (keys, values) = caches(DType::F32, 2, 1, 2, 1);
        let mut out = [5.0; 2];
        streaming_attention(&[1.0, 1.0], &keys.view(), &values.view(), &mut out, &[2], &config);
        assert_eq!(out, [5.0; 2]);
    }
}
