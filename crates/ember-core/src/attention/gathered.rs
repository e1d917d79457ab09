//! Gather-then-GEMV attention for half-precision caches.

use super::{streaming_with, AttentionConfig, Geometry};
use crate::kernels::scalar::PRIMITIVES;
use crate::kernels::softmax::softmax_row;
use crate::kernels::{Primitives, Transpose};
use crate::tensor::TensorView;
use tracing::{debug, warn};

/// Vector kernels the gathered path runs on.
#[derive(Debug)]
pub(crate) struct GatherKernels {
    /// `y = op(A) · x` for row-major `A` of `rows × cols`; false on failure.
    pub(crate) gemv: fn(Transpose, usize, usize, &[f32], &[f32], &mut [f32]) -> bool,
    /// Softmax of `x * scale` in place; false on failure.
    pub(crate) softmax: fn(&mut [f32], f32) -> bool,
}

pub(crate) static PORTABLE_GATHER: GatherKernels = GatherKernels {
    gemv: portable_gemv,
    softmax: portable_softmax,
};

fn portable_gemv(trans: Transpose, rows: usize, cols: usize, a: &[f32], x: &[f32], y: &mut [f32]) -> bool {
    match trans {
        Transpose::No => {
            for (out, row) in y[..rows].iter_mut().zip(a.chunks_exact(cols)) {
                *out = (PRIMITIVES.dot)(row, x);
            }
        }
        Transpose::Yes => {
            y[..cols].fill(0.0);
            for (&xv, row) in x[..rows].iter().zip(a.chunks_exact(cols)) {
                (PRIMITIVES.axpy)(&mut y[..cols], xv, row);
            }
        }
    }
    true
}

fn portable_softmax(x: &mut [f32], scale: f32) -> bool {
    softmax_row(&PRIMITIVES, x, scale);
    true
}

/// Gathered attention on the portable kernels.
pub fn gathered_attention(
    q: &[f32],
    keys: &TensorView<'_>,
    values: &TensorView<'_>,
    out: &mut [f32],
    positions: &[usize],
    config: &AttentionConfig,
) {
    gathered_with(&PORTABLE_GATHER, &PRIMITIVES, q, keys, values, out, positions, config);
}

/// For each KV head, gather its rows into contiguous f32 `K` and `V`, then
/// per query head: `scores = K · q`, softmax, `out = Vᵀ · scores`. Falls
/// back to the streaming path on `fallback` when scratch cannot be
/// allocated or a kernel fails.
#[allow(clippy::too_many_arguments)]
pub(crate) fn gathered_with(
    kernels: &GatherKernels,
    fallback: &Primitives,
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
    let need = 2 * longest * d + longest;
    let mut scratch = Vec::new();
    if scratch.try_reserve_exact(need).is_err() {
        warn!(need, "attention: gather scratch unavailable, using streaming path");
        streaming_with(fallback, q, keys, values, out, positions, config);
        return;
    }
    scratch.resize(need, 0.0f32);
    let (k_rows, rest) = scratch.split_at_mut(longest * d);
    let (v_rows, scores) = rest.split_at_mut(longest * d);

    for kv_head in 0..geo.kv_heads {
        for j in 0..longest {
            let offset = geo.cache_offset(j, kv_head);
            keys.read_f32(offset, &mut k_rows[j * d..(j + 1) * d]);
            values.read_f32(offset, &mut v_rows[j * d..(j + 1) * d]);
        }
        let group = config.num_queries_per_kv();
        for head in kv_head * group..(kv_head + 1) * group {
            for (t, &pos) in positions.iter().enumerate() {
                let start = config.window_start(pos);
                let len = pos + 1 - start;
                let k = &k_rows[start * d..(pos + 1) * d];
                let v = &v_rows[start * d..(pos + 1) * d];
                let s = &mut scores[..len];
                let range = geo.head_range(t, head);
                let ok = (kernels.gemv)(Transpose::No, len, d, k, &q[range.clone()], s)
                    && (kernels.softmax)(s, config.scale)
                    && (kernels.gemv)(Transpose::Yes, len, d, v, s, &mut out[range]);
                if !ok {
                    debug!("attention: gathered kernel failed, using streaming path");
                    streaming_with(fallback, q, keys, values, out, positions, config);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::streaming_attention;
    use crate::attention::test_support::caches;
    use crate::kernels::test_util::{assert_close, random_vec};
    use crate::tensor::DType;

    fn failing_softmax(_: &mut [f32], _: f32) -> bool {
        false
    }

    #[test]
    fn matches_streaming_on_half_caches() {
        for (len, heads, kv_heads) in [(1, 2, 1), (17, 4, 2), (130, 2, 2)] {
            let d = 8;
            let config = AttentionConfig::new(heads, kv_heads, d);
            let (keys, values) = caches(DType::F16, len, kv_heads, d, 21);
            let positions: Vec<usize> = (0..len).collect();
            let q = random_vec(len * heads * d, 22);
            let mut gathered = vec![0.0; q.len()];
            let mut streamed = vec![0.0; q.len()];
            gathered_attention(&q, &keys.view(), &values.view(), &mut gathered, &positions, &config);
            streaming_attention(&q, &keys.view(), &values.view(), &mut streamed, &positions, &config);
            assert_close(&gathered, &streamed, 1e-5);
        }
    }

    #[test]
    fn decode_step_reads_prefix_only() {
        let d = 4;
        let config = AttentionConfig::new(2, 2, d);
        let (keys, values) = caches(DType::F16, 8, 2, d, 5);
        let q = random_vec(2 * d, 6);
        let mut gathered = vec![0.0; 2 * d];
        let mut streamed = vec![0.0; 2 * d];
        gathered_attention(&q, &keys.view(), &values.view(), &mut gathered, &[3], &config);
        streaming_attention(&q, &keys.view(), &values.view(), &mut streamed, &[3], &config);
        assert_close(&gathered, &streamed, 1e-5);
    }

    #[test]
    fn kernel_failure_falls_back_to_streaming() {
        let kernels = GatherKernels {
            gemv: portable_gemv,
            softmax: failing_softmax,
        };
        let d = 4;
        let config = AttentionConfig::new(1, 1, d);
        let (keys, values) = caches(DType::F16, 5, 1, d, 7);
        let q = random_vec(2 * d, 8);
        let mut out = vec![0.0; 2 * d];
        let mut expected = vec![0.0; 2 * d];
        gathered_with(&kernels, &PRIMITIVES, &q, &keys.view(), &values.view(), &mut out, &[2, 4], &config);
        streaming_attention(&q, &keys.view(), &values.view(), &mut expected, &[2, 4], &config);
        assert_eq!(out, expected);
    }
}
