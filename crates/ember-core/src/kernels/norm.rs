//! RMSNorm and LayerNorm over rows.

use super::{f32_cow, Primitives};
use crate::tensor::{TensorMeta, TensorView};
use std::borrow::Cow;
use tracing::debug;

fn rows_fit(x: &[f32], out: &[f32], dim: usize) -> bool {
    if dim == 0 || x.len() % dim != 0 || out.len() != x.len() {
        debug!(x = x.len(), out = out.len(), dim, "norm: row size does not divide input");
        return false;
    }
    true
}

/// `out = x / sqrt(mean(x²) + eps) * weight` for every `weight.numel()`-sized
/// row of `x`.
pub(crate) fn rms_norm(prims: &Primitives, x: &[f32], weight: &TensorView<'_>, out: &mut [f32], eps: f32) {
    let dim = weight.numel();
    if !rows_fit(x, out, dim) {
        return;
    }
    let Some(w) = f32_cow(weight) else {
        debug!(dtype = %weight.dtype(), "rms_norm: weight is not a dense float tensor");
        return;
    };
    for (xr, or) in x.chunks_exact(dim).zip(out.chunks_exact_mut(dim)) {
        let mean_sq = (prims.sum_sq)(xr) / dim as f32;
        let inv = 1.0 / (mean_sq + eps).sqrt();
        for ((o, &xv), &wv) in or.iter_mut().zip(xr).zip(w.iter()) {
            *o = xv * inv * wv;
        }
    }
}

/// `Some(None)` when absent, `None` when present but unusable.
fn optional_row<'v>(t: Option<&TensorView<'v>>, dim: usize) -> Option<Option<Cow<'v, [f32]>>> {
    match t {
        None => Some(None),
        Some(t) if t.numel() == dim => f32_cow(t).map(Some),
        Some(_) => None,
    }
}

/// `out = (x - mean) / sqrt(var + eps) * weight + bias` for every
/// `dim`-sized row; a missing weight is one and a missing bias zero.
pub(crate) fn layer_norm(
    prims: &Primitives,
    x: &[f32],
    weight: Option<&TensorView<'_>>,
    bias: Option<&TensorView<'_>>,
    out: &mut [f32],
    dim: usize,
    eps: f32,
) {
    if !rows_fit(x, out, dim) {
        return;
    }
    let (Some(w), Some(b)) = (optional_row(weight, dim), optional_row(bias, dim)) else {
        debug!(dim, "layer_norm: weight or bias does not match the row size");
        return;
    };
    for (xr, or) in x.chunks_exact(dim).zip(out.chunks_exact_mut(dim)) {
        let mean = xr.iter().sum::<f32>() / dim as f32;
        for (o, &xv) in or.iter_mut().zip(xr) {
            *o = xv - mean;
        }
        let var = (prims.sum_sq)(or) / dim as f32;
        let inv = 1.0 / (var + eps).sqrt();
        (prims.scale)(or, inv);
        if let Some(w) = &w {
            for (o, &wv) in or.iter_mut().zip(w.iter()) {
                *o *= wv;
            }
        }
        if let Some(b) = &b {
            for (o, &bv) in or.iter_mut().zip(b.iter()) {
                *o += bv;
            }
        }
    }
}
