//! Portable scalar primitives and the scalar backend entry.

use super::activation;
use super::simd::SimdOps;
use super::Primitives;
use crate::backend::{BackendEntry, BackendOps, BackendSettings};
use crate::capability::Capability;
use std::sync::Arc;

pub(crate) static PRIMITIVES: Primitives = Primitives {
    name: "scalar",
    dot,
    axpy,
    scale,
    max,
    sum_sq,
    exp_sum,
    silu,
    silu_mul,
};

/// Always compiled, always available.
pub(crate) const ENTRY: BackendEntry = BackendEntry {
    name: "scalar",
    capability: Capability::Scalar,
    factory,
};

fn factory(settings: &BackendSettings) -> Arc<dyn BackendOps> {
    Arc::new(SimdOps::new(Capability::Scalar, &PRIMITIVES, settings))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let (a, b) = (&a[..n], &b[..n]);
    // four independent chains so the compiler can keep them in registers
    let mut acc = [0.0f32; 4];
    let split = n - n % 4;
    for (ca, cb) in a[..split].chunks_exact(4).zip(b[..split].chunks_exact(4)) {
        for lane in 0..4 {
            acc[lane] += ca[lane] * cb[lane];
        }
    }
    let mut sum = (acc[0] + acc[1]) + (acc[2] + acc[3]);
    for (x, y) in a[split..].iter().zip(&b[split..]) {
        sum += x * y;
    }
    sum
}

fn axpy(y: &mut [f32], a: f32, x: &[f32]) {
    for (y, x) in y.iter_mut().zip(x) {
        *y += a * x;
    }
}

fn scale(x: &mut [f32], s: f32) {
    for v in x {
        *v *= s;
    }
}

fn max(x: &[f32]) -> f32 {
    x.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

fn sum_sq(x: &[f32]) -> f32 {
    dot(x, x)
}

fn exp_sum(x: &mut [f32], shift: f32) -> f32 {
    let mut sum = 0.0;
    for v in x {
        *v = (*v - shift).exp();
        sum += *v;
    }
    sum
}

fn silu(x: &mut [f32]) {
    for v in x {
        *v = activation::silu(*v);
    }
}

fn silu_mul(gate: &mut [f32], up: &[f32]) {
    for (g, u) in gate.iter_mut().zip(up) {
        *g = activation::silu(*g) * u;
    }
}
