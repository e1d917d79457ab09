//! NEON primitives (aarch64 baseline, always present).

use super::simd::SimdOps;
use super::Primitives;
use crate::backend::{BackendEntry, BackendOps, BackendSettings};
use crate::capability::Capability;
use std::arch::aarch64::*;
use std::sync::Arc;

pub(crate) static PRIMITIVES: Primitives = Primitives {
    name: "neon",
    dot,
    axpy,
    scale,
    max,
    sum_sq,
    exp_sum,
    silu,
    silu_mul,
};

pub(crate) const ENTRY: BackendEntry = BackendEntry {
    name: "neon",
    capability: Capability::Neon,
    factory,
};

fn factory(settings: &BackendSettings) -> Arc<dyn BackendOps> {
    Arc::new(SimdOps::new(Capability::Neon, &PRIMITIVES, settings))
}

// SAFETY (all functions below): NEON is part of the aarch64 baseline, and
// every vector load/store touches indices `i..i + 4` with `i + 4 <= n`
// where `n` is at most the length of each slice involved.

fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let (pa, pb) = (a.as_ptr(), b.as_ptr());
    let mut i = 0;
    let mut sum = unsafe {
        let mut acc0 = vdupq_n_f32(0.0);
        let mut acc1 = vdupq_n_f32(0.0);
        let mut acc2 = vdupq_n_f32(0.0);
        let mut acc3 = vdupq_n_f32(0.0);
        while i + 16 <= n {
            acc0 = vfmaq_f32(acc0, vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i)));
            acc1 = vfmaq_f32(acc1, vld1q_f32(pa.add(i + 4)), vld1q_f32(pb.add(i + 4)));
            acc2 = vfmaq_f32(acc2, vld1q_f32(pa.add(i + 8)), vld1q_f32(pb.add(i + 8)));
            acc3 = vfmaq_f32(acc3, vld1q_f32(pa.add(i + 12)), vld1q_f32(pb.add(i + 12)));
            i += 16;
        }
        while i + 4 <= n {
            acc0 = vfmaq_f32(acc0, vld1q_f32(pa.add(i)), vld1q_f32(pb.add(i)));
            i += 4;
        }
        vaddvq_f32(vaddq_f32(vaddq_f32(acc0, acc1), vaddq_f32(acc2, acc3)))
    };
    for j in i..n {
        sum += a[j] * b[j];
    }
    sum
}

fn axpy(y: &mut [f32], a: f32, x: &[f32]) {
    let n = y.len().min(x.len());
    let (py, px) = (y.as_mut_ptr(), x.as_ptr());
    let mut i = 0;
    unsafe {
        let va = vdupq_n_f32(a);
        while i + 4 <= n {
            vst1q_f32(py.add(i), vfmaq_f32(vld1q_f32(py.add(i)), vld1q_f32(px.add(i)), va));
            i += 4;
        }
    }
    for j in i..n {
        y[j] += a * x[j];
    }
}

fn scale(x: &mut [f32], s: f32) {
    let n = x.len();
    let p = x.as_mut_ptr();
    let mut i = 0;
    unsafe {
        let vs = vdupq_n_f32(s);
        while i + 4 <= n {
            vst1q_f32(p.add(i), vmulq_f32(vld1q_f32(p.add(i)), vs));
            i += 4;
        }
    }
    for v in &mut x[i..] {
        *v *= s;
    }
}

fn max(x: &[f32]) -> f32 {
    let n = x.len();
    let p = x.as_ptr();
    let mut i = 0;
    let mut m = unsafe {
        let mut acc = vdupq_n_f32(f32::NEG_INFINITY);
        while i + 4 <= n {
            acc = vmaxq_f32(acc, vld1q_f32(p.add(i)));
            i += 4;
        }
        vmaxvq_f32(acc)
    };
    for &v in &x[i..] {
        m = m.max(v);
    }
    m
}

fn sum_sq(x: &[f32]) -> f32 {
    dot(x, x)
}

/// `exp` on four lanes: range reduction to `n·ln2 + r`, degree-5
/// polynomial in `r`, then scaling by `2^n` through the exponent bits.
/// Inputs are clamped to `[-87, 88]`.
#[inline(always)]
unsafe fn exp4(x: float32x4_t) -> float32x4_t {
    let x = vminq_f32(vmaxq_f32(x, vdupq_n_f32(-87.0)), vdupq_n_f32(88.0));
    let n = vrndnq_f32(vmulq_f32(x, vdupq_n_f32(std::f32::consts::LOG2_E)));
    let r = vfmsq_f32(x, n, vdupq_n_f32(0.693_359_4));
    let r = vfmsq_f32(r, n, vdupq_n_f32(-2.121_944_4e-4));

    let mut p = vdupq_n_f32(1.0 / 120.0);
    p = vfmaq_f32(vdupq_n_f32(1.0 / 24.0), p, r);
    p = vfmaq_f32(vdupq_n_f32(1.0 / 6.0), p, r);
    p = vfmaq_f32(vdupq_n_f32(0.5), p, r);
    p = vfmaq_f32(vdupq_n_f32(1.0), p, r);
    p = vfmaq_f32(vdupq_n_f32(1.0), p, r);

    let bits = vshlq_n_s32::<23>(vaddq_s32(vcvtq_s32_f32(n), vdupq_n_s32(127)));
    vmulq_f32(p, vreinterpretq_f32_s32(bits))
}

/// `x / (1 + exp(-x))` on four lanes.
#[inline(always)]
unsafe fn silu4(x: float32x4_t) -> float32x4_t {
    let denom = vaddq_f32(vdupq_n_f32(1.0), exp4(vnegq_f32(x)));
    vdivq_f32(x, denom)
}

fn exp_sum(x: &mut [f32], shift: f32) -> f32 {
    let n = x.len();
    let p = x.as_mut_ptr();
    let mut i = 0;
    let mut sum = unsafe {
        let vshift = vdupq_n_f32(shift);
        let mut acc = vdupq_n_f32(0.0);
        while i + 4 <= n {
            let e = exp4(vsubq_f32(vld1q_f32(p.add(i)), vshift));
            vst1q_f32(p.add(i), e);
            acc = vaddq_f32(acc, e);
            i += 4;
        }
        vaddvq_f32(acc)
    };
    for v in &mut x[i..] {
        *v = (*v - shift).exp();
        sum += *v;
    }
    sum
}

fn silu(x: &mut [f32]) {
    let n = x.len();
    let p = x.as_mut_ptr();
    let mut i = 0;
    unsafe {
        while i + 4 <= n {
            vst1q_f32(p.add(i), silu4(vld1q_f32(p.add(i))));
            i += 4;
        }
    }
    for v in &mut x[i..] {
        *v = super::activation::silu(*v);
    }
}

fn silu_mul(gate: &mut [f32], up: &[f32]) {
    let n = gate.len().min(up.len());
    let (pg, pu) = (gate.as_mut_ptr(), up.as_ptr());
    let mut i = 0;
    unsafe {
        while i + 4 <= n {
            let g = silu4(vld1q_f32(pg.add(i)));
            vst1q_f32(pg.add(i), vmulq_f32(g, vld1q_f32(pu.add(i))));
            i += 4;
        }
    }
    for j in i..n {
        gate[j] = super::activation::silu(gate[j]) * up[j];
    }
}
