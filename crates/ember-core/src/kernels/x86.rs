//! AVX2+FMA and AVX-512F primitives, selected by runtime detection.

use super::simd::SimdOps;
use super::{scalar, Primitives};
use crate::backend::{BackendEntry, BackendOps, BackendSettings};
use crate::capability::{self, Capability};
use std::arch::x86_64::*;
use std::sync::Arc;
use tracing::warn;

pub(crate) static AVX2: Primitives = Primitives {
    name: "avx2",
    dot: avx2::dot,
    axpy: avx2::axpy,
    scale: avx2::scale,
    max: avx2::max,
    sum_sq: avx2::sum_sq,
    exp_sum: avx2::exp_sum,
    silu: avx2::silu,
    silu_mul: avx2::silu_mul,
};

// AVX-512 hosts also pass the AVX2+FMA check, so the transcendental
// routines are shared.
pub(crate) static AVX512: Primitives = Primitives {
    name: "avx512",
    dot: avx512::dot,
    axpy: avx512::axpy,
    scale: avx512::scale,
    max: avx512::max,
    sum_sq: avx512::sum_sq,
    exp_sum: avx2::exp_sum,
    silu: avx2::silu,
    silu_mul: avx2::silu_mul,
};

pub(crate) const AVX2_ENTRY: BackendEntry = BackendEntry {
    name: "avx2",
    capability: Capability::Avx2,
    factory: avx2_factory,
};

pub(crate) const AVX512_ENTRY: BackendEntry = BackendEntry {
    name: "avx512",
    capability: Capability::Avx512,
    factory: avx512_factory,
};

fn checked(cap: Capability, prims: &'static Primitives, settings: &BackendSettings) -> Arc<dyn BackendOps> {
    if capability::detect().is_available(cap) {
        Arc::new(SimdOps::new(cap, prims, settings))
    } else {
        warn!(capability = %cap, "CPU lacks the required instructions, using scalar kernels");
        Arc::new(SimdOps::new(Capability::Scalar, &scalar::PRIMITIVES, settings))
    }
}

fn avx2_factory(settings: &BackendSettings) -> Arc<dyn BackendOps> {
    checked(Capability::Avx2, &AVX2, settings)
}

fn avx512_factory(settings: &BackendSettings) -> Arc<dyn BackendOps> {
    checked(Capability::Avx512, &AVX512, settings)
}

// The tables above are only installed once `checked` has confirmed the
// instructions exist, which is what makes the `unsafe` calls below sound.
// Every vector access covers `i..i + LANES` with `i + LANES <= n`, `n` at
// most each slice's length.

mod avx2 {
    use super::*;

    const LANES: usize = 8;

    pub(super) fn dot(a: &[f32], b: &[f32]) -> f32 {
        unsafe { dot_impl(a, b) }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn dot_impl(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let (pa, pb) = (a.as_ptr(), b.as_ptr());
        let mut acc0 = _mm256_setzero_ps();
        let mut acc1 = _mm256_setzero_ps();
        let mut i = 0;
        while i + 2 * LANES <= n {
            acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), acc0);
            acc1 = _mm256_fmadd_ps(
                _mm256_loadu_ps(pa.add(i + LANES)),
                _mm256_loadu_ps(pb.add(i + LANES)),
                acc1,
            );
            i += 2 * LANES;
        }
        while i + LANES <= n {
            acc0 = _mm256_fmadd_ps(_mm256_loadu_ps(pa.add(i)), _mm256_loadu_ps(pb.add(i)), acc0);
            i += LANES;
        }
        let mut sum = hsum(_mm256_add_ps(acc0, acc1));
        for j in i..n {
            sum += a[j] * b[j];
        }
        sum
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn hsum(v: __m256) -> f32 {
        let s = _mm_add_ps(_mm256_castps256_ps128(v), _mm256_extractf128_ps::<1>(v));
        let s = _mm_add_ps(s, _mm_movehl_ps(s, s));
        let s = _mm_add_ss(s, _mm_movehdup_ps(s));
        _mm_cvtss_f32(s)
    }

    pub(super) fn axpy(y: &mut [f32], a: f32, x: &[f32]) {
        unsafe { axpy_impl(y, a, x) }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn axpy_impl(y: &mut [f32], a: f32, x: &[f32]) {
        let n = y.len().min(x.len());
        let (py, px) = (y.as_mut_ptr(), x.as_ptr());
        let va = _mm256_set1_ps(a);
        let mut i = 0;
        while i + LANES <= n {
            let r = _mm256_fmadd_ps(_mm256_loadu_ps(px.add(i)), va, _mm256_loadu_ps(py.add(i)));
            _mm256_storeu_ps(py.add(i), r);
            i += LANES;
        }
        for j in i..n {
            y[j] += a * x[j];
        }
    }

    pub(super) fn scale(x: &mut [f32], s: f32) {
        unsafe { scale_impl(x, s) }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn scale_impl(x: &mut [f32], s: f32) {
        let n = x.len();
        let p = x.as_mut_ptr();
        let vs = _mm256_set1_ps(s);
        let mut i = 0;
        while i + LANES <= n {
            _mm256_storeu_ps(p.add(i), _mm256_mul_ps(_mm256_loadu_ps(p.add(i)), vs));
            i += LANES;
        }
        for v in &mut x[i..] {
            *v *= s;
        }
    }

    pub(super) fn max(x: &[f32]) -> f32 {
        unsafe { max_impl(x) }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn max_impl(x: &[f32]) -> f32 {
        let n = x.len();
        let p = x.as_ptr();
        let mut acc = _mm256_set1_ps(f32::NEG_INFINITY);
        let mut i = 0;
        while i + LANES <= n {
            acc = _mm256_max_ps(acc, _mm256_loadu_ps(p.add(i)));
            i += LANES;
        }
        let mut lanes = [0.0f32; LANES];
        _mm256_storeu_ps(lanes.as_mut_ptr(), acc);
        lanes
            .iter()
            .chain(&x[i..])
            .copied()
            .fold(f32::NEG_INFINITY, f32::max)
    }

    pub(super) fn sum_sq(x: &[f32]) -> f32 {
        dot(x, x)
    }

    /// `exp` on eight lanes; see the NEON version for the scheme.
    #[target_feature(enable = "avx2,fma")]
    unsafe fn exp8(x: __m256) -> __m256 {
        let x = _mm256_min_ps(_mm256_max_ps(x, _mm256_set1_ps(-87.0)), _mm256_set1_ps(88.0));
        let ni = _mm256_cvtps_epi32(_mm256_mul_ps(x, _mm256_set1_ps(std::f32::consts::LOG2_E)));
        let n = _mm256_cvtepi32_ps(ni);
        let r = _mm256_fnmadd_ps(n, _mm256_set1_ps(0.693_359_4), x);
        let r = _mm256_fnmadd_ps(n, _mm256_set1_ps(-2.121_944_4e-4), r);

        let mut p = _mm256_set1_ps(1.0 / 120.0);
        p = _mm256_fmadd_ps(p, r, _mm256_set1_ps(1.0 / 24.0));
        p = _mm256_fmadd_ps(p, r, _mm256_set1_ps(1.0 / 6.0));
        p = _mm256_fmadd_ps(p, r, _mm256_set1_ps(0.5));
        p = _mm256_fmadd_ps(p, r, _mm256_set1_ps(1.0));
        p = _mm256_fmadd_ps(p, r, _mm256_set1_ps(1.0));

        let bits = _mm256_slli_epi32::<23>(_mm256_add_epi32(ni, _mm256_set1_epi32(127)));
        _mm256_mul_ps(p, _mm256_castsi256_ps(bits))
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn silu8(x: __m256) -> __m256 {
        let neg = _mm256_sub_ps(_mm256_setzero_ps(), x);
        _mm256_div_ps(x, _mm256_add_ps(_mm256_set1_ps(1.0), exp8(neg)))
    }

    pub(super) fn exp_sum(x: &mut [f32], shift: f32) -> f32 {
        unsafe { exp_sum_impl(x, shift) }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn exp_sum_impl(x: &mut [f32], shift: f32) -> f32 {
        let n = x.len();
        let p = x.as_mut_ptr();
        let vshift = _mm256_set1_ps(shift);
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i + LANES <= n {
            let e = exp8(_mm256_sub_ps(_mm256_loadu_ps(p.add(i)), vshift));
            _mm256_storeu_ps(p.add(i), e);
            acc = _mm256_add_ps(acc, e);
            i += LANES;
        }
        let mut sum = hsum(acc);
        for v in &mut x[i..] {
            *v = (*v - shift).exp();
            sum += *v;
        }
        sum
    }

    pub(super) fn silu(x: &mut [f32]) {
        unsafe { silu_impl(x) }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn silu_impl(x: &mut [f32]) {
        let n = x.len();
        let p = x.as_mut_ptr();
        let mut i = 0;
        while i + LANES <= n {
            _mm256_storeu_ps(p.add(i), silu8(_mm256_loadu_ps(p.add(i))));
            i += LANES;
        }
        for v in &mut x[i..] {
            *v = crate::kernels::activation::silu(*v);
        }
    }

    pub(super) fn silu_mul(gate: &mut [f32], up: &[f32]) {
        unsafe { silu_mul_impl(gate, up) }
    }

    #[target_feature(enable = "avx2,fma")]
    unsafe fn silu_mul_impl(gate: &mut [f32], up: &[f32]) {
        let n = gate.len().min(up.len());
        let (pg, pu) = (gate.as_mut_ptr(), up.as_ptr());
        let mut i = 0;
        while i + LANES <= n {
            let g = silu8(_mm256_loadu_ps(pg.add(i)));
            _mm256_storeu_ps(pg.add(i), _mm256_mul_ps(g, _mm256_loadu_ps(pu.add(i))));
            i += LANES;
        }
        for j in i..n {
            gate[j] = crate::kernels::activation::silu(gate[j]) * up[j];
        }
    }
}

mod avx512 {
    use super::*;

    const LANES: usize = 16;

    pub(super) fn dot(a: &[f32], b: &[f32]) -> f32 {
        unsafe { dot_impl(a, b) }
    }

    #[target_feature(enable = "avx512f")]
    unsafe fn dot_impl(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let (pa, pb) = (a.as_ptr(), b.as_ptr());
        let mut acc = _mm512_setzero_ps();
        let mut i = 0;
        while i + LANES <= n {
            acc = _mm512_fmadd_ps(_mm512_loadu_ps(pa.add(i)), _mm512_loadu_ps(pb.add(i)), acc);
            i += LANES;
        }
        let mut sum = _mm512_reduce_add_ps(acc);
        for j in i..n {
            sum += a[j] * b[j];
        }
        sum
    }

    pub(super) fn axpy(y: &mut [f32], a: f32, x: &[f32]) {
        unsafe { axpy_impl(y, a, x) }
    }

    #[target_feature(enable = "avx512f")]
    unsafe fn axpy_impl(y: &mut [f32], a: f32, x: &[f32]) {
        let n = y.len().min(x.len());
        let (py, px) = (y.as_mut_ptr(), x.as_ptr());
        let va = _mm512_set1_ps(a);
        let mut i = 0;
        while i + LANES <= n {
            let r = _mm512_fmadd_ps(_mm512_loadu_ps(px.add(i)), va, _mm512_loadu_ps(py.add(i)));
            _mm512_storeu_ps(py.add(i), r);
            i += LANES;
        }
        for j in i..n {
            y[j] += a * x[j];
        }
    }

    pub(super) fn scale(x: &mut [f32], s: f32) {
        unsafe { scale_impl(x, s) }
    }

    #[target_feature(enable = "avx512f")]
    unsafe fn scale_impl(x: &mut [f32], s: f32) {
        let n = x.len();
        let p = x.as_mut_ptr();
        let vs = _mm512_set1_ps(s);
        let mut i = 0;
        while i + LANES <= n {
            _mm512_storeu_ps(p.add(i), _mm512_mul_ps(_mm512_loadu_ps(p.add(i)), vs));
            i += LANES;
        }
        for v in &mut x[i..] {
            *v *= s;
        }
    }

    pub(super) fn max(x: &[f32]) -> f32 {
        unsafe { max_impl(x) }
    }

    #[target_feature(enable = "avx512f")]
    unsafe fn max_impl(x: &[f32]) -> f32 {
        let n = x.len();
        let p = x.as_ptr();
        let mut acc = _mm512_set1_ps(f32::NEG_INFINITY);
        let mut i = 0;
        while i + LANES <= n {
            acc = _mm512_max_ps(acc, _mm512_loadu_ps(p.add(i)));
            i += LANES;
        }
        x[i..]
            .iter()
            .copied()
            .fold(_mm512_reduce_max_ps(acc), f32::max)
    }

    pub(super) fn sum_sq(x: &[f32]) -> f32 {
        dot(x, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::test_util::{assert_close, random_vec};

    fn tables() -> Vec<&'static Primitives> {
        let caps = capability::detect();
        let mut out = Vec::new();
        if caps.is_available(Capability::Avx2) {
            out.push(&AVX2);
        }
        if caps.is_available(Capability::Avx512) {
            out.push(&AVX512);
        }
        out
    }

    #[test]
    fn matches_scalar() {
        for prims in tables() {
            for len in [0, 1, 7, 8, 9, 16, 33, 100] {
                let a = random_vec(len, 1);
                let b = random_vec(len, 2);
                let d = (prims.dot)(&a, &b);
                let e = (scalar::PRIMITIVES.dot)(&a, &b);
                assert!((d - e).abs() < 1e-5, "{} len {}", prims.name, len);
                assert_eq!((prims.max)(&a), (scalar::PRIMITIVES.max)(&a));

                let mut y = b.clone();
                let mut z = b.clone();
                (prims.axpy)(&mut y, 0.3, &a);
                (scalar::PRIMITIVES.axpy)(&mut z, 0.3, &a);
                assert_close(&y, &z, 1e-6);

                let mut x = a.clone();
                let mut w = a.clone();
                let sx = (prims.exp_sum)(&mut x, 0.25);
                let sw = (scalar::PRIMITIVES.exp_sum)(&mut w, 0.25);
                assert!((sx - sw).abs() <= 1e-5 * sw.max(1.0));
                assert_close(&x, &w, 1e-5);
            }
        }
    }

    #[test]
    fn factory_degrades_without_cpu_support() {
        let ops = avx512_factory(&BackendSettings { threads: 1 });
        if !capability::detect().is_available(Capability::Avx512) {
            assert_eq!(ops.capability(), Capability::Scalar);
        } else {
            assert_eq!(ops.capability(), Capability::Avx512);
        }
    }
}
