//! Numeric kernels.
//!
//! Every capability contributes a [`Primitives`] table of short vector
//! routines (dot, axpy, reductions, fused activations). [`simd::SimdOps`]
//! builds a complete backend from any such table; the AMX and Accelerate
//! backends override GEMM (and, for Accelerate, softmax and f16 attention)
//! and delegate the rest.
//!
//! All kernels accumulate in f32 whatever the storage type.

pub mod activation;
pub mod gemm;
pub mod norm;
pub mod rope;
pub mod sampling;
pub mod softmax;

pub(crate) mod gather;
pub(crate) mod scalar;
pub(crate) mod simd;

#[cfg(all(target_os = "macos", feature = "accelerate"))]
pub(crate) mod accelerate;
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub(crate) mod amx;
#[cfg(target_arch = "aarch64")]
pub(crate) mod neon;
#[cfg(target_arch = "x86_64")]
pub(crate) mod x86;

pub use activation::Activation;
pub use gemm::{gemm_reference, gemv_reference, Transpose};
pub use rope::RopeConfig;
pub use sampling::SamplingParams;

use crate::backend::BackendEntry;
use crate::tensor::{TensorMeta, TensorView};
use std::borrow::Cow;

/// Vector routines one capability provides.
///
/// Binary routines operate on the common prefix of their inputs.
#[derive(Debug)]
pub(crate) struct Primitives {
    pub(crate) name: &'static str,
    /// `Σ a[i] * b[i]`.
    pub(crate) dot: fn(&[f32], &[f32]) -> f32,
    /// `y[i] += a * x[i]`.
    pub(crate) axpy: fn(&mut [f32], f32, &[f32]),
    /// `x[i] *= s`.
    pub(crate) scale: fn(&mut [f32], f32),
    /// Maximum element, `-inf` for an empty slice.
    pub(crate) max: fn(&[f32]) -> f32,
    /// `Σ x[i]²`.
    pub(crate) sum_sq: fn(&[f32]) -> f32,
    /// `x[i] = exp(x[i] - shift)`, returning the sum.
    pub(crate) exp_sum: fn(&mut [f32], f32) -> f32,
    /// SiLU in place.
    pub(crate) silu: fn(&mut [f32]),
    /// `gate[i] = silu(gate[i]) * up[i]`.
    pub(crate) silu_mul: fn(&mut [f32], &[f32]),
}

/// Every backend compiled into this build, usable on the host or not.
#[allow(unused_mut)]
pub(crate) fn builtin_backends() -> Vec<BackendEntry> {
    let mut entries = vec![scalar::ENTRY];
    #[cfg(target_arch = "aarch64")]
    entries.push(neon::ENTRY);
    #[cfg(target_arch = "x86_64")]
    {
        entries.push(x86::AVX2_ENTRY);
        entries.push(x86::AVX512_ENTRY);
    }
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    entries.push(amx::ENTRY);
    #[cfg(all(target_os = "macos", feature = "accelerate"))]
    entries.push(accelerate::ENTRY);
    entries
}

/// A small float tensor (norm weight, bias) as contiguous f32, borrowed when
/// already f32. `None` if it is not a contiguous float tensor or the
/// conversion buffer cannot be allocated.
pub(crate) fn f32_cow<'v>(t: &TensorView<'v>) -> Option<Cow<'v, [f32]>> {
    if !t.dtype().is_executable() || !t.is_contiguous() {
        return None;
    }
    if let Some(s) = t.as_f32() {
        return Some(Cow::Borrowed(s));
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(t.numel()).ok()?;
    buf.resize(t.numel(), 0.0);
    t.read_f32(0, &mut buf);
    Some(Cow::Owned(buf))
}

/// Whether `t` is a contiguous float tensor of rank `ndim`.
pub(crate) fn is_dense_float(t: &impl TensorMeta, ndim: usize) -> bool {
    t.ndim() == ndim && t.is_contiguous() && t.dtype().is_executable()
}

/// Forward `BackendOps` methods to an inner ops table.
#[cfg(any(all(target_arch = "aarch64", target_os = "macos"), all(target_os = "macos", feature = "accelerate")))]
macro_rules! delegate_ops {
    ($field:ident => $( fn $name:ident(&self $(, $arg:ident : $ty:ty)* ) -> $ret:ty; )*) => {
        $(
            fn $name(&self $(, $arg: $ty)*) -> $ret {
                self.$field.$name($($arg),*)
            }
        )*
    };
}
#[cfg(any(all(target_arch = "aarch64", target_os = "macos"), all(target_os = "macos", feature = "accelerate")))]
pub(crate) use delegate_ops;

#[cfg(test)]
pub(crate) mod test_util {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Deterministic values in `[-1, 1)`.
    pub(crate) fn random_vec(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    pub(crate) fn assert_close(actual: &[f32], expected: &[f32], rel: f32) {
        assert_eq!(actual.len(), expected.len());
        let scale = expected.iter().fold(1.0f32, |m, v| m.max(v.abs()));
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!(
                (a - e).abs() <= rel * scale,
                "index {}: {} vs {} (tol {})",
                i,
                a,
                e,
                rel * scale
            );
        }
    }
}
