//! Apple Accelerate backend: cblas GEMM/GEMV and vDSP softmax.
//!
//! Each op first shapes its operands into what the framework wants
//! (contiguous row-major f32). When that is not possible, or the framework
//! call fails, the op runs on the vector kernels instead.

use super::gemm::{gemm_dims, gemv_dims, is_dot_form, op_a_f32, tile_rows, GemmDims, Rows};
use super::simd::SimdOps;
use super::{delegate_ops, softmax, Primitives, RopeConfig, SamplingParams, Transpose};
use crate::attention::{gathered_with, AttentionConfig, GatherKernels};
use crate::backend::{BackendEntry, BackendOps, BackendSettings, Dispatch, Op};
use crate::capability::Capability;
use crate::error::try_alloc;
use crate::tensor::{DType, TensorMeta, TensorView, TensorViewMut};
use ember_ffi::accelerate as ffi;
use rand::rngs::StdRng;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::debug;

#[cfg(target_arch = "aarch64")]
use super::neon::PRIMITIVES;
#[cfg(not(target_arch = "aarch64"))]
use super::scalar::PRIMITIVES;

pub(crate) const ENTRY: BackendEntry = BackendEntry {
    name: "accelerate",
    capability: Capability::Accelerate,
    factory,
};

fn factory(settings: &BackendSettings) -> Arc<dyn BackendOps> {
    Arc::new(AccelerateOps {
        inner: SimdOps::new(Capability::Accelerate, &PRIMITIVES, settings),
    })
}

static ACCELERATE_GATHER: GatherKernels = GatherKernels {
    gemv: |trans, rows, cols, a, x, y| ffi::sgemv(trans, rows, cols, a, x, y).is_ok(),
    softmax: |x, scale| ffi::softmax_in_place(x, scale).is_ok(),
};

#[derive(Debug)]
pub(crate) struct AccelerateOps {
    inner: SimdOps,
}

impl AccelerateOps {
    fn prims(&self) -> &'static Primitives {
        self.inner.prims()
    }

    /// False when the call must be redone by the vector kernels.
    fn blas_gemm(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        c: &mut TensorViewMut<'_>,
        trans_a: Transpose,
        trans_b: Transpose,
    ) -> bool {
        let Some(dims) = gemm_dims(a, b, c, trans_a, trans_b) else {
            return true;
        };
        let Some((rows, flipped)) = Rows::of(b) else {
            return false;
        };
        let dot_form = is_dot_form(flipped, trans_b);
        let Some(a_f32) = op_a_f32(a, trans_a, dims) else {
            return false;
        };
        if dims.m == 1 && !rows.is_f32() {
            return with_f32_output(c, dims, |y| self.vector_matrix(&a_f32, &rows, dot_form, dims, y));
        }
        let b_f32: Cow<'_, [f32]> = match rows.view.as_f32() {
            Some(s) => Cow::Borrowed(s),
            None => match try_alloc(rows.rows * rows.cols, 0.0f32, "gemm B conversion") {
                Ok(mut buf) => {
                    rows.view.read_f32(0, &mut buf);
                    Cow::Owned(buf)
                }
                Err(_) => return false,
            },
        };
        let storage_trans = if dot_form { Transpose::Yes } else { Transpose::No };
        with_f32_output(c, dims, |out| {
            match ffi::sgemm(Transpose::No, storage_trans, dims.m, dims.n, dims.k, &a_f32, &b_f32, out) {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "accelerate: sgemm failed");
                    false
                }
            }
        })
    }

    /// `y = x · op(B)` for a single row with 16-bit `B`, converted a tile
    /// at a time so the f32 copy of `B` never exists whole.
    fn vector_matrix(&self, x: &[f32], b: &Rows<'_>, dot_form: bool, dims: GemmDims, y: &mut [f32]) -> bool {
        let step = tile_rows(self.inner.tile_bytes(), b.cols, b.rows);
        let mut tile = Vec::new();
        if dot_form {
            // storage [n, k]: each tile yields a slice of y
            for j0 in (0..dims.n).step_by(step) {
                let len = step.min(dims.n - j0);
                let a = b.f32_rows(j0, len, &mut tile);
                if ffi::sgemv(Transpose::No, len, dims.k, a, x, &mut y[j0..j0 + len]).is_err() {
                    return false;
                }
            }
            return true;
        }
        // storage [k, n]: each tile adds a partial product into y
        let Ok(mut partial) = try_alloc(dims.n, 0.0f32, "gemv partial") else {
            return false;
        };
        y.fill(0.0);
        for p0 in (0..dims.k).step_by(step) {
            let len = step.min(dims.k - p0);
            let a = b.f32_rows(p0, len, &mut tile);
            if ffi::sgemv(Transpose::Yes, len, dims.n, a, &x[p0..p0 + len], &mut partial).is_err() {
                return false;
            }
            (self.prims().axpy)(y, 1.0, &partial);
        }
        true
    }
}

/// Run `f` on `c` as a contiguous f32 slice, staging through a scratch
/// buffer when `c` is strided or half precision.
fn with_f32_output(c: &mut TensorViewMut<'_>, dims: GemmDims, f: impl FnOnce(&mut [f32]) -> bool) -> bool {
    if c.is_contiguous() && c.dtype() == DType::F32 {
        return match c.as_f32_mut() {
            Some(out) => f(out),
            None => false,
        };
    }
    let Ok(mut scratch) = try_alloc(dims.m * dims.n, 0.0f32, "gemm output staging") else {
        return false;
    };
    if !f(&mut scratch) {
        return false;
    }
    match TensorView::wrap_f32(&[dims.m, dims.n], &scratch) {
        Ok(src) => c.copy_from(&src).is_ok(),
        Err(_) => false,
    }
}

impl BackendOps for AccelerateOps {
    fn capability(&self) -> Capability {
        Capability::Accelerate
    }

    fn supported_ops(&self) -> &'static [Op] {
        &Op::ALL
    }

    fn gemm(
        &self,
        a: &TensorView<'_>,
        b: &TensorView<'_>,
        c: &mut TensorViewMut<'_>,
        trans_a: Transpose,
        trans_b: Transpose,
    ) -> Dispatch {
        if !self.blas_gemm(a, b, c, trans_a, trans_b) {
            debug!("accelerate: gemm not expressible as cblas call, using vector kernels");
            return self.inner.gemm(a, b, c, trans_a, trans_b);
        }
        Dispatch::Handled(())
    }

    fn gemv(&self, a: &TensorView<'_>, x: &[f32], y: &mut [f32], trans: Transpose) -> Dispatch {
        if gemv_dims(a, x, y, trans).is_none() {
            return Dispatch::Handled(());
        }
        if let (true, Some(data)) = (a.is_contiguous(), a.as_f32()) {
            let (rows, cols) = (a.dims()[0], a.dims()[1]);
            match ffi::sgemv(trans, rows, cols, data, x, y) {
                Ok(()) => return Dispatch::Handled(()),
                Err(e) => debug!(error = %e, "accelerate: sgemv failed"),
            }
        }
        self.inner.gemv(a, x, y, trans)
    }

    fn softmax(&self, x: &mut [f32], cols: usize, scale: f32) -> Dispatch {
        if cols == 0 || x.len() % cols != 0 {
            return self.inner.softmax(x, cols, scale);
        }
        softmax::softmax_rows_via(self.prims(), x, cols, scale, |row: &mut [f32], scale| {
            match ffi::softmax_in_place(row, scale) {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "accelerate: softmax failed");
                    false
                }
            }
        });
        Dispatch::Handled(())
    }

    fn attention(
        &self,
        q: &[f32],
        keys: &TensorView<'_>,
        values: &TensorView<'_>,
        out: &mut [f32],
        positions: &[usize],
        config: &AttentionConfig,
    ) -> Dispatch {
        if matches!(keys.dtype(), DType::F16 | DType::BF16) {
            gathered_with(&ACCELERATE_GATHER, self.prims(), q, keys, values, out, positions, config);
            return Dispatch::Handled(());
        }
        self.inner.attention(q, keys, values, out, positions, config)
    }

    delegate_ops! { inner =>
        fn silu(&self, x: &mut [f32]) -> Dispatch;
        fn silu_mul(&self, gate: &mut [f32], up: &[f32]) -> Dispatch;
        fn gelu(&self, x: &mut [f32]) -> Dispatch;
        fn gelu_tanh(&self, x: &mut [f32]) -> Dispatch;
        fn rms_norm(&self, x: &[f32], weight: &TensorView<'_>, out: &mut [f32], eps: f32) -> Dispatch;
        fn layer_norm(&self, x: &[f32], weight: Option<&TensorView<'_>>, bias: Option<&TensorView<'_>>, out: &mut [f32], dim: usize, eps: f32) -> Dispatch;
        fn rope(&self, q: &mut [f32], k: &mut [f32], positions: &[usize], cos: &[f32], sin: &[f32], config: &RopeConfig) -> Dispatch;
        fn sample(&self, logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> Dispatch<u32>;
        fn embedding(&self, table: &TensorView<'_>, ids: &[u32], out: &mut [f32]) -> Dispatch;
        fn kv_append(&self, keys: &mut TensorViewMut<'_>, values: &mut TensorViewMut<'_>, k: &[f32], v: &[f32], live_len: usize) -> Dispatch<usize>;
    }
}
