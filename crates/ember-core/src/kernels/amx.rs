//! Apple Silicon matrix backend.
//!
//! The AMX coprocessor has no public instruction set, so GEMM here keeps
//! its geometry rather than its opcodes: `B` is packed into f32 panels of
//! 32 columns (one AMX Z-register row) by `k` rows, and each output panel
//! of a row of `C` is accumulated with NEON FMAs while the panel stays in
//! L1. Everything except GEMM runs on the NEON kernels.

use super::gemm::{gemm_dims, is_dot_form, op_a_f32, GemmDims, Rows};
use super::simd::SimdOps;
use super::{delegate_ops, neon, Primitives, RopeConfig, SamplingParams, Transpose};
use crate::attention::AttentionConfig;
use crate::backend::{BackendEntry, BackendOps, BackendSettings, Dispatch, Op};
use crate::capability::Capability;
use crate::pool;
use crate::tensor::{DType, TensorMeta, TensorView, TensorViewMut};
use rand::rngs::StdRng;
use std::sync::Arc;
use tracing::debug;

/// Output columns per packed panel.
pub(crate) const PANEL: usize = 32;

pub(crate) const ENTRY: BackendEntry = BackendEntry {
    name: "amx",
    capability: Capability::Amx,
    factory,
};

fn factory(settings: &BackendSettings) -> Arc<dyn BackendOps> {
    Arc::new(AmxOps {
        inner: SimdOps::new(Capability::Amx, &neon::PRIMITIVES, settings),
    })
}

#[derive(Debug)]
pub(crate) struct AmxOps {
    inner: SimdOps,
}

impl AmxOps {
    /// Panel GEMM; false when the operands need the generic driver.
    fn panel_gemm(
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
        if dims.n < PANEL || !c.is_contiguous() || c.dtype() != DType::F32 {
            return false;
        }
        let Some((rows, flipped)) = Rows::of(b) else {
            return false;
        };
        let Some(a_rows) = op_a_f32(a, trans_a, dims) else {
            return false;
        };
        let mut panel = Vec::new();
        if panel.try_reserve_exact(dims.k * PANEL).is_err() {
            return false;
        }
        panel.resize(dims.k * PANEL, 0.0);
        let Some(out) = c.as_f32_mut() else {
            return false;
        };

        let GemmDims { n, k, .. } = dims;
        let dot_form = is_dot_form(flipped, trans_b);
        let parts = if dims.parallel(self.inner.threads()) {
            self.inner.threads()
        } else {
            1
        };
        let prims: &Primitives = self.inner.prims();
        for j0 in (0..n).step_by(PANEL) {
            let width = PANEL.min(n - j0);
            pack_panel(&rows, dot_form, j0, width, k, &mut panel[..k * width]);
            let packed = &panel[..k * width];
            let body = |i: usize, c_row: &mut [f32]| {
                let acc = &mut c_row[j0..j0 + width];
                acc.fill(0.0);
                for (&a_ip, p_row) in a_rows[i * k..(i + 1) * k].iter().zip(packed.chunks_exact(width)) {
                    (prims.axpy)(acc, a_ip, p_row);
                }
            };
            if parts > 1 {
                pool::global().for_each_row(&mut out[..dims.m * n], n, 1, parts, &body);
            } else {
                for (i, row) in out.chunks_exact_mut(n).take(dims.m).enumerate() {
                    body(i, row);
                }
            }
        }
        true
    }
}

/// Columns `j0..j0 + width` of `op(B)` as a `[k, width]` panel.
fn pack_panel(b: &Rows<'_>, dot_form: bool, j0: usize, width: usize, k: usize, panel: &mut [f32]) {
    if dot_form {
        // storage [n, k]
        for jj in 0..width {
            let base = (j0 + jj) * k;
            for p in 0..k {
                panel[p * width + jj] = b.view.get_f32(base + p);
            }
        }
    } else {
        // storage [k, n]
        for (p, dst) in panel.chunks_exact_mut(width).enumerate() {
            b.view.read_f32(p * b.cols + j0, dst);
        }
    }
}

impl BackendOps for AmxOps {
    fn capability(&self) -> Capability {
        Capability::Amx
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
        if !self.panel_gemm(a, b, c, trans_a, trans_b) {
            debug!("amx: operands not panel-friendly, using vector driver");
            return self.inner.gemm(a, b, c, trans_a, trans_b);
        }
        Dispatch::Handled(())
    }

    delegate_ops! { inner =>
        fn gemv(&self, a: &TensorView<'_>, x: &[f32], y: &mut [f32], trans: Transpose) -> Dispatch;
        fn silu(&self, x: &mut [f32]) -> Dispatch;
        fn silu_mul(&self, gate: &mut [f32], up: &[f32]) -> Dispatch;
        fn gelu(&self, x: &mut [f32]) -> Dispatch;
        fn gelu_tanh(&self, x: &mut [f32]) -> Dispatch;
        fn rms_norm(&self, x: &[f32], weight: &TensorView<'_>, out: &mut [f32], eps: f32) -> Dispatch;
        fn layer_norm(&self, x: &[f32], weight: Option<&TensorView<'_>>, bias: Option<&TensorView<'_>>, out: &mut [f32], dim: usize, eps: f32) -> Dispatch;
        fn rope(&self, q: &mut [f32], k: &mut [f32], positions: &[usize], cos: &[f32], sin: &[f32], config: &RopeConfig) -> Dispatch;
        fn attention(&self, q: &[f32], keys: &TensorView<'_>, values: &TensorView<'_>, out: &mut [f32], positions: &[usize], config: &AttentionConfig) -> Dispatch;
        fn softmax(&self, x: &mut [f32], cols: usize, scale: f32) -> Dispatch;
        fn sample(&self, logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> Dispatch<u32>;
        fn embedding(&self, table: &TensorView<'_>, ids: &[u32], out: &mut [f32]) -> Dispatch;
        fn kv_append(&self, keys: &mut TensorViewMut<'_>, values: &mut TensorViewMut<'_>, k: &[f32], v: &[f32], live_len: usize) -> Dispatch<usize>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::gemm::gemm_reference;
    use crate::kernels::test_util::{assert_close, random_vec};
    use crate::tensor::Tensor;

    #[test]
    fn panels_match_reference() {
        let ops = factory(&BackendSettings { threads: 2 });
        for (m, k, n) in [(1, 16, 32), (3, 40, 33), (65, 64, 96), (2, 7, 100)] {
            for (stored, tb) in [([k, n], Transpose::No), ([n, k], Transpose::Yes)] {
                let a = Tensor::from_f32(&[m, k], random_vec(m * k, 1)).unwrap();
                let b = Tensor::from_f32_as(DType::F16, &stored, &random_vec(n * k, 2)).unwrap();
                let mut got = Tensor::zeros(DType::F32, &[m, n]).unwrap();
                let mut want = Tensor::zeros(DType::F32, &[m, n]).unwrap();
                let _ = ops.gemm(&a.view(), &b.view(), &mut got.view_mut(), Transpose::No, tb);
                gemm_reference(&a.view(), &b.view(), &mut want.view_mut(), Transpose::No, tb);
                assert_close(&got.to_f32_vec(), &want.to_f32_vec(), 1e-4);
            }
        }
    }

    #[test]
    fn narrow_outputs_use_vector_driver() {
        let ops = factory(&BackendSettings { threads: 1 });
        let a = Tensor::from_f32(&[2, 3], random_vec(6, 3)).unwrap();
        let b = Tensor::from_f32(&[3, 4], random_vec(12, 4)).unwrap();
        let mut got = Tensor::zeros(DType::F32, &[2, 4]).unwrap();
        let mut want = Tensor::zeros(DType::F32, &[2, 4]).unwrap();
        let _ = ops.gemm(&a.view(), &b.view(), &mut got.view_mut(), Transpose::No, Transpose::No);
        gemm_reference(&a.view(), &b.view(), &mut want.view_mut(), Transpose::No, Transpose::No);
        assert_close(&got.to_f32_vec(), &want.to_f32_vec(), 1e-5);
    }
}
