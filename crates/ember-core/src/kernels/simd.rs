//! A complete backend built from one capability's [`Primitives`].

use super::{activation, gather, gemm, norm, rope, sampling, softmax, Primitives, RopeConfig, SamplingParams, Transpose};
use crate::attention::{self, AttentionConfig};
use crate::backend::{BackendOps, BackendSettings, Dispatch, Op};
use crate::capability::{self, Capability};
use crate::tensor::{TensorView, TensorViewMut};
use rand::rngs::StdRng;
use tracing::debug;

/// Ops table driving the shared kernels with one primitive set.
#[derive(Debug)]
pub(crate) struct SimdOps {
    capability: Capability,
    prims: &'static Primitives,
    threads: usize,
    tile_bytes: usize,
}

impl SimdOps {
    pub(crate) fn new(capability: Capability, prims: &'static Primitives, settings: &BackendSettings) -> Self {
        debug!(primitives = prims.name, threads = settings.threads, "building ops table");
        Self {
            capability,
            prims,
            threads: settings.threads.max(1),
            tile_bytes: capability::detect().cache_sizes().l2 / 2,
        }
    }

    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    pub(crate) fn prims(&self) -> &'static Primitives {
        self.prims
    }

    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    pub(crate) fn threads(&self) -> usize {
        self.threads
    }

    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    pub(crate) fn tile_bytes(&self) -> usize {
        self.tile_bytes
    }
}

impl BackendOps for SimdOps {
    fn capability(&self) -> Capability {
        self.capability
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
        gemm::gemm_tiled(self.prims, self.threads, self.tile_bytes, a, b, c, trans_a, trans_b);
        Dispatch::Handled(())
    }

    fn gemv(&self, a: &TensorView<'_>, x: &[f32], y: &mut [f32], trans: Transpose) -> Dispatch {
        gemm::gemv_tiled(self.prims, self.tile_bytes, a, x, y, trans);
        Dispatch::Handled(())
    }

    fn silu(&self, x: &mut [f32]) -> Dispatch {
        (self.prims.silu)(x);
        Dispatch::Handled(())
    }

    fn silu_mul(&self, gate: &mut [f32], up: &[f32]) -> Dispatch {
        if gate.len() != up.len() {
            debug!(gate = gate.len(), up = up.len(), "silu_mul: length mismatch");
        } else {
            (self.prims.silu_mul)(gate, up);
        }
        Dispatch::Handled(())
    }

    fn gelu(&self, x: &mut [f32]) -> Dispatch {
        for v in x {
            *v = activation::gelu(*v);
        }
        Dispatch::Handled(())
    }

    fn gelu_tanh(&self, x: &mut [f32]) -> Dispatch {
        for v in x {
            *v = activation::gelu_tanh(*v);
        }
        Dispatch::Handled(())
    }

    fn rms_norm(&self, x: &[f32], weight: &TensorView<'_>, out: &mut [f32], eps: f32) -> Dispatch {
        norm::rms_norm(self.prims, x, weight, out, eps);
        Dispatch::Handled(())
    }

    fn layer_norm(
        &self,
        x: &[f32],
        weight: Option<&TensorView<'_>>,
        bias: Option<&TensorView<'_>>,
        out: &mut [f32],
        dim: usize,
        eps: f32,
    ) -> Dispatch {
        norm::layer_norm(self.prims, x, weight, bias, out, dim, eps);
        Dispatch::Handled(())
    }

    fn rope(
        &self,
        q: &mut [f32],
        k: &mut [f32],
        positions: &[usize],
        cos: &[f32],
        sin: &[f32],
        config: &RopeConfig,
    ) -> Dispatch {
        rope::apply(q, k, positions, cos, sin, config);
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
        attention::streaming_with(self.prims, q, keys, values, out, positions, config);
        Dispatch::Handled(())
    }

    fn softmax(&self, x: &mut [f32], cols: usize, scale: f32) -> Dispatch {
        softmax::softmax_rows(self.prims, self.threads, x, cols, scale);
        Dispatch::Handled(())
    }

    fn sample(&self, logits: &[f32], params: &SamplingParams, rng: &mut StdRng) -> Dispatch<u32> {
        Dispatch::Handled(sampling::sample(logits, params, rng))
    }

    fn embedding(&self, table: &TensorView<'_>, ids: &[u32], out: &mut [f32]) -> Dispatch {
        gather::embedding(table, ids, out);
        Dispatch::Handled(())
    }

    fn kv_append(
        &self,
        keys: &mut TensorViewMut<'_>,
        values: &mut TensorViewMut<'_>,
        k: &[f32],
        v: &[f32],
        live_len: usize,
    ) -> Dispatch<usize> {
        Dispatch::Handled(gather::kv_append(keys, values, k, v, live_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendEntry;
    use crate::kernels::builtin_backends;
    use crate::kernels::test_util::{assert_close, random_vec};
    use crate::tensor::{DType, Tensor};

    fn usable() -> Vec<BackendEntry> {
        builtin_backends()
            .into_iter()
            .filter(|e| capability::detect().is_available(e.capability))
            .collect()
    }

    #[test]
    fn every_backend_matches_reference_gemm() {
        let sizes = [1, 2, 7, 64, 65, 128];
        let transposes = [
            (Transpose::No, Transpose::No),
            (Transpose::No, Transpose::Yes),
            (Transpose::Yes, Transpose::No),
            (Transpose::Yes, Transpose::Yes),
        ];
        let settings = BackendSettings { threads: 4 };
        for entry in usable() {
            let ops = (entry.factory)(&settings);
            for &m in &sizes {
                for &k in &sizes {
                    for &n in &sizes {
                        for (trans_a, trans_b) in transposes {
                            let a_dims = if trans_a == Transpose::Yes { [k, m] } else { [m, k] };
                            let b_dims = if trans_b == Transpose::Yes { [n, k] } else { [k, n] };
                            let a = Tensor::from_f32(&a_dims, random_vec(m * k, (m * k) as u64)).unwrap();
                            for dtype in [DType::F32, DType::F16, DType::BF16] {
                                let b = Tensor::from_f32_as(dtype, &b_dims, &random_vec(n * k, (n + k) as u64))
                                    .unwrap();
                                let mut got = Tensor::zeros(DType::F32, &[m, n]).unwrap();
                                let mut want = Tensor::zeros(DType::F32, &[m, n]).unwrap();
                                let _ = ops.gemm(&a.view(), &b.view(), &mut got.view_mut(), trans_a, trans_b);
                                gemm::gemm_reference(&a.view(), &b.view(), &mut want.view_mut(), trans_a, trans_b);
                                assert_close(&got.to_f32_vec(), &want.to_f32_vec(), 1e-4);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn every_backend_matches_scalar_elementwise() {
        let settings = BackendSettings { threads: 2 };
        let scalar = (crate::kernels::scalar::ENTRY.factory)(&settings);
        let x = random_vec(67, 1);
        let up = random_vec(67, 2);
        for entry in usable() {
            let ops = (entry.factory)(&settings);

            let (mut a, mut b) = (x.clone(), x.clone());
            let _ = ops.silu(&mut a);
            let _ = scalar.silu(&mut b);
            assert_close(&a, &b, 1e-5);

            let (mut a, mut b) = (x.clone(), x.clone());
            let _ = ops.silu_mul(&mut a, &up);
            let _ = scalar.silu_mul(&mut b, &up);
            assert_close(&a, &b, 1e-5);

            let w = Tensor::from_f32(&[67], random_vec(67, 3)).unwrap();
            let (mut a, mut b) = (vec![0.0; 67], vec![0.0; 67]);
            let _ = ops.rms_norm(&x, &w.view(), &mut a, 1e-6);
            let _ = scalar.rms_norm(&x, &w.view(), &mut b, 1e-6);
            assert_close(&a, &b, 1e-5);

            let (mut a, mut b) = (x.clone(), x.clone());
            let _ = ops.softmax(&mut a, 67, 0.7);
            let _ = scalar.softmax(&mut b, 67, 0.7);
            assert_close(&a, &b, 1e-5);
        }
    }

    #[test]
    fn every_backend_attention_matches_two_pass() {
        let settings = BackendSettings { threads: 1 };
        let (len, heads, kv_heads, d) = (20, 4, 2, 16);
        let config = AttentionConfig::new(heads, kv_heads, d);
        let (keys, values) = crate::attention::test_support::caches(DType::F16, len, kv_heads, d, 30);
        let positions: Vec<usize> = (0..len).collect();
        let q = random_vec(len * heads * d, 31);
        let mut want = vec![0.0; q.len()];
        attention::two_pass_attention(&q, &keys.view(), &values.view(), &mut want, &positions, &config);
        for entry in usable() {
            let ops = (entry.factory)(&settings);
            let mut got = vec![0.0; q.len()];
            let _ = ops.attention(&q, &keys.view(), &values.view(), &mut got, &positions, &config);
            assert_close(&got, &want, 1e-4);
        }
    }
}
