//! Feed-forward block.
//!
//! Gated form (SwiGLU, GeGLU) when the checkpoint has a `gate_proj`:
//!
//! `down(act(gate(x)) * up(x))`
//!
//! otherwise the classic `down(act(up(x)))`.
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::linear::Linear;
use super::loader::WeightLoader;
use crate::backend::Backend;
use crate::error::{try_alloc, EmberError, Result};
use crate::kernels::Activation;

/// Feed-forward block with its projections.
#[derive(Debug, Clone)]
pub struct Mlp {
    gate_proj: Option<Linear>,
    up_proj: Linear,
    down_proj: Linear,
    activation: Activation,
}

impl Mlp {
    /// Assemble from projections; `gate_proj` selects the gated form.
    pub fn new(gate_proj: Option<Linear>, up_proj: Linear, down_proj: Linear, activation: Activation) -> Result<Self> {
        let inner = up_proj.out_features();
        let gate_ok = gate_proj.as_ref().map_or(true, |g| {
            g.out_features() == inner && g.in_features() == up_proj.in_features()
        });
        if !gate_ok || down_proj.in_features() != inner || down_proj.out_features() != up_proj.in_features() {
            return Err(EmberError::ShapeMismatch(format!(
                "mlp projections do not chain: up {}→{}, down {}→{}",
                up_proj.in_features(),
                inner,
                down_proj.in_features(),
                down_proj.out_features()
            )));
        }
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            activation: activation.resolved(),
        })
    }

    /// Load `<prefix>.{gate,up,down}_proj`.
    pub fn load(loader: &mut WeightLoader, prefix: &str, activation: Activation, bias: bool) -> Result<Self> {
        let gate_name = format!("{}.gate_proj", prefix);
        let gate_proj = if loader.contains(&format!("{}.weight", gate_name)) {
            Some(Linear::load(loader, &gate_name, bias)?)
        } else {
            None
        };
        let up_proj = Linear::load(loader, &format!("{}.up_proj", prefix), bias)?;
        let down_proj = Linear::load(loader, &format!("{}.down_proj", prefix), bias)?;
        Self::new(gate_proj, up_proj, down_proj, activation)
    }

    /// Whether the block is gated.
    pub fn is_gated(&self) -> bool {
        self.gate_proj.is_some()
    }

    /// Intermediate width.
    pub fn intermediate_size(&self) -> usize {
        self.up_proj.out_features()
    }

    /// Forward `x` (`[tokens, hidden]`) into `out` (`[tokens, hidden]`).
    pub fn forward(&self, backend: &Backend, x: &[f32], out: &mut [f32]) -> Result<()> {
        let hidden = self.up_proj.in_features();
        if x.len() % hidden != 0 || out.len() != x.len() {
            return Err(EmberError::ShapeMismatch(format!(
                "mlp over {} inputs into {} outputs with hidden {}",
                x.len(),
                out.len(),
                hidden
            )));
        }
        let inner_len = x.len() / hidden * self.intermediate_size();
        let mut up = try_alloc(inner_len, 0.0f32, "mlp up")?;
        self.up_proj.forward(backend, x, &mut up)?;

        let activated = match &self.gate_proj {
            Some(gate_proj) => {
                let mut gate = try_alloc(inner_len, 0.0f32, "mlp gate")?;
                gate_proj.forward(backend, x, &mut gate)?;
                if self.activation == Activation::Silu {
                    backend.silu_mul(&mut gate, &up);
                } else {
                    activate(backend, self.activation, &mut gate);
                    for (g, u) in gate.iter_mut().zip(&up) {
                        *g *= u;
                    }
                }
                gate
            }
            None => {
                activate(backend, self.activation, &mut up);
                up
            }
        };
        self.down_proj.forward(backend, &activated, out)
    }
}

/// Apply `activation` in place, through the backend where it has the op.
fn activate(backend: &Backend, activation: Activation, x: &mut [f32]) {
    match activation {
        Activation::Silu | Activation::Unknown => backend.silu(x),
        Activation::Gelu => backend.gelu(x),
        Activation::GeluTanh => backend.gelu_tanh(x),
        Activation::GeluQuick | Activation::Relu => activation.apply(x),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::activation::{gelu_tanh, silu};
    use crate::tensor::Tensor;

    fn linear(out: usize, inp: usize, values: Vec<f32>) -> Linear {
        Linear::new(Tensor::from_f32(&[out, inp], values).unwrap(), None, false).unwrap()
    }

    fn identity(n: usize) -> Vec<f32> {
        let mut v = vec![0.0; n * n];
        for i in 0..n {
            v[i * n + i] = 1.0;
        }
        v
    }

    #[test]
    fn swiglu_identity_projections() {
        let mlp = Mlp::new(
            Some(linear(2, 2, identity(2))),
            linear(2, 2, vec![2.0, 0.0, 0.0, 2.0]),
            linear(2, 2, identity(2)),
            Activation::Silu,
        )
        .unwrap();
        assert!(mlp.is_gated());
        let x = [0.5, -1.0];
        let mut out = [0.0; 2];
        mlp.forward(&Backend::scalar(), &x, &mut out).unwrap();
        for (o, &xi) in out.iter().zip(&x) {
            assert!((o - silu(xi) * 2.0 * xi).abs() < 1e-6);
        }
    }

    #[test]
    fn plain_gelu_block() {
        let mlp = Mlp::new(None, linear(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]), linear(2, 3, vec![1.0; 6]), Activation::GeluTanh)
            .unwrap();
        assert!(!mlp.is_gated());
        assert_eq!(mlp.intermediate_size(), 3);
        let mut out = [0.0; 2];
        mlp.forward(&Backend::scalar(), &[1.0, 2.0], &mut out).unwrap();
        let expected = gelu_tanh(1.0) + gelu_tanh(2.0) + gelu_tanh(3.0);
        assert!((out[0] - expected).abs() < 1e-5);
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn unknown_activation_runs_as_silu() {
        let mlp = Mlp::new(None, linear(1, 1, vec![1.0]), linear(1, 1, vec![1.0]), Activation::Unknown).unwrap();
        let mut out = [0.0];
        mlp.forward(&Backend::scalar(), &[1.0], &mut out).unwrap();
        assert!((out[0] - silu(1.0)).abs() < 1e-6);
    }

    #[test]
    fn mismatched_projections() {
        assert!(Mlp::new(None, linear(3, 2, vec![0.0; 6]), linear(2, 2, vec![0.0; 4]), Activation::Silu).is_err());
        assert!(Mlp::new(
            Some(linear(2, 2, vec![0.0; 4])),
            linear(3, 2, vec![0.0; 6]),
            linear(2, 3, vec![0.0; 6]),
            Activation::Silu
        )
        .is_err());
    }
}
