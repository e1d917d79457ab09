//! Block normalization: RMSNorm or LayerNorm over the hidden dimension.

use super::config::NormKind;
use super::loader::WeightLoader;
use crate::backend::Backend;
use crate::error::{try_alloc, EmberError, Result};
use crate::tensor::{DType, Tensor, TensorMeta};

/// A normalization layer with its weights.
#[derive(Debug, Clone)]
pub struct Norm {
    kind: NormKind,
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f32,
}

impl Norm {
    /// Wrap loaded weights. `weight` is 1D; `bias`, if any, matches it.
    pub fn new(kind: NormKind, weight: Tensor, bias: Option<Tensor>, eps: f32) -> Result<Self> {
        if weight.ndim() != 1 {
            return Err(EmberError::InvalidShape(format!(
                "norm weight must be 1D, got {:?}",
                weight.dims()
            )));
        }
        if let Some(b) = &bias {
            if !b.same_shape(&weight) {
                return Err(EmberError::ShapeMismatch(format!(
                    "norm bias {:?} vs weight {:?}",
                    b.dims(),
                    weight.dims()
                )));
            }
        }
        Ok(Self {
            kind,
            weight,
            bias,
            eps,
        })
    }

    /// Unit weight, no bias.
    pub fn ones(kind: NormKind, dim: usize, eps: f32) -> Result<Self> {
        let mut weight = Tensor::zeros(DType::F32, &[dim])?;
        weight.fill(1.0);
        Self::new(kind, weight, None, eps)
    }

    /// Take `<prefix>.weight` (and `<prefix>.bias` when present).
    pub fn load(loader: &mut WeightLoader, prefix: &str, kind: NormKind, eps: f32) -> Result<Self> {
        let weight = loader.take(&format!("{}.weight", prefix))?;
        let bias = loader.take_optional(&format!("{}.bias", prefix));
        Self::new(kind, weight, bias, eps)
    }

    /// Like [`Norm::load`], `None` when the weight is absent.
    pub fn load_optional(
        loader: &mut WeightLoader,
        prefix: &str,
        kind: NormKind,
        eps: f32,
    ) -> Result<Option<Self>> {
        if !loader.contains(&format!("{}.weight", prefix)) {
            return Ok(None);
        }
        Self::load(loader, prefix, kind, eps).map(Some)
    }

    /// Normalized width.
    pub fn dim(&self) -> usize {
        self.weight.numel()
    }

    /// Normalization kind.
    pub fn kind(&self) -> NormKind {
        self.kind
    }

    /// Normalize every `dim`-sized row of `x` into `out`.
    pub fn forward(&self, backend: &Backend, x: &[f32], out: &mut [f32]) -> Result<()> {
        let dim = self.dim();
        if x.len() != out.len() || x.len() % dim != 0 {
            return Err(EmberError::ShapeMismatch(format!(
                "norm of width {} over {} inputs into {} outputs",
                dim,
                x.len(),
                out.len()
            )));
        }
        let weight = self.weight.view();
        match self.kind {
            NormKind::Rms => backend.rms_norm(x, &weight, out, self.eps),
            NormKind::Layer => {
                let bias = self.bias.as_ref().map(Tensor::view);
                backend.layer_norm(x, Some(&weight), bias.as_ref(), out, dim, self.eps)
            }
        }
        Ok(())
    }

    /// Normalize `x` in place through a scratch copy.
    pub fn forward_in_place(&self, backend: &Backend, x: &mut [f32]) -> Result<()> {
        let mut out = try_alloc(x.len(), 0.0f32, "norm output")?;
        self.forward(backend, x, &mut out)?;
        x.copy_from_slice(&out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_unit_weight() {
        let norm = Norm::ones(NormKind::Rms, 4, 0.0).unwrap();
        let x = [2.0, -2.0, 2.0, -2.0, 1.0, 1.0, 1.0, 1.0];
        let mut out = [0.0; 8];
        norm.forward(&Backend::scalar(), &x, &mut out).unwrap();
        for (o, e) in out.iter().zip([1.0, -1.0, 1.0, -1.0, 1.0, 1.0, 1.0, 1.0]) {
            assert!((o - e).abs() < 1e-6);
        }
    }

    #[test]
    fn layer_norm_with_bias() {
        let weight = Tensor::from_f32(&[2], vec![2.0, 2.0]).unwrap();
        let bias = Tensor::from_f32(&[2], vec![0.5, 0.5]).unwrap();
        let norm = Norm::new(NormKind::Layer, weight, Some(bias), 0.0).unwrap();
        let mut x = vec![1.0, 3.0];
        norm.forward_in_place(&Backend::scalar(), &mut x).unwrap();
        assert!((x[0] + 1.5).abs() < 1e-6);
        assert!((x[1] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn half_weights() {
        let weight = Tensor::from_f32_as(DType::F16, &[2], &[0.5, 0.5]).unwrap();
        let norm = Norm::new(NormKind::Rms, weight, None, 0.0).unwrap();
        let mut out = [0.0; 2];
        norm.forward(&Backend::scalar(), &[3.0, 3.0], &mut out).unwrap();
        assert!((out[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn shape_errors() {
        let norm = Norm::ones(NormKind::Rms, 4, 1e-6).unwrap();
        let mut out = [0.0; 3];
        assert!(norm.forward(&Backend::scalar(), &[1.0; 3], &mut out).is_err());
        assert!(Norm::new(NormKind::Rms, Tensor::zeros(DType::F32, &[2, 2]).unwrap(), None, 0.0).is_err());
        let bias = Tensor::zeros(DType::F32, &[3]).unwrap();
        assert!(Norm::new(NormKind::Layer, Tensor::zeros(DType::F32, &[2]).unwrap(), Some(bias), 0.0).is_err());
    }
}
