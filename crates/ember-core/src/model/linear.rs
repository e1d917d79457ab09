//! Dense projection `y = x · Wᵀ + b` over the backend GEMM.

use super::loader::WeightLoader;
use crate::backend::Backend;
use crate::error::{EmberError, Result};
use crate::kernels::Transpose;
use crate::tensor::{Tensor, TensorMeta, TensorView, TensorViewMut};

/// A projection with its weight in either storage orientation.
#[derive(Debug, Clone)]
pub struct Linear {
    /// `[out, in]`, or `[in, out]` when `transposed`.
    weight: Tensor,
    bias: Option<Vec<f32>>,
    transposed: bool,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Wrap a loaded 2D weight and optional bias.
    pub fn new(weight: Tensor, bias: Option<Tensor>, transposed: bool) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(EmberError::InvalidShape(format!(
                "linear weight must be 2D, got {:?}",
                weight.dims()
            )));
        }
        let (rows, cols) = (weight.dims()[0], weight.dims()[1]);
        let (out_features, in_features) = if transposed { (cols, rows) } else { (rows, cols) };
        let bias = match bias {
            Some(b) if b.numel() != out_features => {
                return Err(EmberError::ShapeMismatch(format!(
                    "bias of {} for {} outputs",
                    b.numel(),
                    out_features
                )));
            }
            Some(b) => Some(b.to_f32_vec()),
            None => None,
        };
        Ok(Self {
            weight,
            bias,
            transposed,
            in_features,
            out_features,
        })
    }

    /// Take `<prefix>.weight` and, if `require_bias` or present,
    /// `<prefix>.bias`.
    pub fn load(loader: &mut WeightLoader, prefix: &str, require_bias: bool) -> Result<Self> {
        let name = format!("{}.weight", prefix);
        let transposed = loader.is_transposed(&name);
        let weight = loader.take(&name)?;
        let bias_name = format!("{}.bias", prefix);
        let bias = if require_bias {
            Some(loader.take(&bias_name)?)
        } else {
            loader.take_optional(&bias_name)
        };
        Self::new(weight, bias, transposed)
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Whether the weight is stored `[in, out]`.
    pub fn is_transposed(&self) -> bool {
        self.transposed
    }

    /// Project `x` (`[tokens, in]`) into `out` (`[tokens, out]`).
    pub fn forward(&self, backend: &Backend, x: &[f32], out: &mut [f32]) -> Result<()> {
        if x.len() % self.in_features != 0 || out.len() != x.len() / self.in_features * self.out_features {
            return Err(EmberError::ShapeMismatch(format!(
                "linear {}→{} over {} inputs into {} outputs",
                self.in_features,
                self.out_features,
                x.len(),
                out.len()
            )));
        }
        let tokens = x.len() / self.in_features;
        if tokens == 0 {
            return Ok(());
        }
        let a = TensorView::wrap_f32(&[tokens, self.in_features], x)?;
        let mut c = TensorViewMut::wrap_f32_mut(&[tokens, self.out_features], out)?;
        let trans_b = if self.transposed { Transpose::No } else { Transpose::Yes };
        backend.gemm(&a, &self.weight.view(), &mut c, Transpose::No, trans_b);
        if let Some(bias) = &self.bias {
            for row in out.chunks_exact_mut(self.out_features) {
                for (y, b) in row.iter_mut().zip(bias) {
                    *y += b;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;

    fn weight() -> Vec<f32> {
        // [out = 3, in = 2]
        vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]
    }

    #[test]
    fn projects_rows() {
        let w = Tensor::from_f32(&[3, 2], weight()).unwrap();
        let b = Tensor::from_f32(&[3], vec![0.5, 0.0, -1.0]).unwrap();
        let linear = Linear::new(w, Some(b), false).unwrap();
        assert_eq!((linear.in_features(), linear.out_features()), (2, 3));

        let mut out = vec![0.0; 6];
        linear.forward(&Backend::scalar(), &[1.0, 2.0, 3.0, 4.0], &mut out).unwrap();
        assert_eq!(out, vec![1.5, 2.0, 2.0, 3.5, 4.0, 6.0]);
    }

    #[test]
    fn transposed_half_weight_matches() {
        // same matrix stored [in, out] in f16
        let wt = Tensor::from_f32_as(DType::F16, &[2, 3], &[1.0, 0.0, 1.0, 0.0, 1.0, 1.0]).unwrap();
        let linear = Linear::new(wt, None, true).unwrap();
        assert_eq!((linear.in_features(), linear.out_features()), (2, 3));

        let mut out = vec![0.0; 3];
        linear.forward(&Backend::scalar(), &[1.0, 2.0], &mut out).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn shape_errors_leave_output() {
        let w = Tensor::from_f32(&[3, 2], weight()).unwrap();
        let linear = Linear::new(w, None, false).unwrap();
        let mut out = vec![7.0; 4];
        assert!(linear.forward(&Backend::scalar(), &[1.0, 2.0], &mut out).is_err());
        assert_eq!(out, vec![7.0; 4]);

        let w = Tensor::from_f32(&[3, 2], weight()).unwrap();
        let b = Tensor::from_f32(&[2], vec![0.0, 0.0]).unwrap();
        assert!(Linear::new(w, Some(b), false).is_err());
    }
}
