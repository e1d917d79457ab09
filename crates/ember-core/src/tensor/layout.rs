//! Shape and stride bookkeeping.

use super::DType;
use crate::error::{EmberError, Result};

/// Maximum number of dimensions a tensor may have.
pub const MAX_DIMS: usize = 8;

/// Element type, extents and strides (in elements) of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    dtype: DType,
    dims: Vec<usize>,
    strides: Vec<usize>,
}

/// Row-major strides for `dims`.
pub fn canonical_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

impl Layout {
    /// Contiguous row-major layout.
    ///
    /// Fails when the dimension count is outside `[1, 8]`, an extent is
    /// zero, or the element count overflows.
    pub fn contiguous(dtype: DType, dims: &[usize]) -> Result<Self> {
        let strides = canonical_strides(dims);
        Self::strided(dtype, dims, &strides)
    }

    /// Layout with explicit strides.
    pub fn strided(dtype: DType, dims: &[usize], strides: &[usize]) -> Result<Self> {
        if dims.is_empty() || dims.len() > MAX_DIMS {
            return Err(EmberError::InvalidShape(format!(
                "{} dimensions, expected 1..={}",
                dims.len(),
                MAX_DIMS
            )));
        }
        if strides.len() != dims.len() {
            return Err(EmberError::InvalidShape(format!(
                "{} strides for {} dimensions",
                strides.len(),
                dims.len()
            )));
        }
        if dims.contains(&0) {
            return Err(EmberError::InvalidShape(format!(
                "zero-sized extent in {:?}",
                dims
            )));
        }
        let numel = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| EmberError::InvalidShape(format!("{:?} overflows usize", dims)))?;
        numel
            .checked_mul(dtype.size_in_bits())
            .ok_or_else(|| EmberError::InvalidShape(format!("{:?} overflows usize", dims)))?;
        Ok(Self {
            dtype,
            dims: dims.to_vec(),
            strides: strides.to_vec(),
        })
    }

    /// Layout of a tensor with no storage.
    pub(crate) fn empty() -> Self {
        Self {
            dtype: DType::F32,
            dims: Vec::new(),
            strides: Vec::new(),
        }
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Extents.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Strides in elements.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total element count (zero for an empty tensor).
    pub fn numel(&self) -> usize {
        if self.dims.is_empty() {
            0
        } else {
            self.dims.iter().product()
        }
    }

    /// Bytes covered by the elements, rounded up for sub-byte types.
    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel())
    }

    /// Extent of dimension `index`; negative indices count from the end.
    pub fn dim(&self, index: isize) -> Option<usize> {
        self.resolve(index).map(|i| self.dims[i])
    }

    /// Whether strides equal the row-major strides of the shape.
    pub fn is_contiguous(&self) -> bool {
        self.strides == canonical_strides(&self.dims)
    }

    /// Number of storage elements reachable from the origin.
    pub fn span(&self) -> usize {
        if self.dims.is_empty() {
            return 0;
        }
        1 + self
            .dims
            .iter()
            .zip(&self.strides)
            .map(|(&d, &s)| (d - 1) * s)
            .sum::<usize>()
    }

    pub(crate) fn resolve(&self, index: isize) -> Option<usize> {
        let n = self.dims.len() as isize;
        let i = if index < 0 { n + index } else { index };
        (0..n).contains(&i).then_some(i as usize)
    }

    /// Storage offset of the element at row-major position `linear`.
    pub(crate) fn offset_of(&self, mut linear: usize) -> usize {
        let mut offset = 0;
        for (&d, &s) in self.dims.iter().zip(&self.strides).rev() {
            offset += (linear % d) * s;
            linear /= d;
        }
        offset
    }

    pub(crate) fn with_dims(&self, dims: &[usize]) -> Result<Self> {
        Self::contiguous(self.dtype, dims)
    }

    pub(crate) fn transposed(&self, a: isize, b: isize) -> Result<Self> {
        let (i, j) = match (self.resolve(a), self.resolve(b)) {
            (Some(i), Some(j)) => (i, j),
            _ => {
                return Err(EmberError::InvalidShape(format!(
                    "transpose({}, {}) on {} dimensions",
                    a,
                    b,
                    self.ndim()
                )))
            }
        };
        let mut out = self.clone();
        out.dims.swap(i, j);
        out.strides.swap(i, j);
        Ok(out)
    }

    pub(crate) fn narrowed(&self, len: usize) -> Self {
        let mut out = self.clone();
        out.dims[0] = len;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_rank() {
        assert!(Layout::contiguous(DType::F32, &[]).is_err());
        assert!(Layout::contiguous(DType::F32, &[1; 9]).is_err());
        assert!(Layout::contiguous(DType::F32, &[1; 8]).is_ok());
        assert!(Layout::contiguous(DType::F32, &[4, 0]).is_err());
    }

    #[test]
    fn canonical_strides_row_major() {
        assert_eq!(canonical_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(canonical_strides(&[5]), vec![1]);
    }

    #[test]
    fn negative_dim_index() {
        let l = Layout::contiguous(DType::F16, &[2, 3, 4]).unwrap();
        assert_eq!(l.dim(-1), Some(4));
        assert_eq!(l.dim(-3), Some(2));
        assert_eq!(l.dim(-4), None);
        assert_eq!(l.dim(3), None);
        assert_eq!(l.nbytes(), 48);
    }

    #[test]
    fn transposed_is_strided() {
        let l = Layout::contiguous(DType::F32, &[2, 3]).unwrap();
        let t = l.transposed(0, 1).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert!(!t.is_contiguous());
        assert_eq!(t.span(), 6);
        // Row-major position 1 of the transpose is element (0, 1) -> storage (1, 0).
        assert_eq!(t.offset_of(1), 3);
    }
}
