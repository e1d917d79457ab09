//! Tensors: owned storage and borrowed views over one layout type.
//!
//! Three types carry data:
//! - [`Tensor`] owns its storage (or holds none after [`Tensor::release`])
//! - [`TensorView`] borrows storage read-only
//! - [`TensorViewMut`] borrows storage mutably
//!
//! All three implement [`TensorMeta`]. Storage is typed, so accessors such
//! as [`Tensor::as_f32`] check the element type before handing out a slice.
//! Copies and casts between element types convert values numerically.

pub mod convert;
mod dtype;
mod layout;
mod storage;

pub use dtype::DType;
pub use layout::{canonical_strides, Layout, MAX_DIMS};
pub use storage::{Elements, ElementsMut};

use crate::error::{EmberError, Result};
use convert::{
    bf16_slice_to_f16, bf16_slice_to_f32, f16_slice_to_bf16, f16_slice_to_f32, f32_slice_to_bf16,
    f32_slice_to_f16, f32_to_bf16, f32_to_f16,
};
use storage::Buffer;
use tracing::debug;

/// Read-only shape interface shared by tensors and views.
pub trait TensorMeta {
    /// Layout of the data.
    fn layout(&self) -> &Layout;

    /// Element type.
    fn dtype(&self) -> DType {
        self.layout().dtype()
    }

    /// Extents.
    fn dims(&self) -> &[usize] {
        self.layout().dims()
    }

    /// Strides in elements.
    fn strides(&self) -> &[usize] {
        self.layout().strides()
    }

    /// Number of dimensions.
    fn ndim(&self) -> usize {
        self.layout().ndim()
    }

    /// Total element count.
    fn numel(&self) -> usize {
        self.layout().numel()
    }

    /// Total byte size.
    fn nbytes(&self) -> usize {
        self.layout().nbytes()
    }

    /// Extent of dimension `index`; negative indices count from the end.
    fn dim(&self, index: isize) -> Option<usize> {
        self.layout().dim(index)
    }

    /// Whether the data is row-major contiguous.
    fn is_contiguous(&self) -> bool {
        self.layout().is_contiguous()
    }

    /// Whether `other` has the same extents.
    fn same_shape<T: TensorMeta + ?Sized>(&self, other: &T) -> bool {
        self.dims() == other.dims()
    }
}

fn storage_dtype(data: &Elements<'_>) -> DType {
    match data {
        Elements::F32(_) => DType::F32,
        Elements::Half(_) => DType::F16,
        Elements::I8(_) => DType::I8,
        Elements::Packed4(_) => DType::I4,
    }
}

fn check_storage(layout: &Layout, data: &Elements<'_>) -> Result<()> {
    if !data.holds(layout.dtype()) {
        return Err(EmberError::DTypeMismatch {
            expected: layout.dtype(),
            actual: storage_dtype(data),
        });
    }
    if data.len() < layout.span() {
        return Err(EmberError::InvalidShape(format!(
            "storage of {} elements is shorter than layout {:?} (span {})",
            data.len(),
            layout.dims(),
            layout.span()
        )));
    }
    Ok(())
}

fn half_encoder(dtype: DType) -> fn(f32) -> u16 {
    if dtype == DType::F16 {
        f32_to_f16
    } else {
        f32_to_bf16
    }
}

/// An owned tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    layout: Layout,
    buffer: Option<Buffer>,
}

impl Tensor {
    /// Allocate a zero-filled contiguous tensor.
    pub fn zeros(dtype: DType, dims: &[usize]) -> Result<Self> {
        let layout = Layout::contiguous(dtype, dims)?;
        let buffer = Buffer::zeroed(dtype, layout.numel())?;
        Ok(Self {
            layout,
            buffer: Some(buffer),
        })
    }

    /// Take ownership of f32 data laid out row-major.
    pub fn from_f32(dims: &[usize], data: Vec<f32>) -> Result<Self> {
        let layout = Layout::contiguous(DType::F32, dims)?;
        if data.len() != layout.numel() {
            return Err(EmberError::ShapeMismatch(format!(
                "{} values for shape {:?}",
                data.len(),
                dims
            )));
        }
        Ok(Self {
            layout,
            buffer: Some(Buffer::F32(data)),
        })
    }

    /// Take ownership of f16 or bf16 bit patterns laid out row-major.
    pub fn from_bits16(dtype: DType, dims: &[usize], data: Vec<u16>) -> Result<Self> {
        if !matches!(dtype, DType::F16 | DType::BF16) {
            return Err(EmberError::UnsupportedDType(dtype));
        }
        let layout = Layout::contiguous(dtype, dims)?;
        if data.len() != layout.numel() {
            return Err(EmberError::ShapeMismatch(format!(
                "{} values for shape {:?}",
                data.len(),
                dims
            )));
        }
        Ok(Self {
            layout,
            buffer: Some(Buffer::Half(data)),
        })
    }

    /// Allocate a tensor of `dtype` holding `data` converted from f32.
    pub fn from_f32_as(dtype: DType, dims: &[usize], data: &[f32]) -> Result<Self> {
        let src = TensorView::wrap_f32(dims, data)?;
        let mut out = Self::zeros(dtype, dims)?;
        out.copy_from(&src)?;
        Ok(out)
    }

    /// A tensor without storage.
    pub fn empty() -> Self {
        Self {
            layout: Layout::empty(),
            buffer: None,
        }
    }

    /// Re-initialize in place with fresh zeroed storage.
    ///
    /// On error `self` is left untouched.
    pub fn init(&mut self, dtype: DType, dims: &[usize]) -> Result<()> {
        *self = Self::zeros(dtype, dims)?;
        Ok(())
    }

    /// Drop the storage, leaving an empty tensor.
    pub fn release(&mut self) {
        self.buffer = None;
        self.layout = Layout::empty();
    }

    /// Whether storage is held.
    pub fn is_owned(&self) -> bool {
        self.buffer.is_some()
    }

    /// Borrow as a read-only view.
    pub fn view(&self) -> TensorView<'_> {
        match &self.buffer {
            Some(buffer) => TensorView {
                layout: self.layout.clone(),
                data: buffer.elements(),
            },
            None => TensorView {
                layout: Layout::empty(),
                data: Elements::F32(&[]),
            },
        }
    }

    /// Borrow as a mutable view.
    pub fn view_mut(&mut self) -> TensorViewMut<'_> {
        match &mut self.buffer {
            Some(buffer) => TensorViewMut {
                layout: self.layout.clone(),
                data: buffer.elements_mut(),
            },
            None => TensorViewMut {
                layout: Layout::empty(),
                data: ElementsMut::F32(&mut []),
            },
        }
    }

    /// The f32 storage, if this is an f32 tensor.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.buffer {
            Some(Buffer::F32(v)) => Some(v),
            _ => None,
        }
    }

    /// The f32 storage, mutably.
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.buffer {
            Some(Buffer::F32(v)) => Some(v),
            _ => None,
        }
    }

    /// The f16/bf16 bit patterns, if this is a 16-bit float tensor.
    pub fn as_bits16(&self) -> Option<&[u16]> {
        match &self.buffer {
            Some(Buffer::Half(v)) => Some(v),
            _ => None,
        }
    }

    /// All elements converted to f32 in row-major order.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.view().to_f32_vec()
    }

    /// Set every element to zero. No-op without storage.
    pub fn zero(&mut self) {
        self.view_mut().zero();
    }

    /// Set every element to `value` converted into the element type.
    pub fn fill(&mut self, value: f32) {
        self.view_mut().fill(value);
    }

    /// Copy `src` into this tensor, converting element types.
    pub fn copy_from(&mut self, src: &TensorView<'_>) -> Result<()> {
        self.view_mut().copy_from(src)
    }

    /// View as `dtype`: a borrow if the type already matches, otherwise a
    /// converted copy.
    pub fn cast(&self, dtype: DType) -> Result<Cast<'_>> {
        self.view().cast(dtype)
    }

    /// Reshape view; requires contiguous data and an equal element count.
    pub fn reshape(&self, dims: &[usize]) -> Result<TensorView<'_>> {
        self.view().reshape(dims)
    }

    /// Reshape in place, keeping storage.
    pub fn into_reshaped(mut self, dims: &[usize]) -> Result<Self> {
        let layout = self.view().reshape(dims)?.layout;
        self.layout = layout;
        Ok(self)
    }

    /// View with two dimensions swapped.
    pub fn transpose(&self, a: isize, b: isize) -> Result<TensorView<'_>> {
        self.view().transpose(a, b)
    }

    /// Contiguous view of shape `dims` starting `offset` bytes into storage.
    pub fn byte_offset(&self, offset: usize, dims: &[usize]) -> Result<TensorView<'_>> {
        self.view().byte_offset(offset, dims)
    }

    /// View of `len` entries of the first dimension starting at `start`.
    pub fn narrow(&self, start: usize, len: usize) -> Result<TensorView<'_>> {
        self.view().narrow(start, len)
    }
}

impl Default for Tensor {
    fn default() -> Self {
        Self::empty()
    }
}

impl TensorMeta for Tensor {
    fn layout(&self) -> &Layout {
        &self.layout
    }
}

/// A read-only view over borrowed storage.
#[derive(Debug, Clone)]
pub struct TensorView<'a> {
    layout: Layout,
    data: Elements<'a>,
}

impl<'a> TensorView<'a> {
    /// View `data` through `layout`.
    pub fn new(layout: Layout, data: Elements<'a>) -> Result<Self> {
        check_storage(&layout, &data)?;
        Ok(Self { layout, data })
    }

    /// Wrap caller-owned f32 data as a contiguous view.
    pub fn wrap_f32(dims: &[usize], data: &'a [f32]) -> Result<Self> {
        Self::new(Layout::contiguous(DType::F32, dims)?, Elements::F32(data))
    }

    /// Wrap caller-owned f16/bf16 bit patterns as a contiguous view.
    pub fn wrap_bits16(dtype: DType, dims: &[usize], data: &'a [u16]) -> Result<Self> {
        Self::new(Layout::contiguous(dtype, dims)?, Elements::Half(data))
    }

    /// Underlying storage, starting at the view origin.
    pub fn elements(&self) -> Elements<'a> {
        self.data
    }

    /// f32 storage covering the view's span.
    pub fn as_f32(&self) -> Option<&'a [f32]> {
        match self.data {
            Elements::F32(s) => Some(&s[..self.layout.span()]),
            _ => None,
        }
    }

    /// 16-bit storage covering the view's span.
    pub fn as_bits16(&self) -> Option<&'a [u16]> {
        match self.data {
            Elements::Half(s) => Some(&s[..self.layout.span()]),
            _ => None,
        }
    }

    /// Reshape view; requires contiguous data and an equal element count.
    pub fn reshape(&self, dims: &[usize]) -> Result<TensorView<'a>> {
        if !self.layout.is_contiguous() {
            return Err(EmberError::InvalidShape(format!(
                "reshape of non-contiguous {:?}",
                self.layout.dims()
            )));
        }
        let layout = self.layout.with_dims(dims)?;
        if layout.numel() != self.layout.numel() {
            return Err(EmberError::ShapeMismatch(format!(
                "cannot reshape {:?} into {:?}",
                self.layout.dims(),
                dims
            )));
        }
        Ok(Self {
            layout,
            data: self.data,
        })
    }

    /// View with two dimensions swapped.
    pub fn transpose(&self, a: isize, b: isize) -> Result<TensorView<'a>> {
        Ok(Self {
            layout: self.layout.transposed(a, b)?,
            data: self.data,
        })
    }

    /// Contiguous view of shape `dims` starting `offset` bytes into storage.
    pub fn byte_offset(&self, offset: usize, dims: &[usize]) -> Result<TensorView<'a>> {
        let bits = self.layout.dtype().size_in_bits();
        if (offset * 8) % bits != 0 {
            return Err(EmberError::InvalidShape(format!(
                "byte offset {} is not aligned to {}",
                offset,
                self.layout.dtype()
            )));
        }
        let start = offset * 8 / bits;
        let layout = self.layout.with_dims(dims)?;
        if start + layout.span() > self.data.len() {
            return Err(EmberError::InvalidShape(format!(
                "view {:?} at byte {} exceeds storage",
                dims, offset
            )));
        }
        Ok(Self {
            layout,
            data: self.data.offset(start),
        })
    }

    /// View of `len` entries of the first dimension starting at `start`.
    pub fn narrow(&self, start: usize, len: usize) -> Result<TensorView<'a>> {
        let offset = narrow_offset(&self.layout, start, len)?;
        Ok(Self {
            layout: self.layout.narrowed(len),
            data: self.data.offset(offset),
        })
    }

    /// View as `dtype`: a borrow if the type already matches, otherwise a
    /// converted copy.
    pub fn cast(&self, dtype: DType) -> Result<Cast<'a>> {
        if dtype == self.layout.dtype() {
            return Ok(Cast::View(self.clone()));
        }
        let mut out = Tensor::zeros(dtype, self.layout.dims())?;
        out.copy_from(self)?;
        Ok(Cast::Owned(out))
    }

    /// All elements converted to f32 in row-major order.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let numel = self.layout.numel();
        if self.layout.is_contiguous() {
            let mut out = vec![0.0; numel];
            self.read_f32(0, &mut out);
            return out;
        }
        let dtype = self.layout.dtype();
        (0..numel)
            .map(|i| self.data.get_f32(dtype, self.layout.offset_of(i)))
            .collect()
    }

    /// Read `out.len()` consecutive storage elements starting at `offset`
    /// as f32.
    pub(crate) fn read_f32(&self, offset: usize, out: &mut [f32]) {
        let end = offset + out.len();
        match (self.data, self.layout.dtype()) {
            (Elements::F32(s), _) => out.copy_from_slice(&s[offset..end]),
            (Elements::Half(s), DType::F16) => f16_slice_to_f32(&s[offset..end], out),
            (Elements::Half(s), _) => bf16_slice_to_f32(&s[offset..end], out),
            (data, dtype) => {
                for (i, o) in out.iter_mut().enumerate() {
                    *o = data.get_f32(dtype, offset + i);
                }
            }
        }
    }

    /// Single storage element as f32.
    #[inline]
    pub(crate) fn get_f32(&self, offset: usize) -> f32 {
        self.data.get_f32(self.layout.dtype(), offset)
    }
}

impl TensorMeta for TensorView<'_> {
    fn layout(&self) -> &Layout {
        &self.layout
    }
}

fn narrow_offset(layout: &Layout, start: usize, len: usize) -> Result<usize> {
    let rows = layout.dim(0).unwrap_or(0);
    if len == 0 || start + len > rows {
        return Err(EmberError::InvalidShape(format!(
            "narrow({}, {}) of {:?}",
            start,
            len,
            layout.dims()
        )));
    }
    let offset = start * layout.strides()[0];
    if layout.dtype() == DType::I4 && offset % 2 == 1 {
        return Err(EmberError::UnsupportedDType(DType::I4));
    }
    Ok(offset)
}

/// A mutable view over borrowed storage.
#[derive(Debug)]
pub struct TensorViewMut<'a> {
    layout: Layout,
    data: ElementsMut<'a>,
}

impl<'a> TensorViewMut<'a> {
    /// View `data` mutably through `layout`.
    pub fn new(layout: Layout, data: ElementsMut<'a>) -> Result<Self> {
        check_storage(&layout, &data.as_ref())?;
        Ok(Self { layout, data })
    }

    /// Wrap caller-owned f32 data as a contiguous mutable view.
    pub fn wrap_f32_mut(dims: &[usize], data: &'a mut [f32]) -> Result<Self> {
        Self::new(Layout::contiguous(DType::F32, dims)?, ElementsMut::F32(data))
    }

    /// Wrap caller-owned f16/bf16 bit patterns as a contiguous mutable view.
    pub fn wrap_bits16_mut(dtype: DType, dims: &[usize], data: &'a mut [u16]) -> Result<Self> {
        Self::new(Layout::contiguous(dtype, dims)?, ElementsMut::Half(data))
    }

    /// Read-only reborrow.
    pub fn as_view(&self) -> TensorView<'_> {
        TensorView {
            layout: self.layout.clone(),
            data: self.data.as_ref(),
        }
    }

    /// Mutable reborrow.
    pub fn reborrow(&mut self) -> TensorViewMut<'_> {
        TensorViewMut {
            layout: self.layout.clone(),
            data: self.data.reborrow(),
        }
    }

    /// f32 storage covering the view's span.
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        let span = self.layout.span();
        match &mut self.data {
            ElementsMut::F32(s) => Some(&mut s[..span]),
            _ => None,
        }
    }

    /// 16-bit storage covering the view's span.
    pub fn as_bits16_mut(&mut self) -> Option<&mut [u16]> {
        let span = self.layout.span();
        match &mut self.data {
            ElementsMut::Half(s) => Some(&mut s[..span]),
            _ => None,
        }
    }

    /// Reshape view; requires contiguous data and an equal element count.
    pub fn reshape(self, dims: &[usize]) -> Result<TensorViewMut<'a>> {
        let layout = self.as_view().reshape(dims)?.layout;
        Ok(Self {
            layout,
            data: self.data,
        })
    }

    /// View of `len` entries of the first dimension starting at `start`.
    pub fn narrow(self, start: usize, len: usize) -> Result<TensorViewMut<'a>> {
        let offset = narrow_offset(&self.layout, start, len)?;
        Ok(Self {
            layout: self.layout.narrowed(len),
            data: self.data.offset(offset),
        })
    }

    /// Set every element to zero. No-op without storage.
    pub fn zero(&mut self) {
        if let (true, ElementsMut::Packed4(s)) = (self.layout.is_contiguous(), &mut self.data) {
            let bytes = self.layout.nbytes();
            s[..bytes].fill(0);
            return;
        }
        self.fill(0.0);
    }

    /// Set every element to `value` converted into the element type.
    /// No-op without storage.
    pub fn fill(&mut self, value: f32) {
        let numel = self.layout.numel();
        if numel == 0 {
            debug!("fill on tensor without storage ignored");
            return;
        }
        let dtype = self.layout.dtype();
        if self.layout.is_contiguous() {
            match &mut self.data {
                ElementsMut::F32(s) => {
                    s[..numel].fill(value);
                    return;
                }
                ElementsMut::Half(s) => {
                    s[..numel].fill(half_encoder(dtype)(value));
                    return;
                }
                _ => {}
            }
        }
        for i in 0..numel {
            let offset = self.layout.offset_of(i);
            self.data.set_f32(dtype, offset, value);
        }
    }

    /// Copy `src` into this view element by element in row-major order,
    /// converting element types. Element counts must match.
    pub fn copy_from(&mut self, src: &TensorView<'_>) -> Result<()> {
        let numel = self.layout.numel();
        if numel != src.numel() {
            return Err(EmberError::ShapeMismatch(format!(
                "copy of {:?} into {:?}",
                src.dims(),
                self.layout.dims()
            )));
        }
        let (dst_dtype, src_dtype) = (self.layout.dtype(), src.dtype());
        if self.layout.is_contiguous()
            && src.is_contiguous()
            && copy_contiguous(&mut self.data, dst_dtype, src.data, src_dtype, numel)
        {
            return Ok(());
        }
        for i in 0..numel {
            let value = src.data.get_f32(src_dtype, src.layout.offset_of(i));
            let offset = self.layout.offset_of(i);
            self.data.set_f32(dst_dtype, offset, value);
        }
        Ok(())
    }

    /// Write `src` converted into the element type at consecutive storage
    /// elements starting at `offset`.
    pub(crate) fn write_f32(&mut self, offset: usize, src: &[f32]) {
        let end = offset + src.len();
        let dtype = self.layout.dtype();
        match &mut self.data {
            ElementsMut::F32(d) => d[offset..end].copy_from_slice(src),
            ElementsMut::Half(d) if dtype == DType::F16 => f32_slice_to_f16(src, &mut d[offset..end]),
            ElementsMut::Half(d) => f32_slice_to_bf16(src, &mut d[offset..end]),
            data => {
                for (i, &v) in src.iter().enumerate() {
                    data.set_f32(dtype, offset + i, v);
                }
            }
        }
    }

    /// Single storage element, converted into the element type.
    #[inline]
    pub(crate) fn set_f32(&mut self, offset: usize, value: f32) {
        self.data.set_f32(self.layout.dtype(), offset, value);
    }
}

fn copy_contiguous(
    dst: &mut ElementsMut<'_>,
    dst_dtype: DType,
    src: Elements<'_>,
    src_dtype: DType,
    n: usize,
) -> bool {
    match (dst, src) {
        (ElementsMut::F32(d), Elements::F32(s)) => d[..n].copy_from_slice(&s[..n]),
        (ElementsMut::Half(d), Elements::Half(s)) if dst_dtype == src_dtype => {
            d[..n].copy_from_slice(&s[..n])
        }
        (ElementsMut::Half(d), Elements::Half(s)) if dst_dtype == DType::F16 => {
            bf16_slice_to_f16(&s[..n], &mut d[..n])
        }
        (ElementsMut::Half(d), Elements::Half(s)) => f16_slice_to_bf16(&s[..n], &mut d[..n]),
        (ElementsMut::Half(d), Elements::F32(s)) if dst_dtype == DType::F16 => {
            f32_slice_to_f16(&s[..n], &mut d[..n])
        }
        (ElementsMut::Half(d), Elements::F32(s)) => f32_slice_to_bf16(&s[..n], &mut d[..n]),
        (ElementsMut::F32(d), Elements::Half(s)) if src_dtype == DType::F16 => {
            f16_slice_to_f32(&s[..n], &mut d[..n])
        }
        (ElementsMut::F32(d), Elements::Half(s)) => bf16_slice_to_f32(&s[..n], &mut d[..n]),
        _ => return false,
    }
    true
}

impl TensorMeta for TensorViewMut<'_> {
    fn layout(&self) -> &Layout {
        &self.layout
    }
}

/// Result of [`Tensor::cast`].
#[derive(Debug)]
pub enum Cast<'a> {
    /// The source already had the requested type.
    View(TensorView<'a>),
    /// A converted copy.
    Owned(Tensor),
}

impl Cast<'_> {
    /// Borrow the result as a view.
    pub fn view(&self) -> TensorView<'_> {
        match self {
            Cast::View(v) => v.clone(),
            Cast::Owned(t) => t.view(),
        }
    }

    /// Whether no conversion was needed.
    pub fn is_view(&self) -> bool {
        matches!(self, Cast::View(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_are_owned_and_zeroed() {
        let t = Tensor::zeros(DType::F16, &[2, 3]).unwrap();
        assert!(t.is_owned());
        assert_eq!(t.numel(), 6);
        assert_eq!(t.nbytes(), 12);
        assert_eq!(t.as_bits16().unwrap(), &[0; 6]);
        assert!(t.is_contiguous());
    }

    #[test]
    fn constructors_reject_bad_shapes() {
        assert!(matches!(
            Tensor::zeros(DType::F32, &[]),
            Err(EmberError::InvalidShape(_))
        ));
        assert!(Tensor::zeros(DType::F32, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).is_err());
        assert!(Tensor::from_f32(&[2, 2], vec![1.0; 3]).is_err());
        assert!(Tensor::from_bits16(DType::F32, &[1], vec![0]).is_err());
    }

    #[test]
    fn wrap_is_non_owning_and_checked() {
        let data = [1.0f32, 2.0, 3.0, 4.0];
        let v = TensorView::wrap_f32(&[2, 2], &data).unwrap();
        assert_eq!(v.as_f32().unwrap(), &data);
        assert!(TensorView::wrap_f32(&[3, 2], &data).is_err());
    }

    #[test]
    fn release_then_fill_is_noop() {
        let mut t = Tensor::from_f32(&[2], vec![1.0, 2.0]).unwrap();
        t.release();
        assert!(!t.is_owned());
        assert_eq!(t.numel(), 0);
        t.fill(3.0);
        t.zero();
        assert!(t.as_f32().is_none());
    }

    #[test]
    fn init_replaces_storage() {
        let mut t = Tensor::empty();
        t.init(DType::BF16, &[4]).unwrap();
        assert_eq!(t.dtype(), DType::BF16);
        assert!(t.init(DType::F32, &[0]).is_err());
        assert_eq!(t.dtype(), DType::BF16);
    }

    #[test]
    fn fill_converts_scalar() {
        let mut t = Tensor::zeros(DType::F16, &[3]).unwrap();
        t.fill(1.0);
        assert_eq!(t.as_bits16().unwrap(), &[0x3c00; 3]);
        let mut b = Tensor::zeros(DType::BF16, &[2]).unwrap();
        b.fill(-2.0);
        assert_eq!(b.to_f32_vec(), vec![-2.0, -2.0]);
        let mut i = Tensor::zeros(DType::I8, &[2]).unwrap();
        i.fill(3.6);
        assert_eq!(i.to_f32_vec(), vec![4.0, 4.0]);
    }

    #[test]
    fn reshape_requires_contiguous() {
        let t = Tensor::from_f32(&[2, 3], (0..6).map(|x| x as f32).collect()).unwrap();
        let r = t.reshape(&[3, 2]).unwrap();
        assert_eq!(r.dims(), &[3, 2]);
        assert!(t.reshape(&[4, 2]).is_err());

        let tr = t.transpose(0, 1).unwrap();
        assert!(!tr.is_contiguous());
        assert!(tr.reshape(&[6]).is_err());
    }

    #[test]
    fn transpose_copy_materializes() {
        let t = Tensor::from_f32(&[2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let mut out = Tensor::zeros(DType::F32, &[3, 2]).unwrap();
        out.copy_from(&t.transpose(-1, -2).unwrap()).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn copy_converts_between_types() {
        let src = Tensor::from_f32(&[4], vec![0.5, -1.25, 3.0, 1e-3]).unwrap();
        let mut half = Tensor::zeros(DType::F16, &[2, 2]).unwrap();
        half.copy_from(&src.view()).unwrap();
        let mut brain = Tensor::zeros(DType::BF16, &[4]).unwrap();
        brain.copy_from(&half.view()).unwrap();
        let back = brain.to_f32_vec();
        assert_eq!(&back[..3], &[0.5, -1.25, 3.0]);
        assert!((back[3] - 1e-3).abs() < 1e-5);
    }

    #[test]
    fn copy_rejects_count_mismatch() {
        let src = Tensor::zeros(DType::F32, &[3]).unwrap();
        let mut dst = Tensor::from_f32(&[4], vec![9.0; 4]).unwrap();
        assert!(dst.copy_from(&src.view()).is_err());
        assert_eq!(dst.as_f32().unwrap(), &[9.0; 4]);
    }

    #[test]
    fn cast_borrows_when_types_match() {
        let t = Tensor::from_f32(&[2], vec![1.0, 2.0]).unwrap();
        assert!(t.cast(DType::F32).unwrap().is_view());
        let c = t.cast(DType::BF16).unwrap();
        assert!(!c.is_view());
        assert_eq!(c.view().dtype(), DType::BF16);
        assert_eq!(c.view().to_f32_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn byte_offset_views_storage() {
        let t = Tensor::from_f32(&[8], (0..8).map(|x| x as f32).collect()).unwrap();
        let v = t.byte_offset(8, &[2, 2]).unwrap();
        assert_eq!(v.to_f32_vec(), vec![2.0, 3.0, 4.0, 5.0]);
        assert!(t.byte_offset(2, &[1]).is_err());
        assert!(t.byte_offset(24, &[3]).is_err());
    }

    #[test]
    fn narrow_rows() {
        let t = Tensor::from_f32(&[3, 2], (0..6).map(|x| x as f32).collect()).unwrap();
        let v = t.narrow(1, 2).unwrap();
        assert_eq!(v.dims(), &[2, 2]);
        assert_eq!(v.to_f32_vec(), vec![2.0, 3.0, 4.0, 5.0]);
        assert!(t.narrow(2, 2).is_err());
    }

    #[test]
    fn meta_queries() {
        let t = Tensor::zeros(DType::F32, &[2, 3, 4]).unwrap();
        let u = Tensor::zeros(DType::F16, &[2, 3, 4]).unwrap();
        assert_eq!(t.dim(-1), Some(4));
        assert_eq!(t.ndim(), 3);
        assert!(t.same_shape(&u));
        assert!(!t.same_shape(&u.reshape(&[6, 4]).unwrap()));
    }

    #[test]
    fn mutable_view_writes_through() {
        let mut data = vec![0.0f32; 6];
        {
            let mut v = TensorViewMut::wrap_f32_mut(&[2, 3], &mut data).unwrap();
            let mut row = v.reborrow().narrow(1, 1).unwrap();
            row.fill(7.0);
        }
        assert_eq!(data, vec![0.0, 0.0, 0.0, 7.0, 7.0, 7.0]);
    }
}
