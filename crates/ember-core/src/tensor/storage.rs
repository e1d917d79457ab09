//! Typed element storage.

use super::convert::{bf16_to_f32, f16_to_f32, f32_to_bf16, f32_to_f16};
use super::DType;
use crate::error::{try_alloc, Result};

/// Owned element buffer. The variant is the storage class; `F16` and `BF16`
/// share `Half` and are told apart by the layout's dtype.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Buffer {
    F32(Vec<f32>),
    Half(Vec<u16>),
    I8(Vec<i8>),
    Packed4(Vec<u8>),
}

impl Buffer {
    pub(crate) fn zeroed(dtype: DType, numel: usize) -> Result<Self> {
        Ok(match dtype {
            DType::F32 => Buffer::F32(try_alloc(numel, 0.0, "tensor")?),
            DType::F16 | DType::BF16 => Buffer::Half(try_alloc(numel, 0, "tensor")?),
            DType::I8 => Buffer::I8(try_alloc(numel, 0, "tensor")?),
            DType::I4 => Buffer::Packed4(try_alloc(numel.div_ceil(2), 0, "tensor")?),
        })
    }

    pub(crate) fn elements(&self) -> Elements<'_> {
        match self {
            Buffer::F32(v) => Elements::F32(v),
            Buffer::Half(v) => Elements::Half(v),
            Buffer::I8(v) => Elements::I8(v),
            Buffer::Packed4(v) => Elements::Packed4(v),
        }
    }

    pub(crate) fn elements_mut(&mut self) -> ElementsMut<'_> {
        match self {
            Buffer::F32(v) => ElementsMut::F32(v),
            Buffer::Half(v) => ElementsMut::Half(v),
            Buffer::I8(v) => ElementsMut::I8(v),
            Buffer::Packed4(v) => ElementsMut::Packed4(v),
        }
    }
}

/// Borrowed element storage.
#[derive(Debug, Clone, Copy)]
pub enum Elements<'a> {
    /// f32 values.
    F32(&'a [f32]),
    /// f16 or bf16 bit patterns.
    Half(&'a [u16]),
    /// int8 values.
    I8(&'a [i8]),
    /// Two int4 values per byte, low nibble first.
    Packed4(&'a [u8]),
}

/// Mutably borrowed element storage.
#[derive(Debug)]
pub enum ElementsMut<'a> {
    /// f32 values.
    F32(&'a mut [f32]),
    /// f16 or bf16 bit patterns.
    Half(&'a mut [u16]),
    /// int8 values.
    I8(&'a mut [i8]),
    /// Two int4 values per byte, low nibble first.
    Packed4(&'a mut [u8]),
}

impl<'a> Elements<'a> {
    /// Number of addressable elements.
    pub fn len(&self) -> usize {
        match self {
            Elements::F32(s) => s.len(),
            Elements::Half(s) => s.len(),
            Elements::I8(s) => s.len(),
            Elements::Packed4(s) => s.len() * 2,
        }
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this storage class can hold `dtype`.
    pub(crate) fn holds(&self, dtype: DType) -> bool {
        match self {
            Elements::F32(_) => dtype == DType::F32,
            Elements::Half(_) => matches!(dtype, DType::F16 | DType::BF16),
            Elements::I8(_) => dtype == DType::I8,
            Elements::Packed4(_) => dtype == DType::I4,
        }
    }

    /// Storage starting `offset` elements in. For packed int4 the offset
    /// must be even.
    pub(crate) fn offset(self, offset: usize) -> Self {
        match self {
            Elements::F32(s) => Elements::F32(&s[offset..]),
            Elements::Half(s) => Elements::Half(&s[offset..]),
            Elements::I8(s) => Elements::I8(&s[offset..]),
            Elements::Packed4(s) => Elements::Packed4(&s[offset / 2..]),
        }
    }

    /// Element `i` converted to f32.
    #[inline]
    pub(crate) fn get_f32(&self, dtype: DType, i: usize) -> f32 {
        match self {
            Elements::F32(s) => s[i],
            Elements::Half(s) if dtype == DType::F16 => f16_to_f32(s[i]),
            Elements::Half(s) => bf16_to_f32(s[i]),
            Elements::I8(s) => s[i] as f32,
            Elements::Packed4(s) => unpack_nibble(s[i / 2], i % 2) as f32,
        }
    }
}

impl<'a> ElementsMut<'a> {
    /// Number of addressable elements.
    pub fn len(&self) -> usize {
        self.as_ref().len()
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only reborrow.
    pub fn as_ref(&self) -> Elements<'_> {
        match self {
            ElementsMut::F32(s) => Elements::F32(s),
            ElementsMut::Half(s) => Elements::Half(s),
            ElementsMut::I8(s) => Elements::I8(s),
            ElementsMut::Packed4(s) => Elements::Packed4(s),
        }
    }

    /// Mutable reborrow.
    pub(crate) fn reborrow(&mut self) -> ElementsMut<'_> {
        match self {
            ElementsMut::F32(s) => ElementsMut::F32(s),
            ElementsMut::Half(s) => ElementsMut::Half(s),
            ElementsMut::I8(s) => ElementsMut::I8(s),
            ElementsMut::Packed4(s) => ElementsMut::Packed4(s),
        }
    }

    pub(crate) fn offset(self, offset: usize) -> Self {
        match self {
            ElementsMut::F32(s) => ElementsMut::F32(&mut s[offset..]),
            ElementsMut::Half(s) => ElementsMut::Half(&mut s[offset..]),
            ElementsMut::I8(s) => ElementsMut::I8(&mut s[offset..]),
            ElementsMut::Packed4(s) => ElementsMut::Packed4(&mut s[offset / 2..]),
        }
    }

    /// Store `value` converted into `dtype` at element `i`.
    #[inline]
    pub(crate) fn set_f32(&mut self, dtype: DType, i: usize, value: f32) {
        match self {
            ElementsMut::F32(s) => s[i] = value,
            ElementsMut::Half(s) if dtype == DType::F16 => s[i] = f32_to_f16(value),
            ElementsMut::Half(s) => s[i] = f32_to_bf16(value),
            ElementsMut::I8(s) => s[i] = value.round().clamp(-128.0, 127.0) as i8,
            ElementsMut::Packed4(s) => {
                let nibble = value.round().clamp(-8.0, 7.0) as i8;
                s[i / 2] = pack_nibble(s[i / 2], i % 2, nibble);
            }
        }
    }
}

fn unpack_nibble(byte: u8, which: usize) -> i8 {
    let raw = if which == 0 { byte & 0x0f } else { byte >> 4 };
    ((raw << 4) as i8) >> 4
}

fn pack_nibble(byte: u8, which: usize, value: i8) -> u8 {
    let raw = (value as u8) & 0x0f;
    if which == 0 {
        (byte & 0xf0) | raw
    } else {
        (byte & 0x0f) | (raw << 4)
    }
}
