//! Element types.

use std::fmt;

/// Element type of a tensor.
///
/// Only the floating types are executable; `I8` and `I4` exist so weight
/// files and layouts can describe them, but no kernel accepts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// IEEE 754 binary32.
    F32,
    /// IEEE 754 binary16.
    F16,
    /// bfloat16 (upper half of a binary32).
    BF16,
    /// Signed 8-bit integer (reserved).
    I8,
    /// Signed 4-bit integer, two per byte (reserved).
    I4,
}

impl DType {
    /// Size of one element in bits.
    pub const fn size_in_bits(self) -> usize {
        match self {
            DType::F32 => 32,
            DType::F16 | DType::BF16 => 16,
            DType::I8 => 8,
            DType::I4 => 4,
        }
    }

    /// Whether this is a floating-point type.
    pub const fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Whether kernels can execute on this type.
    pub const fn is_executable(self) -> bool {
        self.is_float()
    }

    /// Bytes needed to store `numel` elements.
    pub const fn storage_bytes(self, numel: usize) -> usize {
        (numel * self.size_in_bits() + 7) / 8
    }

    /// Parse the `torch_dtype` spelling used by model configs.
    pub fn from_torch_name(name: &str) -> Option<Self> {
        match name {
            "float32" | "float" => Some(DType::F32),
            "float16" | "half" => Some(DType::F16),
            "bfloat16" => Some(DType::BF16),
            "int8" => Some(DType::I8),
            _ => None,
        }
    }

    /// Short lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I8 => "i8",
            DType::I4 => "i4",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" => Ok(DType::F32),
            "f16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            "i8" => Ok(DType::I8),
            "i4" => Ok(DType::I4),
            other => DType::from_torch_name(other).ok_or_else(|| format!("unknown dtype: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_rounds_up_nibbles() {
        assert_eq!(DType::I4.storage_bytes(3), 2);
        assert_eq!(DType::F16.storage_bytes(3), 6);
        assert_eq!(DType::F32.storage_bytes(0), 0);
    }

    #[test]
    fn only_floats_execute() {
        assert!(DType::BF16.is_executable());
        assert!(!DType::I8.is_executable());
        assert!(!DType::I4.is_executable());
    }

    #[test]
    fn parse_names() {
        assert_eq!("bfloat16".parse::<DType>().unwrap(), DType::BF16);
        assert_eq!("F16".parse::<DType>().unwrap(), DType::F16);
        assert!("q4_k".parse::<DType>().is_err());
    }
}
