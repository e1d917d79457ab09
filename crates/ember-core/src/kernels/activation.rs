//! Scalar activation functions and the `hidden_act` mapping.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// `sqrt(2 / pi)`, the GELU-tanh input scale.
pub const GELU_TANH_SCALE: f32 = 0.797_884_6;
/// Cubic coefficient of the GELU-tanh approximation.
pub const GELU_TANH_CUBIC: f32 = 0.044_715;
/// Sigmoid slope of the quick GELU.
pub const GELU_QUICK_SLOPE: f32 = 1.702;

/// Logistic sigmoid.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `x * sigmoid(x)`.
#[inline]
pub fn silu(x: f32) -> f32 {
    x * sigmoid(x)
}

/// Error function (Abramowitz and Stegun 7.1.26, max error 1.5e-7).
pub fn erf(x: f32) -> f32 {
    const A1: f32 = 0.254_829_6;
    const A2: f32 = -0.284_496_74;
    const A3: f32 = 1.421_413_8;
    const A4: f32 = -1.453_152_1;
    const A5: f32 = 1.061_405_4;
    const P: f32 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

/// erf-based GELU.
#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

/// tanh-approximated GELU.
#[inline]
pub fn gelu_tanh(x: f32) -> f32 {
    let inner = GELU_TANH_SCALE * (x + GELU_TANH_CUBIC * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

/// `x * sigmoid(1.702 x)`.
#[inline]
pub fn gelu_quick(x: f32) -> f32 {
    x * sigmoid(GELU_QUICK_SLOPE * x)
}

/// `max(x, 0)`.
#[inline]
pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// Feed-forward activation named by a model's `hidden_act`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    /// SiLU / swish.
    #[default]
    Silu,
    /// erf GELU.
    Gelu,
    /// tanh GELU (`gelu_new`, `gelu_pytorch_tanh`).
    GeluTanh,
    /// Sigmoid-approximated GELU.
    GeluQuick,
    /// ReLU.
    Relu,
    /// Unrecognized name; executes as SiLU.
    Unknown,
}

impl Activation {
    /// Map a Hugging Face `hidden_act` string.
    pub fn from_hf_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "silu" | "swish" | "swiglu" => Activation::Silu,
            "gelu" | "gelu_python" => Activation::Gelu,
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" | "gelu_tanh" => Activation::GeluTanh,
            "quick_gelu" | "gelu_quick" => Activation::GeluQuick,
            "relu" => Activation::Relu,
            _ => Activation::Unknown,
        }
    }

    /// Canonical name.
    pub fn name(self) -> &'static str {
        match self {
            Activation::Silu => "silu",
            Activation::Gelu => "gelu",
            Activation::GeluTanh => "gelu_tanh",
            Activation::GeluQuick => "gelu_quick",
            Activation::Relu => "relu",
            Activation::Unknown => "unknown",
        }
    }

    /// The function actually executed.
    pub fn resolved(self) -> Self {
        match self {
            Activation::Unknown => Activation::Silu,
            other => other,
        }
    }

    /// Apply element-wise with the scalar functions.
    pub fn apply(self, x: &mut [f32]) {
        let f: fn(f32) -> f32 = match self.resolved() {
            Activation::Gelu => gelu,
            Activation::GeluTanh => gelu_tanh,
            Activation::GeluQuick => gelu_quick,
            Activation::Relu => relu,
            _ => silu,
        };
        for v in x {
            *v = f(*v);
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Activation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Activation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Activation::from_hf_name(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silu_known_values() {
        assert_eq!(silu(0.0), 0.0);
        assert!((silu(1.0) - 0.731_058_6).abs() < 1e-6);
        assert!((silu(-1.0) + 0.268_941_4).abs() < 1e-6);
        assert!(silu(-100.0).abs() < 1e-30);
    }

    #[test]
    fn erf_matches_reference_points() {
        assert!(erf(0.0).abs() < 1e-6);
        assert!((erf(0.5) - 0.520_499_9).abs() < 1e-6);
        assert!((erf(1.0) - 0.842_700_8).abs() < 1e-6);
        assert!((erf(-1.0) + 0.842_700_8).abs() < 1e-6);
        assert!((erf(4.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gelu_variants_agree_roughly() {
        for i in -40..=40 {
            let x = i as f32 * 0.1;
            assert!((gelu(x) - gelu_tanh(x)).abs() < 1e-3, "x = {}", x);
            assert!((gelu(x) - gelu_quick(x)).abs() < 3e-2, "x = {}", x);
        }
        assert!((gelu(1.0) - 0.841_344_7).abs() < 1e-5);
    }

    #[test]
    fn hidden_act_mapping() {
        assert_eq!(Activation::from_hf_name("silu"), Activation::Silu);
        assert_eq!(Activation::from_hf_name("SiLU"), Activation::Silu);
        assert_eq!(Activation::from_hf_name("gelu_pytorch_tanh"), Activation::GeluTanh);
        assert_eq!(Activation::from_hf_name("quick_gelu"), Activation::GeluQuick);
        assert_eq!(Activation::from_hf_name("relu"), Activation::Relu);
        assert_eq!(Activation::from_hf_name("mish"), Activation::Unknown);
        assert_eq!(Activation::Unknown.resolved(), Activation::Silu);
    }

    #[test]
    fn unknown_applies_silu() {
        let mut a = vec![-2.0, 0.5, 3.0];
        let mut b = a.clone();
        Activation::Unknown.apply(&mut a);
        Activation::Silu.apply(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn deserializes_from_string() {
        let act: Activation = serde_json::from_str("\"gelu_new\"").unwrap();
        assert_eq!(act, Activation::GeluTanh);
        let act: Activation = serde_json::from_str("\"whatever\"").unwrap();
        assert_eq!(act, Activation::Unknown);
        assert_eq!(serde_json::to_string(&Activation::Relu).unwrap(), "\"relu\"");
    }
}
