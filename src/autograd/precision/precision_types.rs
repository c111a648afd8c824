//! Compute precision parameters are cast to under mixed precision.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::conversions::{bf16_to_f32, f32_to_bf16, f32_to_fp16, fp16_to_f32};

/// Floating-point format used for forward and backward compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Full precision; casting is the identity
    #[default]
    Fp32,
    /// IEEE half precision, narrow exponent range
    Fp16,
    /// Brain float: f32 exponent range, 8-bit mantissa
    Bf16,
}

impl Precision {
    /// Bytes per element
    pub fn size_bytes(self) -> usize {
        if self.is_reduced() {
            2
        } else {
            4
        }
    }

    /// Lower-case short name, as used in configs
    pub fn name(self) -> &'static str {
        match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        }
    }

    pub fn is_reduced(self) -> bool {
        self != Self::Fp32
    }

    /// Largest finite magnitude; anything above rounds to infinity
    pub fn max_finite(self) -> f32 {
        match self {
            Self::Fp32 => f32::MAX,
            Self::Fp16 => half::f16::MAX.to_f32(),
            Self::Bf16 => half::bf16::MAX.to_f32(),
        }
    }

    /// Round an f32 to the nearest value representable at this precision
    pub fn round(self, value: f32) -> f32 {
        match self {
            Self::Fp32 => value,
            Self::Fp16 => fp16_to_f32(f32_to_fp16(value)),
            Self::Bf16 => bf16_to_f32(f32_to_bf16(value)),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
