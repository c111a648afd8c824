//! Bit-level conversions between f32 and the 16-bit formats.

use half::{bf16, f16};

/// Convert f32 to bf16 (round to nearest even)
///
/// NaN stays NaN; magnitudes past the bf16 range become infinity.
pub fn f32_to_bf16(value: f32) -> u16 {
    bf16::from_f32(value).to_bits()
}

/// Convert bf16 to f32
pub fn bf16_to_f32(value: u16) -> f32 {
    bf16::from_bits(value).to_f32()
}

/// Convert f32 to fp16 (IEEE half precision, round to nearest even)
///
/// Magnitudes above 65504 become infinity, which is exactly the overflow
/// loss scaling has to detect.
pub fn f32_to_fp16(value: f32) -> u16 {
    f16::from_f32(value).to_bits()
}

/// Convert fp16 to f32
pub fn fp16_to_f32(value: u16) -> f32 {
    f16::from_bits(value).to_f32()
}
