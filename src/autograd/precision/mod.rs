//! Mixed-precision utilities: precision types, loss-scaling config and the
//! per-loss [`LossScaler`].
//!
//! Reduced-precision gradients underflow to zero when small. Multiplying the
//! loss by a large factor before backward lifts them into range; dividing the
//! gradients afterwards restores their true magnitude. Too large a factor
//! overflows instead, which the scaler detects and backs off from.

mod config;
mod conversions;
mod precision_types;
mod scaler;


pub use config::{LossScaleConfig, MixedPrecisionConfig, DEFAULT_SCALE_GROWTH_INTERVAL};
pub use conversions::{bf16_to_f32, f32_to_bf16, f32_to_fp16, fp16_to_f32};
pub use precision_types::Precision;
pub use scaler::{LossScaler, ScalerState};
