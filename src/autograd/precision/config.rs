//! Configuration for loss scaling and mixed-precision training.

use serde::{Deserialize, Serialize};

use super::Precision;
use crate::error::{AmpError, Result};

/// Default number of successful steps before the loss scale is increased
pub const DEFAULT_SCALE_GROWTH_INTERVAL: usize = 2000;

/// Dynamic loss-scaling policy parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossScaleConfig {
    /// Scale applied to the first loss
    pub initial_scale: f32,
    /// Factor to increase scale by after `growth_interval` clean updates
    pub growth_factor: f32,
    /// Factor to decrease scale by on overflow
    pub backoff_factor: f32,
    /// Number of consecutive clean updates before increasing scale
    pub growth_interval: usize,
    /// Backoff never goes below this
    pub min_scale: f32,
    /// Growth never goes above this
    pub max_scale: f32,
    /// When false the scale stays fixed; overflow is still detected
    pub dynamic: bool,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 65536.0, // 2^16
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: DEFAULT_SCALE_GROWTH_INTERVAL,
            min_scale: 1.0,
            max_scale: 16_777_216.0, // 2^24
            dynamic: true,
        }
    }
}

impl LossScaleConfig {
    /// Static loss scaling with a fixed factor
    pub fn fixed(scale: f32) -> Self {
        Self { initial_scale: scale, dynamic: false, ..Self::default() }
    }

    pub fn with_initial_scale(mut self, scale: f32) -> Self {
        self.initial_scale = scale;
        self
    }

    pub fn with_growth_interval(mut self, interval: usize) -> Self {
        self.growth_interval = interval;
        self
    }

    pub fn with_factors(mut self, growth: f32, backoff: f32) -> Self {
        self.growth_factor = growth;
        self.backoff_factor = backoff;
        self
    }

    pub fn with_bounds(mut self, min_scale: f32, max_scale: f32) -> Self {
        self.min_scale = min_scale;
        self.max_scale = max_scale;
        self
    }

    pub fn with_dynamic_scaling(mut self, enabled: bool) -> Self {
        self.dynamic = enabled;
        self
    }

    /// Check the policy parameters
    pub fn validate(&self) -> Result<()> {
        let positive_finite = |v: f32| v.is_finite() && v > 0.0;

        if !positive_finite(self.initial_scale) {
            return Err(AmpError::InvalidConfig(format!(
                "initial_scale must be positive and finite, got {}",
                self.initial_scale
            )));
        }
        if !positive_finite(self.min_scale) || !positive_finite(self.max_scale) {
            return Err(AmpError::InvalidConfig(format!(
                "scale bounds must be positive and finite, got [{}, {}]",
                self.min_scale, self.max_scale
            )));
        }
        if self.min_scale > self.max_scale {
            return Err(AmpError::InvalidConfig(format!(
                "min_scale {} exceeds max_scale {}",
                self.min_scale, self.max_scale
            )));
        }
        if self.dynamic {
            if !(self.growth_factor > 1.0) {
                return Err(AmpError::InvalidConfig(format!(
                    "growth_factor must be > 1.0, got {}",
                    self.growth_factor
                )));
            }
            if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
                return Err(AmpError::InvalidConfig(format!(
                    "backoff_factor must be in (0, 1), got {}",
                    self.backoff_factor
                )));
            }
            if self.growth_interval == 0 {
                return Err(AmpError::InvalidConfig("growth_interval must be > 0".to_string()));
            }
        }
        Ok(())
    }
}

/// Configuration for mixed-precision training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedPrecisionConfig {
    /// Precision parameters are cast to for compute
    pub compute_precision: Precision,
    /// Initial state of the handle's enable flag
    pub enabled: bool,
    /// Number of losses backpropagated per optimizer step
    pub num_losses: usize,
    /// Loss-scaling policy, one scaler per loss
    pub loss_scale: LossScaleConfig,
}

impl MixedPrecisionConfig {
    /// Create fp32 config (no mixed precision)
    pub fn fp32() -> Self {
        Self {
            compute_precision: Precision::Fp32,
            enabled: false,
            num_losses: 1,
            loss_scale: LossScaleConfig::fixed(1.0),
        }
    }

    /// Create fp16 mixed-precision config
    pub fn fp16() -> Self {
        Self {
            compute_precision: Precision::Fp16,
            enabled: true,
            num_losses: 1,
            loss_scale: LossScaleConfig::default(),
        }
    }

    /// Create bf16 mixed-precision config
    ///
    /// bf16 shares the f32 exponent range, so a fixed scale of 1 suffices.
    pub fn bf16() -> Self {
        Self {
            compute_precision: Precision::Bf16,
            enabled: true,
            num_losses: 1,
            loss_scale: LossScaleConfig::fixed(1.0),
        }
    }

    /// Check if mixed precision is enabled
    pub fn is_mixed(&self) -> bool {
        self.enabled && self.compute_precision.is_reduced()
    }

    pub fn with_num_losses(mut self, num_losses: usize) -> Self {
        self.num_losses = num_losses;
        self
    }

    pub fn with_loss_scale(mut self, loss_scale: LossScaleConfig) -> Self {
        self.loss_scale = loss_scale;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_losses == 0 {
            return Err(AmpError::InvalidConfig("num_losses must be at least 1".to_string()));
        }
        self.loss_scale.validate()
    }

    /// Parse and validate a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self::fp16()
    }
}
