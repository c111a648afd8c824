//! Dynamic loss scaler, one per logical loss.

use serde::{Deserialize, Serialize};

use super::LossScaleConfig;
use crate::error::{AmpError, Result};
use crate::optim::{iter_params, ParamGroup};

/// Checkpointable snapshot of a scaler's mutable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f32,
    pub unskipped: usize,
    pub overflow_count: u64,
    pub successful_steps: u64,
}

/// Loss scaler for mixed-precision training
///
/// Backs off sharply on overflow and grows again only after a run of
/// `growth_interval` clean updates.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    min_scale: f32,
    max_scale: f32,
    dynamic: bool,
    /// Clean updates since the last growth or overflow
    unskipped: usize,
    overflow_count: u64,
    successful_steps: u64,
}

impl LossScaler {
    /// Create a dynamic scaler with default policy and the given initial scale
    pub fn new(initial_scale: f32) -> Self {
        Self::from_config(&LossScaleConfig::default().with_initial_scale(initial_scale))
    }

    /// Create from config
    ///
    /// The config is not validated here; see [`LossScaleConfig::validate`].
    pub fn from_config(config: &LossScaleConfig) -> Self {
        Self {
            scale: config.initial_scale,
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            min_scale: config.min_scale,
            max_scale: config.max_scale,
            dynamic: config.dynamic,
            unskipped: 0,
            overflow_count: 0,
            successful_steps: 0,
        }
    }

    /// Current scale factor to multiply the loss by before backward
    pub fn loss_scale(&self) -> f32 {
        self.scale
    }

    /// Divide every gradient by `loss_scale` and report overflow
    ///
    /// Gradients are unscaled whether or not overflow occurred, then the
    /// scaling policy is updated. Returns true when any gradient element is
    /// infinite or NaN, meaning the optimizer step must be skipped.
    pub fn unscale_and_update(&mut self, groups: &[ParamGroup], loss_scale: f32) -> bool {
        let overflow = Self::unscale_grads(groups, loss_scale);
        self.update(overflow);
        overflow
    }

    /// Divide gradients in place by `loss_scale`; true if any is non-finite
    pub fn unscale_grads(groups: &[ParamGroup], loss_scale: f32) -> bool {
        let mut overflow = false;
        for param in iter_params(groups) {
            let cell = param.grad_cell();
            let mut grad = cell.borrow_mut();
            if let Some(grad) = grad.as_mut() {
                for g in grad.iter_mut() {
                    *g /= loss_scale;
                    overflow |= !g.is_finite();
                }
            }
        }
        overflow
    }

    /// Apply the scaling policy for one update
    pub fn update(&mut self, overflow: bool) {
        if overflow {
            self.overflow_count += 1;
            self.unskipped = 0;
            if self.dynamic {
                let previous = self.scale;
                self.scale = (self.scale * self.backoff_factor).max(self.min_scale);
                tracing::debug!(from = previous, to = self.scale, "loss scale backed off");
            }
            return;
        }

        self.successful_steps += 1;
        self.unskipped += 1;
        if self.dynamic && self.unskipped >= self.growth_interval {
            let previous = self.scale;
            self.scale = (self.scale * self.growth_factor).min(self.max_scale);
            self.unskipped = 0;
            tracing::debug!(from = previous, to = self.scale, "loss scale increased");
        }
    }

    /// Clean updates since the last growth or overflow
    pub fn unskipped(&self) -> usize {
        self.unskipped
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn successful_steps(&self) -> u64 {
        self.successful_steps
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn state(&self) -> ScalerState {
        ScalerState {
            scale: self.scale,
            unskipped: self.unskipped,
            overflow_count: self.overflow_count,
            successful_steps: self.successful_steps,
        }
    }

    /// Restore a snapshot taken with [`LossScaler::state`]
    pub fn load_state(&mut self, state: &ScalerState) -> Result<()> {
        if !(state.scale.is_finite() && state.scale > 0.0) {
            return Err(AmpError::StateMismatch(format!(
                "loss scale must be positive and finite, got {}",
                state.scale
            )));
        }
        self.scale = state.scale;
        self.unskipped = state.unskipped;
        self.overflow_count = state.overflow_count;
        self.successful_steps = state.successful_steps;
        Ok(())
    }
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::from_config(&LossScaleConfig::default())
    }
}
