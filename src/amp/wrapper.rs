//! Loss-scaling optimizer wrapper.

use std::convert::Infallible;
use std::fmt;
use std::rc::Rc;

use ndarray::Array1;

use super::{AmpHandle, ScaledLoss};
use crate::autograd::precision::{LossScaleConfig, LossScaler, MixedPrecisionConfig, ScalerState};
use crate::autograd::Tensor;
use crate::error::{AmpError, Result};
use crate::optim::{iter_params, Closure, Optimizer, ParamGroup, StateDict};

/// Wraps an optimizer with per-loss dynamic loss scaling
///
/// Each step cycle backpropagates up to `num_losses` losses, each inside its
/// own [`AmpOptimizer::scale_loss`] region, then calls [`AmpOptimizer::step`].
/// The underlying optimizer only steps if none of those losses overflowed.
///
/// Scaling more losses than `num_losses` before calling `step()` is a
/// programming error and panics.
pub struct AmpOptimizer<O: Optimizer> {
    optimizer: O,
    handle: Rc<AmpHandle>,
    num_losses: usize,
    loss_idx: usize,
    skip_next: Vec<bool>,
    scalers: Vec<LossScaler>,
    backward_misuse: usize,
    skipped_steps: u64,
}

impl<O: Optimizer> AmpOptimizer<O> {
    /// Wrap `optimizer` with `num_losses` default dynamic scalers
    pub fn new(optimizer: O, handle: Rc<AmpHandle>, num_losses: usize) -> Result<Self> {
        Self::with_loss_scale(optimizer, handle, num_losses, &LossScaleConfig::default())
    }

    /// Wrap `optimizer` with scalers built from `loss_scale`
    pub fn with_loss_scale(
        optimizer: O,
        handle: Rc<AmpHandle>,
        num_losses: usize,
        loss_scale: &LossScaleConfig,
    ) -> Result<Self> {
        if num_losses == 0 {
            return Err(AmpError::InvalidConfig("num_losses must be at least 1".to_string()));
        }
        loss_scale.validate()?;

        Ok(Self {
            optimizer,
            handle,
            num_losses,
            loss_idx: 0,
            skip_next: vec![false; num_losses],
            scalers: (0..num_losses).map(|_| LossScaler::from_config(loss_scale)).collect(),
            backward_misuse: 0,
            skipped_steps: 0,
        })
    }

    /// Wrap `optimizer` using a full mixed-precision config
    pub fn from_config(
        optimizer: O,
        handle: Rc<AmpHandle>,
        config: &MixedPrecisionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Self::with_loss_scale(optimizer, handle, config.num_losses, &config.loss_scale)
    }

    /// Run `body` on the scaled version of `loss`
    ///
    /// With an active handle the body receives `loss * scale`, where `scale`
    /// comes from the scaler of the current loss slot. When the body returns,
    /// gradients are unscaled, checked for overflow, and any gradients from
    /// earlier losses of this cycle are added back. With an inactive handle
    /// the body receives `loss` unchanged and nothing else happens.
    pub fn scale_loss<T, F>(&mut self, loss: &Tensor, body: F) -> T
    where
        F: FnOnce(&mut ScaledLoss) -> T,
    {
        match self.try_scale_loss(loss, |scaled| Ok::<T, Infallible>(body(scaled))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Fallible form of [`AmpOptimizer::scale_loss`]
    ///
    /// If `body` fails (or panics), the region is abandoned: gradients cached
    /// from earlier losses replace whatever the body produced, the scaler is
    /// not updated and the loss slot is not consumed.
    pub fn try_scale_loss<T, E, F>(&mut self, loss: &Tensor, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut ScaledLoss) -> std::result::Result<T, E>,
    {
        if !self.handle.is_active() {
            return body(&mut ScaledLoss::passthrough(loss));
        }

        let region = ScaleRegion::enter(self, loss);
        let mut scaled = ScaledLoss::new(loss, region.loss_scale);
        match body(&mut scaled) {
            Ok(value) => {
                region.complete();
                Ok(value)
            }
            Err(err) => {
                drop(region);
                Err(err)
            }
        }
    }

    /// Step the underlying optimizer unless a loss overflowed this cycle
    ///
    /// Returns `Ok(None)` when the update was skipped. A closure is only
    /// accepted while the handle is inactive.
    pub fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>> {
        if !self.handle.is_active() {
            return self.optimizer.step(closure);
        }

        self.loss_idx = 0;

        for param in iter_params(self.optimizer.param_groups()) {
            self.handle.remove_cache(param);
        }

        if closure.is_some() {
            return Err(AmpError::UnsupportedClosure);
        }

        if self.skip_next.iter().any(|&skip| skip) {
            let overflowed: Vec<usize> = self
                .skip_next
                .iter()
                .enumerate()
                .filter_map(|(i, &skip)| skip.then_some(i))
                .collect();
            tracing::info!(losses = ?overflowed, "Gradient overflow, skipping update");
            self.skip_next.fill(false);
            self.skipped_steps += 1;
            return Ok(None);
        }

        self.optimizer.step(None)
    }

    /// Step the underlying optimizer directly, bypassing overflow checks
    pub fn step_direct(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>> {
        self.optimizer.step(closure)
    }

    pub fn num_losses(&self) -> usize {
        self.num_losses
    }

    /// Index of the next loss slot to be scaled this cycle
    pub fn loss_index(&self) -> usize {
        self.loss_idx
    }

    /// Per-loss overflow flags pending for the next `step()`
    pub fn skip_flags(&self) -> &[bool] {
        &self.skip_next
    }

    pub fn scalers(&self) -> &[LossScaler] {
        &self.scalers
    }

    pub fn scaler(&self, loss_id: usize) -> Option<&LossScaler> {
        self.scalers.get(loss_id)
    }

    /// Current loss scale of every slot
    pub fn loss_scales(&self) -> Vec<f32> {
        self.scalers.iter().map(LossScaler::loss_scale).collect()
    }

    /// Backward calls on an unscaled loss seen inside scale_loss regions
    pub fn backward_misuse_count(&self) -> usize {
        self.backward_misuse
    }

    /// Updates skipped because of overflow
    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }

    pub fn handle(&self) -> &Rc<AmpHandle> {
        &self.handle
    }

    pub fn inner(&self) -> &O {
        &self.optimizer
    }

    pub fn inner_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    pub fn into_inner(self) -> O {
        self.optimizer
    }

    pub fn scaler_states(&self) -> Vec<ScalerState> {
        self.scalers.iter().map(LossScaler::state).collect()
    }

    /// Restore per-loss scaler snapshots, one per loss slot
    pub fn load_scaler_states(&mut self, states: &[ScalerState]) -> Result<()> {
        if states.len() != self.num_losses {
            return Err(AmpError::StateMismatch(format!(
                "got {} scaler states for {} losses",
                states.len(),
                self.num_losses
            )));
        }
        // Validate everything before touching any scaler
        let mut restored = self.scalers.clone();
        for (scaler, state) in restored.iter_mut().zip(states) {
            scaler.load_state(state)?;
        }
        self.scalers = restored;
        Ok(())
    }
}

impl<O: Optimizer> Optimizer for AmpOptimizer<O> {
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>> {
        AmpOptimizer::step(self, closure)
    }

    fn zero_grad(&mut self) {
        self.optimizer.zero_grad();
    }

    fn param_groups(&self) -> &[ParamGroup] {
        self.optimizer.param_groups()
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        self.optimizer.param_groups_mut()
    }

    fn add_param_group(&mut self, group: ParamGroup) -> Result<()> {
        self.optimizer.add_param_group(group)
    }

    fn state_dict(&self) -> StateDict {
        self.optimizer.state_dict()
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<()> {
        self.optimizer.load_state_dict(state)
    }

    fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    fn set_lr(&mut self, lr: f32) {
        self.optimizer.set_lr(lr);
    }
}

impl<O: Optimizer> fmt::Display for AmpOptimizer<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.optimizer, f)
    }
}

/// One open scale_loss region on an active wrapper
///
/// Dropping the region without [`ScaleRegion::complete`] abandons it.
struct ScaleRegion<'a, O: Optimizer> {
    wrapper: &'a mut AmpOptimizer<O>,
    loss: Tensor,
    loss_scale: f32,
    /// Gradients as they were on entry, in `iter_params` order
    saved_grads: Vec<Option<Array1<f32>>>,
    /// Whether `saved_grads` were moved out of the params (later losses) or
    /// only copied (first loss, whose backward accumulates onto them)
    set_aside: bool,
    completed: bool,
}

impl<'a, O: Optimizer> ScaleRegion<'a, O> {
    fn enter(wrapper: &'a mut AmpOptimizer<O>, loss: &Tensor) -> Self {
        assert!(
            wrapper.loss_idx < wrapper.num_losses,
            "scale_loss called more than num_losses ({}) times before step()",
            wrapper.num_losses
        );

        // Earlier losses' gradients must be set aside so this loss can be
        // unscaled on its own.
        let set_aside = wrapper.loss_idx > 0;
        let params = iter_params(wrapper.optimizer.param_groups());
        let saved_grads = if set_aside {
            params.map(Tensor::take_grad).collect()
        } else {
            params.map(Tensor::grad).collect()
        };

        let loss_scale = wrapper.scalers[wrapper.loss_idx].loss_scale();
        loss.arm_backward_guard();

        Self { wrapper, loss: loss.clone(), loss_scale, saved_grads, set_aside, completed: false }
    }

    fn complete(mut self) {
        self.release_guard();

        let wrapper = &mut *self.wrapper;
        let idx = wrapper.loss_idx;
        let overflow = wrapper.scalers[idx]
            .unscale_and_update(wrapper.optimizer.param_groups(), self.loss_scale);
        wrapper.skip_next[idx] = overflow;
        wrapper.loss_idx += 1;

        let saved = std::mem::take(&mut self.saved_grads);
        if self.set_aside {
            let params = iter_params(wrapper.optimizer.param_groups());
            for (param, saved_grad) in params.zip(saved) {
                if let Some(saved_grad) = saved_grad {
                    param.accumulate_grad(saved_grad);
                }
            }
        }

        self.completed = true;
    }

    fn release_guard(&mut self) {
        let misuse = self.loss.disarm_backward_guard();
        self.wrapper.backward_misuse += misuse;
    }
}

impl<O: Optimizer> Drop for ScaleRegion<'_, O> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.release_guard();

        // Partial gradients from the abandoned body are discarded.
        let params = iter_params(self.wrapper.optimizer.param_groups());
        for (param, saved_grad) in params.zip(std::mem::take(&mut self.saved_grads)) {
            match saved_grad {
                Some(grad) => param.set_grad(grad),
                None => param.clear_grad(),
            }
        }
        tracing::debug!(
            loss_id = self.wrapper.loss_idx,
            "scale_loss region exited early; gradients restored"
        );
    }
}
