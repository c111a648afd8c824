//! Stochastic Gradient Descent optimizer

use std::fmt;

use super::optimizer::{check_groups, check_new_group, describe, Closure};
use super::{iter_params, Optimizer, ParamGroup, StateDict};
use crate::error::Result;
use ndarray::Array1;

const KIND: &str = "SGD";
const MOMENTUM_BUFFER: &str = "momentum_buffer";

/// SGD optimizer with optional momentum
pub struct SGD {
    lr: f32,
    momentum: f32,
    groups: Vec<ParamGroup>,
    /// One slot per parameter, in `iter_params` order
    velocities: Vec<Option<Array1<f32>>>,
    steps: u64,
}

impl SGD {
    /// Create a new SGD optimizer
    ///
    /// Fails if a parameter appears more than once across `groups`.
    pub fn new(groups: Vec<ParamGroup>, lr: f32, momentum: f32) -> Result<Self> {
        check_groups(&groups)?;
        let velocities = vec![None; iter_params(&groups).count()];
        Ok(Self { lr, momentum, groups, velocities, steps: 0 })
    }

    /// Number of updates applied so far
    pub fn step_count(&self) -> u64 {
        self.steps
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }
}

impl Optimizer for SGD {
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>> {
        let loss = closure.map(|f| f());
        self.steps += 1;

        // Parameters pushed through param_groups_mut() start without momentum
        let n = iter_params(&self.groups).count();
        if self.velocities.len() < n {
            self.velocities.resize(n, None);
        }

        let mut slot = 0;
        for group in &mut self.groups {
            let lr = group.lr.unwrap_or(self.lr);
            let weight_decay = group.weight_decay.unwrap_or(0.0);

            for param in &mut group.params {
                let i = slot;
                slot += 1;
                let Some(mut grad) = param.grad() else { continue };
                if weight_decay > 0.0 {
                    grad.scaled_add(weight_decay, param.data());
                }

                if self.momentum > 0.0 {
                    // v = momentum * v - lr * grad; param += v
                    let velocity = match self.velocities[i].take() {
                        Some(v) => v * self.momentum - &grad * lr,
                        None => &grad * (-lr),
                    };
                    *param.data_mut() += &velocity;
                    self.velocities[i] = Some(velocity);
                } else {
                    param.data_mut().scaled_add(-lr, &grad);
                }
            }
        }

        Ok(loss)
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn add_param_group(&mut self, group: ParamGroup) -> Result<()> {
        check_new_group(&self.groups, &group)?;
        self.velocities.extend(std::iter::repeat(None).take(group.len()));
        self.groups.push(group);
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new(KIND, self.steps, self.lr, &self.groups)
            .with_buffer(MOMENTUM_BUFFER, &self.velocities)
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<()> {
        state.check_compatible(KIND, &self.groups)?;
        let velocities = state.buffer(MOMENTUM_BUFFER, &self.groups)?;

        state.apply_group_overrides(&mut self.groups);
        self.velocities = velocities;
        self.steps = state.step;
        self.lr = state.lr;
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

impl fmt::Display for SGD {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(f, KIND, &self.groups, &[("lr", self.lr), ("momentum", self.momentum)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AmpError;
    use crate::Tensor;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn sgd(groups: Vec<ParamGroup>, lr: f32, momentum: f32) -> SGD {
        SGD::new(groups, lr, momentum).expect("param groups should be valid")
    }

    fn param(data: Vec<f32>, grad: &[f32]) -> Tensor {
        let t = Tensor::from_vec(data, true);
        t.set_grad(arr1(grad));
        t
    }

    #[test]
    fn test_sgd_plain_update() {
        let mut opt = sgd(vec![ParamGroup::new(vec![param(vec![1.0, 2.0], &[0.5, 1.0])])], 0.1, 0.0);

        let loss = opt.step(None).expect("step should succeed");

        assert!(loss.is_none());
        let data = opt.param_groups()[0].params[0].data();
        assert_abs_diff_eq!(data[0], 0.95, epsilon = 1e-6);
        assert_abs_diff_eq!(data[1], 1.9, epsilon = 1e-6);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_sgd_returns_closure_loss() {
        let mut opt = sgd(vec![ParamGroup::new(vec![param(vec![1.0], &[1.0])])], 0.1, 0.0);
        let mut calls = 0;
        let mut closure = || {
            calls += 1;
            4.5f32
        };

        let loss = opt.step(Some(&mut closure)).expect("step should succeed");

        assert_eq!(loss, Some(4.5));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut opt = sgd(vec![ParamGroup::new(vec![param(vec![0.0], &[1.0])])], 1.0, 0.5);

        opt.step(None).expect("step should succeed");
        opt.step(None).expect("step should succeed");

        // v1 = -1, v2 = 0.5 * -1 - 1 = -1.5
        assert_abs_diff_eq!(opt.param_groups()[0].params[0].data()[0], -2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_group_overrides() {
        let groups = vec![
            ParamGroup::new(vec![param(vec![1.0], &[1.0])]),
            ParamGroup::new(vec![param(vec![1.0], &[1.0])]).with_lr(0.5),
            ParamGroup::new(vec![param(vec![1.0], &[0.0])]).with_weight_decay(0.1),
        ];
        let mut opt = sgd(groups, 0.1, 0.0);

        opt.step(None).expect("step should succeed");

        let groups = opt.param_groups();
        assert_abs_diff_eq!(groups[0].params[0].data()[0], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(groups[1].params[0].data()[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(groups[2].params[0].data()[0], 0.99, epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_skips_params_without_grad() {
        let mut opt = sgd(vec![ParamGroup::new(vec![Tensor::from_vec(vec![3.0], true)])], 0.1, 0.9);
        opt.step(None).expect("step should succeed");
        assert_eq!(opt.param_groups()[0].params[0].data()[0], 3.0);
    }

    #[test]
    fn test_sgd_zero_grad() {
        let mut opt = sgd(vec![ParamGroup::new(vec![param(vec![1.0], &[2.0])])], 0.1, 0.0);
        opt.zero_grad();
        assert_eq!(opt.param_groups()[0].params[0].grad(), Some(arr1(&[0.0])));
    }

    #[test]
    fn test_sgd_add_param_group() {
        let shared = param(vec![1.0], &[1.0]);
        let mut opt = sgd(vec![ParamGroup::new(vec![shared.clone()])], 0.1, 0.9);

        assert!(opt.add_param_group(ParamGroup::new(vec![shared])).is_err());
        opt.add_param_group(ParamGroup::new(vec![param(vec![2.0], &[1.0])]))
            .expect("new group should be accepted");

        assert_eq!(opt.param_groups().len(), 2);
        opt.step(None).expect("step should succeed");
        assert_abs_diff_eq!(opt.param_groups()[1].params[0].data()[0], 1.9, epsilon = 1e-6);
    }

    #[test]
    fn test_sgd_state_dict_roundtrip() {
        let mut opt = sgd(vec![ParamGroup::new(vec![param(vec![0.0, 0.0], &[1.0, 2.0])])], 0.1, 0.9);
        opt.step(None).expect("step should succeed");
        let json = opt.state_dict().to_json().expect("serialization should succeed");

        let mut resumed = sgd(vec![ParamGroup::new(vec![param(vec![0.0, 0.0], &[1.0, 2.0])])], 0.5, 0.9);
        resumed
            .load_state_dict(StateDict::from_json(&json).expect("state should parse"))
            .expect("state should load");

        assert_eq!(resumed.step_count(), 1);
        assert_eq!(resumed.lr(), 0.1);
        assert_eq!(resumed.state_dict(), opt.state_dict());
    }

    #[test]
    fn test_sgd_load_state_dict_rejects_other_layout() {
        let opt = sgd(vec![ParamGroup::new(vec![Tensor::zeros(2, true)])], 0.1, 0.9);
        let mut other = sgd(vec![ParamGroup::new(vec![Tensor::zeros(3, true)])], 0.1, 0.9);
        let mut state = opt.state_dict();
        state.buffers.insert(MOMENTUM_BUFFER.to_string(), vec![Some(vec![1.0, 1.0])]);

        assert!(other.load_state_dict(state).is_err());
    }

    #[test]
    fn test_sgd_display() {
        let opt = sgd(vec![ParamGroup::new(vec![Tensor::zeros(1, true)]).with_lr(0.3)], 0.1, 0.9);
        let text = opt.to_string();
        assert!(text.starts_with("SGD ("));
        assert!(text.contains("Parameter Group 0"));
        assert!(text.contains("lr: 0.3"));
        assert!(text.contains("momentum: 0.9"));
    }

    #[test]
    fn test_sgd_rejects_repeated_param() {
        let w = param(vec![1.0], &[3.0]);
        let groups = vec![ParamGroup::new(vec![w.clone(), w])];
        assert!(matches!(SGD::new(groups, 0.1, 0.0), Err(AmpError::InvalidParamGroup(_))));
    }

    #[test]
    fn test_sgd_steps_param_pushed_into_group() {
        let mut opt = sgd(vec![ParamGroup::new(vec![param(vec![1.0], &[1.0])])], 0.1, 0.9);
        opt.step(None).expect("step should succeed");

        opt.param_groups_mut()[0].params.push(param(vec![2.0], &[1.0]));
        opt.step(None).expect("step should succeed");

        assert_abs_diff_eq!(opt.param_groups()[0].params[1].data()[0], 1.9, epsilon = 1e-6);
        assert_eq!(opt.state_dict().buffers[MOMENTUM_BUFFER].len(), 2);
    }
}
