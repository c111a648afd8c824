//! AdamW optimizer (Adam with decoupled Weight decay)

use std::fmt;

use super::optimizer::{check_groups, check_new_group, describe, Closure};
use super::{iter_params, Optimizer, ParamGroup, StateDict};
use crate::error::Result;
use ndarray::Array1;

const KIND: &str = "AdamW";
const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

/// AdamW optimizer
///
/// Weight decay is applied to the parameters directly rather than folded into
/// the gradient:
/// θ_t = (1 - lr * λ) * θ_{t-1} - lr_t * m_t / (√v_t + ε)
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    groups: Vec<ParamGroup>,
    m: Vec<Option<Array1<f32>>>, // First moment
    v: Vec<Option<Array1<f32>>>, // Second moment
}

impl AdamW {
    /// Create a new AdamW optimizer
    ///
    /// Fails if a parameter appears more than once across `groups`.
    pub fn new(
        groups: Vec<ParamGroup>,
        lr: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: f32,
    ) -> Result<Self> {
        check_groups(&groups)?;
        let n = iter_params(&groups).count();
        Ok(Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            t: 0,
            groups,
            m: vec![None; n],
            v: vec![None; n],
        })
    }

    /// Create AdamW with default parameters (weight_decay = 0.01)
    pub fn default_params(groups: Vec<ParamGroup>, lr: f32) -> Result<Self> {
        Self::new(groups, lr, 0.9, 0.999, 1e-8, 0.01)
    }

    /// Get optimizer step counter.
    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.t
    }

    #[must_use]
    pub fn first_moments(&self) -> &[Option<Array1<f32>>] {
        &self.m
    }

    #[must_use]
    pub fn second_moments(&self) -> &[Option<Array1<f32>>] {
        &self.v
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>> {
        let loss = closure.map(|f| f());
        self.t += 1;

        let n = iter_params(&self.groups).count();
        if self.m.len() < n {
            self.m.resize(n, None);
            self.v.resize(n, None);
        }

        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);

        let mut slot = 0;
        for group in &mut self.groups {
            let lr = group.lr.unwrap_or(self.lr);
            let weight_decay = group.weight_decay.unwrap_or(self.weight_decay);
            let lr_t = lr * bias2.sqrt() / bias1;

            for param in &mut group.params {
                let i = slot;
                slot += 1;
                let Some(grad) = param.grad() else { continue };

                // m_t = β1 * m_{t-1} + (1 - β1) * g
                let m_t = match self.m[i].take() {
                    Some(m) => m * self.beta1 + &grad * (1.0 - self.beta1),
                    None => &grad * (1.0 - self.beta1),
                };
                // v_t = β2 * v_{t-1} + (1 - β2) * g²
                let grad_sq = &grad * &grad;
                let v_t = match self.v[i].take() {
                    Some(v) => v * self.beta2 + &grad_sq * (1.0 - self.beta2),
                    None => grad_sq * (1.0 - self.beta2),
                };

                let adaptive_update = &m_t / &(v_t.mapv(f32::sqrt) + self.epsilon) * lr_t;
                let data = param.data_mut();
                *data *= 1.0 - lr * weight_decay;
                *data -= &adaptive_update;

                self.m[i] = Some(m_t);
                self.v[i] = Some(v_t);
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
        self.m.extend(std::iter::repeat(None).take(group.len()));
        self.v.extend(std::iter::repeat(None).take(group.len()));
        self.groups.push(group);
        Ok(())
    }

    fn state_dict(&self) -> StateDict {
        StateDict::new(KIND, self.t, self.lr, &self.groups)
            .with_buffer(EXP_AVG, &self.m)
            .with_buffer(EXP_AVG_SQ, &self.v)
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<()> {
        state.check_compatible(KIND, &self.groups)?;
        let m = state.buffer(EXP_AVG, &self.groups)?;
        let v = state.buffer(EXP_AVG_SQ, &self.groups)?;

        state.apply_group_overrides(&mut self.groups);
        self.m = m;
        self.v = v;
        self.t = state.step;
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

impl fmt::Display for AdamW {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(
            f,
            KIND,
            &self.groups,
            &[
                ("lr", self.lr),
                ("beta1", self.beta1),
                ("beta2", self.beta2),
                ("eps", self.epsilon),
                ("weight_decay", self.weight_decay),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tensor;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn single(data: Vec<f32>, grad: &[f32]) -> Vec<ParamGroup> {
        let t = Tensor::from_vec(data, true);
        t.set_grad(arr1(grad));
        vec![ParamGroup::new(vec![t])]
    }

    #[test]
    fn test_adamw_first_step_moves_by_lr() {
        // With bias correction, the first step is lr * sign(g) (ε aside)
        let mut opt = AdamW::new(single(vec![1.0, 1.0], &[0.5, -2.0]), 0.1, 0.9, 0.999, 1e-8, 0.0)
            .expect("param groups should be valid");

        opt.step(None).expect("step should succeed");

        let data = opt.param_groups()[0].params[0].data();
        assert_abs_diff_eq!(data[0], 0.9, epsilon = 1e-4);
        assert_abs_diff_eq!(data[1], 1.1, epsilon = 1e-4);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_adamw_decoupled_weight_decay() {
        let mut opt = AdamW::new(single(vec![2.0], &[0.0]), 0.1, 0.9, 0.999, 1e-8, 0.5)
            .expect("param groups should be valid");

        opt.step(None).expect("step should succeed");

        // Zero gradient: only decay applies, θ = 2 * (1 - 0.1 * 0.5)
        assert_abs_diff_eq!(opt.param_groups()[0].params[0].data()[0], 1.9, epsilon = 1e-6);
    }

    #[test]
    fn test_adamw_moments_tracked() {
        let mut opt = AdamW::default_params(single(vec![0.0], &[1.0]), 0.01)
            .expect("param groups should be valid");
        opt.step(None).expect("step should succeed");

        let m = opt.first_moments()[0].as_ref().expect("first moment should exist");
        let v = opt.second_moments()[0].as_ref().expect("second moment should exist");
        assert_abs_diff_eq!(m[0], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(v[0], 0.001, epsilon = 1e-6);
    }

    #[test]
    fn test_adamw_state_dict_roundtrip() {
        let mut opt = AdamW::default_params(single(vec![1.0, 2.0], &[0.1, 0.2]), 0.01)
            .expect("param groups should be valid");
        opt.step(None).expect("step should succeed");
        opt.step(None).expect("step should succeed");

        let mut resumed = AdamW::default_params(single(vec![1.0, 2.0], &[0.1, 0.2]), 0.5)
            .expect("param groups should be valid");
        resumed.load_state_dict(opt.state_dict()).expect("state should load");

        assert_eq!(resumed.step_count(), 2);
        assert_eq!(resumed.lr(), 0.01);
        assert_eq!(resumed.first_moments(), opt.first_moments());
    }

    #[test]
    fn test_adamw_rejects_sgd_state() {
        let sgd_state = StateDict::new("SGD", 1, 0.1, &single(vec![1.0], &[1.0]));
        let mut opt = AdamW::default_params(single(vec![1.0], &[1.0]), 0.01)
            .expect("param groups should be valid");
        assert!(opt.load_state_dict(sgd_state).is_err());
    }

    #[test]
    fn test_adamw_display() {
        let opt = AdamW::default_params(single(vec![1.0], &[1.0]), 0.01)
            .expect("param groups should be valid");
        let text = format!("{opt}");
        assert!(text.starts_with("AdamW ("));
        assert!(text.contains("weight_decay: 0.01"));
    }

    #[test]
    fn test_adamw_rejects_repeated_param() {
        let t = Tensor::from_vec(vec![1.0], true);
        let groups = vec![ParamGroup::new(vec![t.clone()]), ParamGroup::new(vec![t])];
        assert!(AdamW::default_params(groups, 0.01).is_err());
    }

    #[test]
    fn test_adamw_steps_param_pushed_into_group() {
        let mut opt = AdamW::new(single(vec![1.0], &[1.0]), 0.1, 0.9, 0.999, 1e-8, 0.0)
            .expect("param groups should be valid");
        opt.step(None).expect("step should succeed");

        let extra = Tensor::from_vec(vec![1.0], true);
        extra.set_grad(arr1(&[-1.0]));
        opt.param_groups_mut()[0].params.push(extra);
        opt.step(None).expect("step should succeed");

        assert_eq!(opt.first_moments().len(), 2);
        assert!(opt.param_groups()[0].params[1].data()[0] > 1.0);
    }
}
