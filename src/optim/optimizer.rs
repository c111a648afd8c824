//! Optimizer capability trait and parameter groups

use std::collections::HashSet;
use std::fmt;

use super::StateDict;
use crate::error::{AmpError, Result};
use crate::{Tensor, TensorId};

/// Loss-reevaluating closure accepted by [`Optimizer::step`]
pub type Closure<'a> = &'a mut dyn FnMut() -> f32;

/// Ordered parameters sharing hyper-parameter overrides
#[derive(Debug, Clone, Default)]
pub struct ParamGroup {
    pub params: Vec<Tensor>,
    /// Overrides the optimizer's base learning rate
    pub lr: Option<f32>,
    /// Overrides the optimizer's weight decay
    pub weight_decay: Option<f32>,
}

impl ParamGroup {
    pub fn new(params: Vec<Tensor>) -> Self {
        Self { params, lr: None, weight_decay: None }
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = Some(lr);
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = Some(weight_decay);
        self
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Every parameter of every group, in group order
pub fn iter_params(groups: &[ParamGroup]) -> impl Iterator<Item = &Tensor> {
    groups.iter().flat_map(|group| group.params.iter())
}

/// Reject a group whose parameters repeat or already belong to `existing`
pub fn check_new_group(existing: &[ParamGroup], group: &ParamGroup) -> Result<()> {
    let seen: HashSet<_> = iter_params(existing).map(Tensor::id).collect();
    check_unique(seen, &group.params)
}

/// Reject initial groups in which any parameter appears more than once
///
/// A repeated parameter shares one gradient cell, so every per-parameter pass
/// (unscaling, updates) would hit it twice.
pub fn check_groups(groups: &[ParamGroup]) -> Result<()> {
    check_unique(HashSet::new(), iter_params(groups))
}

fn check_unique<'a>(
    mut seen: HashSet<TensorId>,
    params: impl IntoIterator<Item = &'a Tensor>,
) -> Result<()> {
    for param in params {
        if !seen.insert(param.id()) {
            return Err(AmpError::InvalidParamGroup(format!(
                "parameter {} appears more than once",
                param.id()
            )));
        }
    }
    Ok(())
}

/// Trait for optimization algorithms
///
/// Optimizers own their parameter groups. Parameters share gradient cells with
/// the tensors used to build the loss, so a backward pass anywhere lands in the
/// gradients the optimizer reads.
pub trait Optimizer: fmt::Display {
    /// Perform a single optimization step
    ///
    /// When a closure is given it is evaluated first and its loss returned.
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<f32>>;

    /// Zero all gradients in place
    fn zero_grad(&mut self) {
        for param in iter_params(self.param_groups()) {
            param.zero_grad();
        }
    }

    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Append a parameter group; its parameters must be new to the optimizer
    fn add_param_group(&mut self, group: ParamGroup) -> Result<()>;

    /// Snapshot of hyper-parameters and per-parameter buffers
    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: StateDict) -> Result<()>;

    /// Get base learning rate
    fn lr(&self) -> f32;

    /// Set base learning rate
    fn set_lr(&mut self, lr: f32);
}

/// Torch-style multi-line description shared by the optimizers' `Display`
pub(crate) fn describe(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    groups: &[ParamGroup],
    defaults: &[(&str, f32)],
) -> fmt::Result {
    writeln!(f, "{name} (")?;
    for (i, group) in groups.iter().enumerate() {
        writeln!(f, "Parameter Group {i}")?;
        for (key, value) in defaults {
            let value = match *key {
                "lr" => group.lr.unwrap_or(*value),
                "weight_decay" => group.weight_decay.unwrap_or(*value),
                _ => *value,
            };
            writeln!(f, "    {key}: {value}")?;
        }
    }
    write!(f, ")")
}
