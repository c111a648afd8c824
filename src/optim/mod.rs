//! Optimizers and the capability trait the amp wrapper delegates to

mod adamw;
mod clip;
mod optimizer;
mod sgd;
mod state;

pub use adamw::AdamW;
pub use clip::{clip_grad_norm, grad_norm};
pub use optimizer::{check_groups, check_new_group, iter_params, Closure, Optimizer, ParamGroup};
pub use sgd::SGD;
pub use state::{GroupState, StateDict};
