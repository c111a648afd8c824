//! # amp-optim
//!
//! Loss-scaling optimizer wrapper for mixed-precision training.
//!
//! Gradients computed in reduced precision underflow when they are small. The
//! wrapper multiplies each loss by a per-loss scale factor before backward,
//! divides the resulting gradients back down, and skips the optimizer update
//! whenever a gradient turned non-finite.
//!
//! ```ignore
//! use std::rc::Rc;
//! use amp_optim::{AmpHandle, AmpOptimizer, ParamGroup, Precision, SGD};
//!
//! let handle = Rc::new(AmpHandle::new(Precision::Fp16));
//! let sgd = SGD::new(vec![ParamGroup::new(params)], 0.1, 0.9)?;
//! let mut opt = AmpOptimizer::new(sgd, Rc::clone(&handle), 1)?;
//!
//! let loss = model.loss(&batch);
//! opt.scale_loss(&loss, |scaled| scaled.backward());
//! opt.step(None)?;
//! opt.zero_grad();
//! ```

pub mod amp;
pub mod autograd;
pub mod error;
pub mod optim;

pub use amp::{AmpHandle, AmpOptimizer, ScaledLoss};
pub use autograd::precision::{
    LossScaleConfig, LossScaler, MixedPrecisionConfig, Precision, ScalerState,
};
pub use autograd::{backward, Tensor, TensorId};
pub use error::{AmpError, Result};
pub use optim::{clip_grad_norm, iter_params, AdamW, Optimizer, ParamGroup, StateDict, SGD};
