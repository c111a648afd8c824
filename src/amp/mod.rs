//! Loss-scaling optimizer wrapper
//!
//! [`AmpOptimizer`] keeps one [`LossScaler`](crate::LossScaler) per loss and
//! drives a per-step cycle:
//!
//! ```text
//! IDLE(idx=0) --scale_loss--> SCALING_0 .. SCALING_{n-1} --step--> APPLIED | SKIPPED --> IDLE
//! ```
//!
//! While the shared [`AmpHandle`] is inactive the wrapper is a passthrough.

mod handle;
mod scaled_loss;
mod wrapper;


pub use handle::AmpHandle;
pub use scaled_loss::ScaledLoss;
pub use wrapper::AmpOptimizer;
