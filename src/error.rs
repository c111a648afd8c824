//! Error types for the loss-scaling optimizer wrapper.

use thiserror::Error;

/// Errors raised by the wrapper, its scalers and the reference optimizers.
///
/// Gradient overflow is not an error: it is handled by skipping the step.
#[derive(Debug, Error)]
pub enum AmpError {
    #[error("The `closure` argument is unsupported by the amp optimizer wrapper")]
    UnsupportedClosure,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid parameter group: {0}")]
    InvalidParamGroup(String),

    #[error("State does not match this optimizer: {0}")]
    StateMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for amp operations
pub type Result<T> = std::result::Result<T, AmpError>;
