//! Tape-based autograd engine
//!
//! Just enough differentiation to drive loss scaling: 1-D tensors with a
//! shared gradient cell and a handful of ops recorded on a gradient tape.

mod backward;
mod ops;
pub mod precision;
mod tensor;

#[cfg(test)]
mod tests;

pub use backward::BackwardOp;
pub use ops::*;
pub use tensor::{Tensor, TensorId};

/// Perform backward pass on a tensor
///
/// Gradients of intermediate tensors are recomputed from scratch on every
/// call; leaf gradients accumulate.
///
/// Calling this on a loss that is guarded by an active `scale_loss` region
/// still runs the pass, but warns: the gradients it produces are unscaled and
/// will be divided by the loss scale afterwards.
pub fn backward(tensor: &mut Tensor, grad_output: Option<ndarray::Array1<f32>>) {
    if tensor.record_guarded_backward() {
        tracing::warn!(
            tensor = %tensor.id(),
            "backward() called on the unscaled loss inside a scale_loss region; \
             this is almost certainly an error"
        );
    }

    let order = backward::topological_order(tensor);
    for (node, _) in &order {
        node.clear_grad();
    }

    match grad_output {
        Some(grad) => tensor.set_grad(grad),
        None => tensor.set_grad(ndarray::Array1::ones(tensor.len())),
    }

    for (_, op) in &order {
        op.backward();
    }
}
