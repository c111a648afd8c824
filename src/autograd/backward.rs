//! Backward operation trait and tape traversal

use std::collections::HashSet;
use std::rc::Rc;

use super::{Tensor, TensorId};

/// A node on the gradient tape.
///
/// `backward` reads the gradient stored in the output's cell and pushes the
/// matching contributions into the inputs. It does not recurse; traversal
/// order is decided by [`topological_order`].
pub trait BackwardOp {
    /// Tensors this node was computed from
    fn inputs(&self) -> &[Tensor];

    fn backward(&self);
}

/// Non-leaf tensors reachable from `root`, each before any of its inputs
pub(crate) fn topological_order(root: &Tensor) -> Vec<(Tensor, Rc<dyn BackwardOp>)> {
    fn visit(
        tensor: &Tensor,
        seen: &mut HashSet<TensorId>,
        order: &mut Vec<(Tensor, Rc<dyn BackwardOp>)>,
    ) {
        let Some(op) = tensor.backward_op() else { return };
        if !seen.insert(tensor.id()) {
            return;
        }
        for input in op.inputs() {
            visit(input, seen, order);
        }
        order.push((tensor.clone(), op));
    }

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    visit(root, &mut seen, &mut order);
    order.reverse();
    order
}
