//! Tensor with a shared gradient cell

use super::BackwardOp;
use ndarray::Array1;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(0);

/// Identity shared by a tensor and all of its clones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// 1-D tensor participating in the autograd tape.
///
/// Cloning is cheap for the gradient: clones share one gradient cell, so a
/// parameter handed to an optimizer and the copy used to build a loss see the
/// same accumulated gradient. The data buffer is owned per clone.
#[derive(Clone)]
pub struct Tensor {
    id: TensorId,
    data: Array1<f32>,
    grad: Rc<RefCell<Option<Array1<f32>>>>,
    backward_op: Option<Rc<dyn BackwardOp>>,
    requires_grad: bool,
    // `Some(n)` while a scale_loss region guards this loss; n counts misuse.
    backward_guard: Rc<Cell<Option<usize>>>,
}

impl Tensor {
    /// Create a tensor from an array
    pub fn new(data: Array1<f32>, requires_grad: bool) -> Self {
        Self {
            id: TensorId::next(),
            data,
            grad: Rc::new(RefCell::new(None)),
            backward_op: None,
            requires_grad,
            backward_guard: Rc::new(Cell::new(None)),
        }
    }

    /// Create a tensor from a vector
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        Self::new(Array1::from(data), requires_grad)
    }

    /// Create a zero-filled tensor
    pub fn zeros(len: usize, requires_grad: bool) -> Self {
        Self::new(Array1::zeros(len), requires_grad)
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Copy of the current gradient, if any
    pub fn grad(&self) -> Option<Array1<f32>> {
        self.grad.borrow().clone()
    }

    /// Whether a gradient buffer is present
    pub fn has_grad(&self) -> bool {
        self.grad.borrow().is_some()
    }

    /// Replace the gradient
    pub fn set_grad(&self, grad: Array1<f32>) {
        *self.grad.borrow_mut() = Some(grad);
    }

    /// Remove and return the gradient, leaving it absent
    pub fn take_grad(&self) -> Option<Array1<f32>> {
        self.grad.borrow_mut().take()
    }

    /// Drop the gradient buffer entirely
    pub fn clear_grad(&self) {
        self.grad.borrow_mut().take();
    }

    /// Zero the gradient in place, keeping the buffer
    pub fn zero_grad(&self) {
        if let Some(grad) = self.grad.borrow_mut().as_mut() {
            grad.fill(0.0);
        }
    }

    /// Add to the gradient, initializing it when absent
    pub fn accumulate_grad(&self, grad: Array1<f32>) {
        let mut cell = self.grad.borrow_mut();
        match cell.as_mut() {
            Some(existing) => *existing += &grad,
            None => *cell = Some(grad),
        }
    }

    /// Shared gradient cell, captured by backward ops
    pub fn grad_cell(&self) -> Rc<RefCell<Option<Array1<f32>>>> {
        Rc::clone(&self.grad)
    }

    pub fn backward_op(&self) -> Option<Rc<dyn BackwardOp>> {
        self.backward_op.clone()
    }

    pub fn set_backward_op(&mut self, op: Rc<dyn BackwardOp>) {
        self.backward_op = Some(op);
    }

    /// Whether a scale_loss region currently guards backward on this tensor
    pub fn is_backward_guarded(&self) -> bool {
        self.backward_guard.get().is_some()
    }

    pub(crate) fn arm_backward_guard(&self) {
        self.backward_guard.set(Some(0));
    }

    /// Disarm the guard, returning how many guarded backward calls it saw
    pub(crate) fn disarm_backward_guard(&self) -> usize {
        self.backward_guard.take().unwrap_or(0)
    }

    /// Record a backward call; returns true when the guard was armed
    pub(crate) fn record_guarded_backward(&self) -> bool {
        match self.backward_guard.get() {
            Some(hits) => {
                self.backward_guard.set(Some(hits + 1));
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("grad", &self.grad.borrow())
            .field("requires_grad", &self.requires_grad)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_clone_shares_grad_and_id() {
        let a = Tensor::from_vec(vec![1.0, 2.0], true);
        let b = a.clone();
        b.set_grad(arr1(&[0.5, 0.5]));

        assert_eq!(a.id(), b.id());
        assert_eq!(a.grad().expect("gradient should be shared"), arr1(&[0.5, 0.5]));
    }

    #[test]
    fn test_distinct_tensors_have_distinct_ids() {
        let a = Tensor::zeros(2, true);
        let b = Tensor::zeros(2, true);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_accumulate_grad_initializes_then_adds() {
        let t = Tensor::zeros(2, true);
        t.accumulate_grad(arr1(&[1.0, 2.0]));
        t.accumulate_grad(arr1(&[0.5, 0.5]));
        assert_eq!(t.grad().expect("gradient should be set"), arr1(&[1.5, 2.5]));
    }

    #[test]
    fn test_zero_grad_keeps_buffer_clear_grad_drops_it() {
        let t = Tensor::zeros(2, true);
        t.set_grad(arr1(&[3.0, 4.0]));

        t.zero_grad();
        assert_eq!(t.grad(), Some(arr1(&[0.0, 0.0])));

        t.clear_grad();
        assert!(!t.has_grad());
    }

    #[test]
    fn test_take_grad() {
        let t = Tensor::zeros(1, true);
        t.set_grad(arr1(&[7.0]));
        assert_eq!(t.take_grad(), Some(arr1(&[7.0])));
        assert!(t.grad().is_none());
    }

    #[test]
    fn test_backward_guard_counts_hits_until_disarmed() {
        let t = Tensor::zeros(1, true);
        assert!(!t.record_guarded_backward());

        t.arm_backward_guard();
        let clone = t.clone();
        assert!(clone.is_backward_guarded());
        assert!(clone.record_guarded_backward());
        assert!(t.record_guarded_backward());

        assert_eq!(t.disarm_backward_guard(), 2);
        assert!(!clone.is_backward_guarded());
        assert_eq!(t.disarm_backward_guard(), 0);
    }
}
