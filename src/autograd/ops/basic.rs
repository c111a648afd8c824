//! Elementwise operations and reductions: add, mul, scale, sum

use crate::autograd::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

type GradRule = Box<dyn Fn(&Array1<f32>, &[Tensor]) -> Vec<Array1<f32>>>;

/// Generic tape node: a rule mapping the output gradient onto each input
struct GradFn {
    inputs: Vec<Tensor>,
    output_grad: Rc<RefCell<Option<Array1<f32>>>>,
    rule: GradRule,
}

impl BackwardOp for GradFn {
    fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    fn backward(&self) {
        // Release the borrow first: an input may share this cell.
        let grad = match self.output_grad.borrow().as_ref() {
            Some(grad) => grad.clone(),
            None => return,
        };

        let input_grads = (self.rule)(&grad, &self.inputs);
        for (input, input_grad) in self.inputs.iter().zip(input_grads) {
            if input.requires_grad() {
                input.accumulate_grad(input_grad);
            }
        }
    }
}

fn record<F>(data: Array1<f32>, inputs: Vec<Tensor>, rule: F) -> Tensor
where
    F: Fn(&Array1<f32>, &[Tensor]) -> Vec<Array1<f32>> + 'static,
{
    let requires_grad = inputs.iter().any(Tensor::requires_grad);
    let mut result = Tensor::new(data, requires_grad);
    if requires_grad {
        let node = GradFn { inputs, output_grad: result.grad_cell(), rule: Box::new(rule) };
        result.set_backward_op(Rc::new(node));
    }
    result
}

/// Elementwise sum of two tensors
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    let data = a.data() + b.data();
    record(data, vec![a.clone(), b.clone()], |g, _| vec![g.clone(), g.clone()])
}

/// Elementwise product of two tensors
pub fn mul(a: &Tensor, b: &Tensor) -> Tensor {
    let data = a.data() * b.data();
    record(
        data,
        vec![a.clone(), b.clone()],
        |g, inputs| vec![g * inputs[1].data(), g * inputs[0].data()],
    )
}

/// Multiply a tensor by a scalar
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data() * factor;
    record(data, vec![a.clone()], move |g, _| vec![g * factor])
}

/// Reduce a tensor to a single-element sum
pub fn sum(a: &Tensor) -> Tensor {
    let data = Array1::from(vec![a.data().sum()]);
    let len = a.len();
    record(data, vec![a.clone()], move |g, _| vec![Array1::from_elem(len, g[0])])
}
