//! Gradient clipping over parameter groups
//!
//! Clip after gradients are unscaled: clipping scaled gradients would apply a
//! threshold that moves with the loss scale.

use super::{iter_params, ParamGroup};

/// Global L2 norm over every gradient in `groups`
pub fn grad_norm(groups: &[ParamGroup]) -> f32 {
    iter_params(groups)
        .filter_map(|param| param.grad())
        .map(|grad| grad.iter().map(|&g| g * g).sum::<f32>())
        .sum::<f32>()
        .sqrt()
}

/// Clip gradients by global norm
///
/// Scales every gradient by `max_norm / global_norm` when the global norm
/// exceeds `max_norm`. Returns the norm measured before clipping. A
/// non-finite norm is returned as is and leaves gradients untouched; the
/// loss scaler is responsible for that case.
pub fn clip_grad_norm(groups: &[ParamGroup], max_norm: f32) -> f32 {
    let global_norm = grad_norm(groups);

    if global_norm.is_finite() && global_norm > max_norm {
        let clip_coef = max_norm / global_norm;
        for param in iter_params(groups) {
            if let Some(grad) = param.grad_cell().borrow_mut().as_mut() {
                *grad *= clip_coef;
            }
        }
    }

    global_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tensor;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    fn groups(grads: &[&[f32]]) -> Vec<ParamGroup> {
        grads
            .iter()
            .map(|g| {
                let t = Tensor::zeros(g.len(), true);
                t.set_grad(arr1(g));
                ParamGroup::new(vec![t])
            })
            .collect()
    }

    #[test]
    fn test_clip_grad_norm_no_clipping() {
        let groups = groups(&[&[0.1, 0.2], &[0.1]]);

        let norm = clip_grad_norm(&groups, 1.0);

        assert_abs_diff_eq!(norm, 0.06f32.sqrt(), epsilon = 1e-6);
        let grad = groups[0].params[0].grad().expect("gradient should be kept");
        assert_abs_diff_eq!(grad[1], 0.2, epsilon = 1e-7);
    }

    #[test]
    fn test_clip_grad_norm_across_groups() {
        let groups = groups(&[&[3.0], &[4.0]]);

        let norm = clip_grad_norm(&groups, 1.0);

        assert_abs_diff_eq!(norm, 5.0, epsilon = 1e-6);
        let first = groups[0].params[0].grad().expect("gradient should be kept");
        let second = groups[1].params[0].grad().expect("gradient should be kept");
        assert_abs_diff_eq!(first[0], 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(second[0], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_clip_grad_norm_ignores_missing_grads() {
        let mut groups = groups(&[&[0.0, 2.0]]);
        groups.push(ParamGroup::new(vec![Tensor::zeros(3, true)]));

        assert_abs_diff_eq!(clip_grad_norm(&groups, 10.0), 2.0, epsilon = 1e-6);
        assert!(groups[1].params[0].grad().is_none());
    }

    #[test]
    fn test_clip_grad_norm_leaves_non_finite() {
        let groups = groups(&[&[f32::INFINITY, 1.0]]);

        assert!(clip_grad_norm(&groups, 1.0).is_infinite());
        let grad = groups[0].params[0].grad().expect("gradient should be kept");
        assert_eq!(grad[1], 1.0);
    }
}
