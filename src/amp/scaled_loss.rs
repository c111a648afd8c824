//! Value yielded to the body of a `scale_loss` region.

use crate::autograd::{backward, scale, Tensor};

/// A loss multiplied by its scaler's current factor
///
/// Call [`ScaledLoss::backward`] inside the region. The original loss stays
/// reachable through [`ScaledLoss::unscaled`], but running backward on it
/// while the region is open produces unscaled gradients that are then divided
/// by the loss scale; such calls are reported as warnings.
pub struct ScaledLoss {
    scaled: Tensor,
    original: Tensor,
    loss_scale: f32,
}

impl ScaledLoss {
    pub(crate) fn new(loss: &Tensor, loss_scale: f32) -> Self {
        Self { scaled: scale(loss, loss_scale), original: loss.clone(), loss_scale }
    }

    /// The loss itself, for a wrapper whose handle is inactive
    pub(crate) fn passthrough(loss: &Tensor) -> Self {
        Self { scaled: loss.clone(), original: loss.clone(), loss_scale: 1.0 }
    }

    /// Backpropagate the scaled loss
    pub fn backward(&mut self) {
        backward(&mut self.scaled, None);
    }

    /// The scaled loss tensor
    pub fn value(&self) -> &Tensor {
        &self.scaled
    }

    /// The original, unscaled loss
    pub fn unscaled(&self) -> &Tensor {
        &self.original
    }

    pub fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    /// Scalar value of the scaled loss
    pub fn item(&self) -> f32 {
        self.scaled.data().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{mul, sum};
    use ndarray::arr1;

    #[test]
    fn test_scaled_backward_multiplies_grads() {
        let w = Tensor::from_vec(vec![1.0, 2.0], true);
        let x = Tensor::from_vec(vec![3.0, 4.0], false);
        let loss = sum(&mul(&w, &x));

        let mut scaled = ScaledLoss::new(&loss, 1024.0);
        assert_eq!(scaled.item(), 11.0 * 1024.0);
        scaled.backward();

        assert_eq!(w.grad(), Some(arr1(&[3.0 * 1024.0, 4.0 * 1024.0])));
    }

    #[test]
    fn test_passthrough_is_the_loss() {
        let w = Tensor::from_vec(vec![2.0], true);
        let loss = sum(&w);

        let mut scaled = ScaledLoss::passthrough(&loss);
        assert_eq!(scaled.loss_scale(), 1.0);
        assert_eq!(scaled.value().id(), loss.id());
        scaled.backward();

        assert_eq!(w.grad(), Some(arr1(&[1.0])));
    }

    #[test]
    fn test_unscaled_refers_to_original() {
        let loss = sum(&Tensor::from_vec(vec![1.0], true));
        let scaled = ScaledLoss::new(&loss, 4.0);
        assert_eq!(scaled.unscaled().id(), loss.id());
        assert_ne!(scaled.value().id(), loss.id());
    }
}
