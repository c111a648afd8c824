//! Shared mixed-precision handle: the enable flag and a cast cache.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use ndarray::Array1;

use crate::autograd::precision::{MixedPrecisionConfig, Precision};
use crate::autograd::{Tensor, TensorId};

/// Process-level mixed-precision switch shared by every wrapper
///
/// Share it as `Rc<AmpHandle>`: wrappers read the flag on every call, so
/// toggling it on one handle affects all of them.
#[derive(Debug, Default)]
pub struct AmpHandle {
    active: Cell<bool>,
    precision: Precision,
    cast_cache: RefCell<HashMap<TensorId, Array1<f32>>>,
}

impl AmpHandle {
    /// Create an active handle casting to `precision`
    pub fn new(precision: Precision) -> Self {
        Self { active: Cell::new(true), precision, cast_cache: RefCell::new(HashMap::new()) }
    }

    /// Create a handle whose flag starts as `config.enabled`
    pub fn from_config(config: &MixedPrecisionConfig) -> Self {
        let handle = Self::new(config.compute_precision);
        handle.set_active(config.enabled);
        handle
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn set_active(&self, active: bool) {
        self.active.set(active);
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Parameter data rounded to the compute precision, cached per tensor
    ///
    /// The cache goes stale once the optimizer updates the parameter, which
    /// is why the wrapper drops every entry on `step()`.
    pub fn cast(&self, tensor: &Tensor) -> Array1<f32> {
        self.cast_cache
            .borrow_mut()
            .entry(tensor.id())
            .or_insert_with(|| tensor.data().mapv(|v| self.precision.round(v)))
            .clone()
    }

    /// Drop any cached cast of `tensor`
    pub fn remove_cache(&self, tensor: &Tensor) {
        self.cast_cache.borrow_mut().remove(&tensor.id());
    }

    pub fn is_cached(&self, tensor: &Tensor) -> bool {
        self.cast_cache.borrow().contains_key(&tensor.id())
    }

    pub fn cache_len(&self) -> usize {
        self.cast_cache.borrow().len()
    }
}
