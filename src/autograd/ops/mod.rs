//! Differentiable operations used to build losses

mod basic;

pub use basic::{add, mul, scale, sum};
