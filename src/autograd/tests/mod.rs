//! Tests for autograd operations
