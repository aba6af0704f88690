//! Typed error classes for the dictionary-learning core
//!
//! Public APIs return `anyhow::Result` like the rest of the crate, but failures
//! originating here carry a [`CoreError`] so callers (and tests) can
//! distinguish shape mismatches from configuration mistakes via
//! `err.downcast_ref::<CoreError>()`.

use thiserror::Error;

/// Error classes surfaced by the core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Tensor dimensions are incompatible; never silently broadcast
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Invalid construction-time configuration (kernel name, bandwidth, solver)
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation is intentionally unsupported on this model family
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Model was used before `fit` completed
    #[error("model is not fitted: {0}")]
    NotFitted(String),
}

/// Check that a tensor is 2-D, with a descriptive name in the error
pub fn ensure_2d(t: &candle_core::Tensor, name: &str) -> anyhow::Result<(usize, usize)> {
    match t.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        dims => Err(CoreError::Shape(format!(
            "{name} must be 2-D, got shape {dims:?}"
        ))
        .into()),
    }
}

/// Check that two tensors share the same 2-D shape
pub fn ensure_same_shape_2d(
    a: &candle_core::Tensor,
    b: &candle_core::Tensor,
    a_name: &str,
    b_name: &str,
) -> anyhow::Result<(usize, usize)> {
    let a_dims = ensure_2d(a, a_name)?;
    let b_dims = ensure_2d(b, b_name)?;
    if a_dims != b_dims {
        return Err(CoreError::Shape(format!(
            "{a_name} has shape {a_dims:?} but {b_name} has shape {b_dims:?}"
        ))
        .into());
    }
    Ok(a_dims)
}
