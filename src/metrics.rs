//! Reconstruction and sparsity metrics for dictionary-learning outputs
//!
//! All functions operate on 2-D f32 tensors of shape (n_samples, dims) or
//! (n_samples, n_components) and check shapes up front; nothing here
//! broadcasts silently.

use anyhow::Result;
use candle_core::Tensor;

use crate::error::{ensure_2d, ensure_same_shape_2d};

/// Guard for relative losses when a sample's norm is zero
pub const EPSILON: f64 = 1e-6;

/// Mean per-sample L2 reconstruction error
pub fn avg_l2_loss(x: &Tensor, x_hat: &Tensor) -> Result<f32> {
    ensure_same_shape_2d(x, x_hat, "x", "x_hat")?;
    let per_sample = (x - x_hat)?.sqr()?.sum(1)?.sqrt()?;
    Ok(per_sample.mean_all()?.to_scalar::<f32>()?)
}

/// Mean per-sample L1 reconstruction error
pub fn avg_l1_loss(x: &Tensor, x_hat: &Tensor) -> Result<f32> {
    ensure_same_shape_2d(x, x_hat, "x", "x_hat")?;
    let per_sample = (x - x_hat)?.abs()?.sum(1)?;
    Ok(per_sample.mean_all()?.to_scalar::<f32>()?)
}

/// Mean per-sample relative L2 error: ||x - x_hat|| / (||x|| + eps).
///
/// Asymmetric: the first argument is the reference.
pub fn relative_avg_l2_loss(x: &Tensor, x_hat: &Tensor) -> Result<f32> {
    ensure_same_shape_2d(x, x_hat, "x", "x_hat")?;
    let err = (x - x_hat)?.sqr()?.sum(1)?.sqrt()?;
    let norm = (x.sqr()?.sum(1)?.sqrt()? + EPSILON)?;
    Ok((err / norm)?.mean_all()?.to_scalar::<f32>()?)
}

/// Mean per-sample relative L1 error: |x - x_hat|_1 / (|x|_1 + eps)
pub fn relative_avg_l1_loss(x: &Tensor, x_hat: &Tensor) -> Result<f32> {
    ensure_same_shape_2d(x, x_hat, "x", "x_hat")?;
    let err = (x - x_hat)?.abs()?.sum(1)?;
    let norm = (x.abs()?.sum(1)? + EPSILON)?;
    Ok((err / norm)?.mean_all()?.to_scalar::<f32>()?)
}

/// Fraction of exactly-zero entries
pub fn sparsity(x: &Tensor) -> Result<f32> {
    let zeros = x.eq(0.0)?.to_dtype(candle_core::DType::F32)?;
    Ok(zeros.mean_all()?.to_scalar::<f32>()?)
}

/// Fraction of entries at or below `threshold`
pub fn sparsity_eps(x: &Tensor, threshold: f64) -> Result<f32> {
    let small = x.le(threshold)?.to_dtype(candle_core::DType::F32)?;
    Ok(small.mean_all()?.to_scalar::<f32>()?)
}

/// Per-component indicator of codes that never fire (column sum exactly zero).
///
/// Returns a (n_components,) tensor of 0/1 values.
pub fn dead_codes(z: &Tensor) -> Result<Tensor> {
    ensure_2d(z, "z")?;
    Ok(z.sum(0)?.eq(0.0)?.to_dtype(candle_core::DType::F32)?)
}
