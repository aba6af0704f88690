//! Training-loss helper for external SAE training loops
//!
//! Kept differentiable through candle so a caller can `.backward()` the
//! returned scalar against the model's trainable vars.

use anyhow::Result;
use candle_core::Tensor;

use crate::error::ensure_same_shape_2d;

/// Mean squared reconstruction error plus an L1 penalty on the codes:
/// `mean((x - x_hat)^2) + penalty * mean(|codes|)`. Returns a scalar tensor.
pub fn mse_l1_loss(x: &Tensor, x_hat: &Tensor, codes: &Tensor, penalty: f64) -> Result<Tensor> {
    ensure_same_shape_2d(x, x_hat, "x", "x_hat")?;
    let mse = (x - x_hat)?.sqr()?.mean_all()?;
    let l1 = (codes.abs()?.mean_all()? * penalty)?;
    Ok((mse + l1)?)
}
