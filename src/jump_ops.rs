//! JumpReLU and Heaviside activations with kernel-density pseudo-gradients
//!
//! Both forwards are hard thresholds, so their true derivative with respect to
//! the threshold is a Dirac spike that is useless for optimization. The
//! backward passes instead weight the upstream gradient by a smoothing kernel
//! evaluated at `(x - threshold) / bandwidth` — a straight-through kernel
//! estimator. Bandwidth trades bias for variance: too small and the gradient
//! signal collapses around the threshold, too large and the threshold estimate
//! is over-smoothed.
//!
//! The ops are registered with candle's autodiff via [`CustomOp2`], so
//! `loss.backward()` flows gradients to a threshold `Var` like any other
//! parameter. The threshold is broadcast to the input's shape before the op is
//! applied; candle's broadcast backward then performs the per-component sum
//! over the sample axis. Pure `*_backward` evaluators are also exposed for
//! callers running manual backpropagation.
//!
//! Boundary conventions differ on purpose and must not be harmonized:
//! JumpReLU passes values exactly equal to the threshold, Heaviside fires only
//! strictly above it.

use candle_core::{CpuStorage, CustomOp2, Layout, Shape, Tensor};

use crate::error::CoreError;
use crate::kernels::Kernel;

/// Validate the shared (x, threshold, bandwidth) contract of both activations
fn check_activation_args(x: &Tensor, threshold: &Tensor, bandwidth: f64) -> anyhow::Result<()> {
    if bandwidth <= 0.0 {
        return Err(CoreError::Config(format!(
            "bandwidth must be positive, got {bandwidth}"
        ))
        .into());
    }
    let last_dim = x.dims().last().copied().unwrap_or(0);
    if threshold.dims() != [last_dim] {
        return Err(CoreError::Shape(format!(
            "threshold must have shape [{last_dim}] (one entry per component), got {:?}",
            threshold.dims()
        ))
        .into());
    }
    Ok(())
}

/// Pull a contiguous f32 slice out of CPU storage, respecting the layout
fn f32_slice<'a>(
    storage: &'a CpuStorage,
    layout: &Layout,
    op: &'static str,
) -> candle_core::Result<&'a [f32]> {
    let (start, end) = match layout.contiguous_offsets() {
        Some(offsets) => offsets,
        None => candle_core::bail!("{op} requires contiguous input"),
    };
    match storage {
        CpuStorage::F32(data) => Ok(&data[start..end]),
        _ => candle_core::bail!("{op} only supports f32 tensors"),
    }
}

/// Thresholded passthrough: `x` where `x >= threshold`, else 0
///
/// Custom backward: the input gradient is the ordinary piecewise-linear one,
/// the threshold gradient is `-(threshold / bandwidth) * K(delta / bandwidth)`
/// times the upstream gradient. The `threshold / bandwidth` factor is the
/// reparameterization that cancels the singularity at `threshold = 0`.
#[derive(Debug, Clone)]
pub struct JumpReluOp {
    kernel: Kernel,
    bandwidth: f64,
}

impl CustomOp2 for JumpReluOp {
    fn name(&self) -> &'static str {
        "jump-relu"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        if l1.shape() != l2.shape() {
            candle_core::bail!(
                "jump-relu expects pre-broadcast threshold, got {:?} vs {:?}",
                l1.shape(),
                l2.shape()
            );
        }
        let x = f32_slice(s1, l1, "jump-relu")?;
        let theta = f32_slice(s2, l2, "jump-relu")?;
        let out: Vec<f32> = x
            .iter()
            .zip(theta.iter())
            .map(|(&v, &t)| if v < t { 0.0 } else { v })
            .collect();
        Ok((CpuStorage::F32(out), l1.shape().clone()))
    }

    fn bwd(
        &self,
        x: &Tensor,
        theta: &Tensor,
        _res: &Tensor,
        grad_out: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>)> {
        let (grad_x, grad_theta) =
            jump_relu_grads(x, theta, grad_out, self.kernel, self.bandwidth)?;
        Ok((Some(grad_x), Some(grad_theta)))
    }
}

/// Per-element JumpReLU gradients wrt a pre-broadcast threshold
fn jump_relu_grads(
    x: &Tensor,
    theta: &Tensor,
    grad_out: &Tensor,
    kernel: Kernel,
    bandwidth: f64,
) -> candle_core::Result<(Tensor, Tensor)> {
    // gradient wrt x: passthrough where the forward passed
    let passed = x.ge(theta)?;
    let grad_x = passed.where_cond(grad_out, &grad_out.zeros_like()?)?;

    // pseudo-gradient wrt threshold: -(theta/b) * K(delta/b) * g, per element;
    // the broadcast backward reduces over the sample axis
    let delta = (x - theta)?;
    let weights = kernel.evaluate(&delta, bandwidth)?;
    let grad_theta = ((theta * (-1.0 / bandwidth))? * weights)?.mul(grad_out)?;

    Ok((grad_x, grad_theta))
}

/// Thresholded step: 1 where `x > threshold` (strict), else 0
///
/// Custom backward: no gradient flows to the input (the step is flat almost
/// everywhere); the threshold gradient is `-(1 / bandwidth) * K(delta /
/// bandwidth)` times the upstream gradient, without JumpReLU's rescaling.
#[derive(Debug, Clone)]
pub struct HeavisideOp {
    kernel: Kernel,
    bandwidth: f64,
}

impl CustomOp2 for HeavisideOp {
    fn name(&self) -> &'static str {
        "heaviside-step"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        if l1.shape() != l2.shape() {
            candle_core::bail!(
                "heaviside-step expects pre-broadcast threshold, got {:?} vs {:?}",
                l1.shape(),
                l2.shape()
            );
        }
        let x = f32_slice(s1, l1, "heaviside-step")?;
        let theta = f32_slice(s2, l2, "heaviside-step")?;
        let out: Vec<f32> = x
            .iter()
            .zip(theta.iter())
            .map(|(&v, &t)| if v > t { 1.0 } else { 0.0 })
            .collect();
        Ok((CpuStorage::F32(out), l1.shape().clone()))
    }

    fn bwd(
        &self,
        x: &Tensor,
        theta: &Tensor,
        _res: &Tensor,
        grad_out: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>)> {
        let (grad_x, grad_theta) =
            heaviside_grads(x, theta, grad_out, self.kernel, self.bandwidth)?;
        Ok((Some(grad_x), Some(grad_theta)))
    }
}

/// Per-element Heaviside gradients wrt a pre-broadcast threshold
fn heaviside_grads(
    x: &Tensor,
    theta: &Tensor,
    grad_out: &Tensor,
    kernel: Kernel,
    bandwidth: f64,
) -> candle_core::Result<(Tensor, Tensor)> {
    // the step is flat almost everywhere: no gradient path through x
    let grad_x = grad_out.zeros_like()?;

    let delta = (x - theta)?;
    let weights = kernel.evaluate(&delta, bandwidth)?;
    let grad_theta = (weights * (-1.0 / bandwidth))?.mul(grad_out)?;

    Ok((grad_x, grad_theta))
}

/// Apply the JumpReLU activation: `x` where `x >= threshold[j]`, else 0.
///
/// `x` has shape `(n, k)` (or `(k,)`), `threshold` has one entry per
/// component `(k,)`. Differentiable through candle; the threshold gradient is
/// the kernel-density pseudo-gradient summed over samples.
pub fn jump_relu(
    x: &Tensor,
    threshold: &Tensor,
    kernel: Kernel,
    bandwidth: f64,
) -> anyhow::Result<Tensor> {
    check_activation_args(x, threshold, bandwidth)?;
    let theta = threshold.broadcast_as(x.shape())?.contiguous()?;
    let out = x
        .contiguous()?
        .apply_op2(&theta, JumpReluOp { kernel, bandwidth })?;
    Ok(out)
}

/// Apply the Heaviside step: 1 where `x > threshold[j]` (strict), else 0.
pub fn heaviside(
    x: &Tensor,
    threshold: &Tensor,
    kernel: Kernel,
    bandwidth: f64,
) -> anyhow::Result<Tensor> {
    check_activation_args(x, threshold, bandwidth)?;
    let theta = threshold.broadcast_as(x.shape())?.contiguous()?;
    let out = x
        .contiguous()?
        .apply_op2(&theta, HeavisideOp { kernel, bandwidth })?;
    Ok(out)
}

/// Pure backward evaluator for JumpReLU, for manual backpropagation.
///
/// Consumes the saved forward inputs and the upstream gradient; returns
/// `(grad_x, grad_threshold)` with the threshold gradient already summed over
/// the sample axis, shape `(k,)`.
pub fn jump_relu_backward(
    x: &Tensor,
    threshold: &Tensor,
    grad_out: &Tensor,
    kernel: Kernel,
    bandwidth: f64,
) -> anyhow::Result<(Tensor, Tensor)> {
    check_activation_args(x, threshold, bandwidth)?;
    let theta = threshold.broadcast_as(x.shape())?.contiguous()?;
    let (grad_x, grad_theta) = jump_relu_grads(x, &theta, grad_out, kernel, bandwidth)?;
    Ok((grad_x, grad_theta.sum(0)?))
}

/// Pure backward evaluator for the Heaviside step, for manual backpropagation.
pub fn heaviside_backward(
    x: &Tensor,
    threshold: &Tensor,
    grad_out: &Tensor,
    kernel: Kernel,
    bandwidth: f64,
) -> anyhow::Result<(Tensor, Tensor)> {
    check_activation_args(x, threshold, bandwidth)?;
    let theta = threshold.broadcast_as(x.shape())?.contiguous()?;
    let (grad_x, grad_theta) = heaviside_grads(x, &theta, grad_out, kernel, bandwidth)?;
    Ok((grad_x, grad_theta.sum(0)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn tensor_2x3(device: &Device, values: [f32; 6]) -> Tensor {
        Tensor::from_vec(values.to_vec(), (2, 3), device).unwrap()
    }

    #[test]
    fn test_jump_relu_forward_boundary() {
        let device = Device::Cpu;
        let x = tensor_2x3(&device, [-1.0, 0.5, 0.5, 2.0, 0.49, -0.2]);
        let theta = Tensor::from_vec(vec![0.0f32, 0.5, 0.5], (3,), &device).unwrap();

        let out: Vec<Vec<f32>> = jump_relu(&x, &theta, Kernel::Silverman, 1e-3)
            .unwrap()
            .to_vec2()
            .unwrap();

        // values exactly at the threshold pass through
        assert_eq!(out[0], vec![0.0, 0.5, 0.5]);
        assert_eq!(out[1], vec![2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_heaviside_forward_strict_boundary() {
        let device = Device::Cpu;
        let x = tensor_2x3(&device, [-1.0, 0.5, 0.51, 2.0, 0.49, -0.2]);
        let theta = Tensor::from_vec(vec![0.0f32, 0.5, 0.5], (3,), &device).unwrap();

        let out: Vec<Vec<f32>> = heaviside(&x, &theta, Kernel::Silverman, 1e-3)
            .unwrap()
            .to_vec2()
            .unwrap();

        // equality does not fire: strict inequality
        assert_eq!(out[0], vec![0.0, 0.0, 1.0]);
        assert_eq!(out[1], vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bandwidth_must_be_positive() {
        let device = Device::Cpu;
        let x = tensor_2x3(&device, [0.0; 6]);
        let theta = Tensor::zeros((3,), candle_core::DType::F32, &device).unwrap();

        for bad in [0.0, -1.0] {
            let err = jump_relu(&x, &theta, Kernel::Gaussian, bad).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<CoreError>(),
                Some(CoreError::Config(_))
            ));
        }
    }

    #[test]
    fn test_threshold_shape_mismatch() {
        let device = Device::Cpu;
        let x = tensor_2x3(&device, [0.0; 6]);
        let theta = Tensor::zeros((4,), candle_core::DType::F32, &device).unwrap();

        let err = heaviside(&x, &theta, Kernel::Gaussian, 1.0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::Shape(_))
        ));
    }

    #[test]
    fn test_jump_relu_backward_formula() {
        let device = Device::Cpu;
        let x = tensor_2x3(&device, [0.3, -0.1, 1.0, 0.6, 0.2, -2.0]);
        let theta = Tensor::from_vec(vec![0.5f32, 0.0, 0.1], (3,), &device).unwrap();
        let grad_out = tensor_2x3(&device, [1.0; 6]);
        let bandwidth = 1.0;

        let (grad_x, grad_theta) =
            jump_relu_backward(&x, &theta, &grad_out, Kernel::Gaussian, bandwidth).unwrap();

        // input gradient masks exactly like the forward
        let gx: Vec<Vec<f32>> = grad_x.to_vec2().unwrap();
        assert_eq!(gx[0], vec![0.0, 0.0, 1.0]);
        assert_eq!(gx[1], vec![1.0, 1.0, 0.0]);

        // threshold gradient: -(theta/b) * K(delta/b) summed over samples
        let gt: Vec<f32> = grad_theta.to_vec1().unwrap();
        assert_eq!(gt.len(), 3);
        let expected_0: f32 = [0.3f32, 0.6]
            .iter()
            .map(|&v| -(0.5 / 1.0) * Kernel::Gaussian.weight(v - 0.5))
            .sum();
        assert!((gt[0] - expected_0).abs() < 1e-5);
        // theta[1] = 0 cancels the whole gradient for that component
        assert!(gt[1].abs() < 1e-7);
    }

    #[test]
    fn test_heaviside_backward_formula() {
        let device = Device::Cpu;
        let x = tensor_2x3(&device, [0.3, -0.1, 1.0, 0.6, 0.2, -2.0]);
        let theta = Tensor::from_vec(vec![0.5f32, 0.0, 0.1], (3,), &device).unwrap();
        let grad_out = tensor_2x3(&device, [1.0; 6]);
        let bandwidth = 0.5;

        let (grad_x, grad_theta) =
            heaviside_backward(&x, &theta, &grad_out, Kernel::Epanechnikov, bandwidth).unwrap();

        // no gradient path through the input
        let gx: Vec<Vec<f32>> = grad_x.to_vec2().unwrap();
        assert_eq!(gx, vec![vec![0.0; 3]; 2]);

        let gt: Vec<f32> = grad_theta.to_vec1().unwrap();
        let expected_0: f32 = [0.3f32, 0.6]
            .iter()
            .map(|&v| -(1.0 / 0.5) * Kernel::Epanechnikov.weight((v - 0.5) / 0.5))
            .sum();
        assert!((gt[0] - expected_0).abs() < 1e-5);
    }

    #[test]
    fn test_compact_kernel_zero_gradient_far_from_threshold() {
        let device = Device::Cpu;
        // every delta is far outside the triangular kernel's support
        let x = tensor_2x3(&device, [5.0, 6.0, -7.0, 8.0, -5.0, 9.0]);
        let theta = Tensor::from_vec(vec![0.5f32, 0.5, 0.5], (3,), &device).unwrap();
        let grad_out = tensor_2x3(&device, [1.0; 6]);

        let (_, grad_theta) =
            heaviside_backward(&x, &theta, &grad_out, Kernel::Triangular, 1.0).unwrap();
        let gt: Vec<f32> = grad_theta.to_vec1().unwrap();
        assert_eq!(gt, vec![0.0; 3]);
    }

    #[test]
    fn test_autodiff_reaches_threshold_var() {
        let device = Device::Cpu;
        let x = tensor_2x3(&device, [0.3, -0.1, 1.0, 0.6, 0.2, -2.0]);
        let theta =
            Var::from_tensor(&Tensor::from_vec(vec![0.0f32; 3], (3,), &device).unwrap()).unwrap();

        let out = heaviside(&x, theta.as_tensor(), Kernel::Gaussian, 1.0).unwrap();
        let loss = out.sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let grad_theta = grads.get(&theta).expect("threshold gradient missing");
        assert_eq!(grad_theta.dims(), &[3]);

        // -(1/b) * sum_i K(x_ij) with g = 1: strictly negative where the
        // kernel sees any mass
        let gt: Vec<f32> = grad_theta.to_vec1().unwrap();
        for g in gt {
            assert!(g < 0.0, "expected negative pseudo-gradient, got {g}");
        }
    }

    #[test]
    fn test_jump_relu_autodiff_nonzero_threshold() {
        let device = Device::Cpu;
        let x = tensor_2x3(&device, [0.3, -0.1, 1.0, 0.6, 0.2, -2.0]);
        let theta =
            Var::from_tensor(&Tensor::from_vec(vec![0.5f32; 3], (3,), &device).unwrap()).unwrap();

        let out = jump_relu(&x, theta.as_tensor(), Kernel::Gaussian, 1.0).unwrap();
        let loss = out.sum_all().unwrap();
        let grads = loss.backward().unwrap();

        // -(theta/b) * sum_i K(x_ij - theta) with g = 1: nonzero and negative
        // for a positive threshold under a gaussian kernel
        let grad_theta = grads.get(&theta).expect("threshold gradient missing");
        assert_eq!(grad_theta.dims(), &[3]);
        let gt: Vec<f32> = grad_theta.to_vec1().unwrap();
        for g in gt {
            assert!(g < 0.0, "expected negative pseudo-gradient, got {g}");
        }
    }
}
