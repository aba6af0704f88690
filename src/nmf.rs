//! Plain nonnegative matrix factorization
//!
//! Both factors are constrained nonnegative, unlike [`crate::semi_nmf`] where
//! only the codes are. Uses the classical multiplicative (Lee-Seung) updates:
//!
//! - D <- D * (Z^T X) / (Z^T Z D + eps)
//! - Z <- Z * (X D^T) / (Z D D^T + eps)
//!
//! Ratios of nonnegative quantities keep both factors in the nonnegative
//! orthant by construction, and the objective is non-increasing. The input
//! itself must be entrywise nonnegative.
//!
//! Being strictly more constrained than semi-NMF on the same data, its
//! reconstruction error upper-bounds what semi-NMF should reach; the
//! end-to-end benchmarks use it as the baseline.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{ensure_2d, CoreError};
use crate::linalg::frobenius_norm;
use crate::semi_nmf::{reconstruction_error, relative_change, FitReport, EPS};

/// Configuration for an [`Nmf`] model
#[derive(Debug, Clone)]
pub struct NmfConfig {
    /// Target rank K of the factorization
    pub n_components: usize,
    /// Maximum number of alternating iterations
    pub max_iter: usize,
    /// Relative-decrease early-stop tolerance on the reconstruction error
    /// (0.0 disables early stopping)
    pub tol: f64,
    /// Seed for the random factor initialization
    pub seed: u64,
}

impl NmfConfig {
    pub fn new(n_components: usize) -> Self {
        Self {
            n_components,
            max_iter: 500,
            tol: 1e-5,
            seed: 42,
        }
    }
}

/// Fitted factors, exclusively owned by the model
#[derive(Debug)]
struct FittedState {
    z: Tensor,
    d: Tensor,
    dims: usize,
}

/// NMF dictionary-learning model, multiplicative updates
#[derive(Debug)]
pub struct Nmf {
    config: NmfConfig,
    device: Device,
    state: Option<FittedState>,
    report: Option<FitReport>,
}

impl Nmf {
    /// Create an unfitted model; configuration is validated here, not at fit
    pub fn new(config: NmfConfig, device: &Device) -> Result<Self> {
        if config.n_components == 0 {
            return Err(CoreError::Config("n_components must be at least 1".into()).into());
        }
        if config.max_iter == 0 {
            return Err(CoreError::Config("max_iter must be at least 1".into()).into());
        }
        if config.tol < 0.0 {
            return Err(CoreError::Config(format!(
                "tol must be nonnegative, got {}",
                config.tol
            ))
            .into());
        }
        Ok(Self {
            config,
            device: device.clone(),
            state: None,
            report: None,
        })
    }

    pub fn n_components(&self) -> usize {
        self.config.n_components
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    /// Report of the last `fit` call, if any
    pub fn report(&self) -> Option<&FitReport> {
        self.report.as_ref()
    }

    /// Random nonnegative codes in [0, 1), shape (n_samples, n_components)
    pub fn init_random_z(&self, x: &Tensor) -> Result<Tensor> {
        let (n, _) = ensure_2d(x, "x")?;
        let k = self.config.n_components;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let data: Vec<f32> = (0..n * k).map(|_| rng.gen_range(0.0..1.0)).collect();
        Ok(Tensor::from_vec(data, (n, k), &self.device)?)
    }

    /// Random nonnegative dictionary in [0, 1), shape (n_components, dims)
    pub fn init_random_d(&self, x: &Tensor) -> Result<Tensor> {
        let (_, dims) = ensure_2d(x, "x")?;
        let k = self.config.n_components;
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));
        let data: Vec<f32> = (0..k * dims).map(|_| rng.gen_range(0.0..1.0)).collect();
        Ok(Tensor::from_vec(data, (k, dims), &self.device)?)
    }

    /// Fit the factorization; returns clones of (Z, D).
    ///
    /// Both factors are entrywise nonnegative: Z has shape
    /// (n_samples, n_components), D has shape (n_components, dims). X must be
    /// entrywise nonnegative and is never mutated.
    pub fn fit(&mut self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (n, dims) = ensure_2d(x, "x")?;
        if n == 0 || dims == 0 {
            return Err(CoreError::Shape(format!(
                "cannot fit an empty matrix, got shape ({n}, {dims})"
            ))
            .into());
        }
        ensure_nonnegative(x)?;

        debug!(
            "Fitting NMF: {} samples, {} dims, {} components",
            n, dims, self.config.n_components
        );

        let mut z = self.init_random_z(x)?;
        let mut d = self.init_random_d(x)?;

        let max_iter = self.config.max_iter;
        let mut errors = Vec::with_capacity(max_iter);
        let mut prev = reconstruction_error(x, &z, &d)?;
        let mut converged = false;

        for iteration in 0..max_iter {
            d = mu_update_d(x, &z, &d)?;
            z = mu_update_z(x, &z, &d)?;

            let err = reconstruction_error(x, &z, &d)?;
            errors.push(err);

            if iteration % 100 == 0 {
                debug!("iteration {iteration}: error = {err:.6}");
            }

            if self.config.tol > 0.0 && relative_change(prev, err) < self.config.tol as f32 {
                converged = true;
                break;
            }
            prev = err;
        }

        let final_error = errors.last().copied().unwrap_or(prev);
        debug!(
            "Fit done after {} iterations, final error = {final_error:.6}",
            errors.len()
        );
        self.report = Some(FitReport {
            iterations: errors.len(),
            errors,
            final_error,
            converged,
        });
        self.state = Some(FittedState {
            z: z.clone(),
            d: d.clone(),
            dims,
        });
        Ok((z, d))
    }

    /// Project new data into the fitted dictionary's code space.
    ///
    /// Re-solves Z for `x` with D held fixed, running multiplicative Z updates
    /// from a fresh seeded initialization, capped at `max_iter`.
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let state = self.require_fitted("encode")?;
        let (_, dims) = ensure_2d(x, "x")?;
        if dims != state.dims {
            return Err(CoreError::Shape(format!(
                "x has {dims} dims but the dictionary was fitted on {}",
                state.dims
            ))
            .into());
        }
        ensure_nonnegative(x)?;

        let mut z = self.init_random_z(x)?;
        let mut prev = reconstruction_error(x, &z, &state.d)?;

        for _ in 0..self.config.max_iter {
            z = mu_update_z(x, &z, &state.d)?;
            let err = reconstruction_error(x, &z, &state.d)?;
            if self.config.tol > 0.0 && relative_change(prev, err) < self.config.tol as f32 {
                break;
            }
            prev = err;
        }
        Ok(z)
    }

    /// Reconstruct activations from codes: Z D
    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        let state = self.require_fitted("decode")?;
        let (_, k) = ensure_2d(z, "z")?;
        if k != self.config.n_components {
            return Err(CoreError::Shape(format!(
                "z has {k} components but the model was configured with {}",
                self.config.n_components
            ))
            .into());
        }
        Ok(z.matmul(&state.d)?)
    }

    /// The learned dictionary, shape (n_components, dims)
    pub fn get_dictionary(&self) -> Result<Tensor> {
        Ok(self.require_fitted("get_dictionary")?.d.clone())
    }

    /// Codes from the last `fit` call, shape (n_samples, n_components)
    pub fn codes(&self) -> Result<Tensor> {
        Ok(self.require_fitted("codes")?.z.clone())
    }

    fn require_fitted(&self, op: &str) -> Result<&FittedState> {
        self.state
            .as_ref()
            .ok_or_else(|| CoreError::NotFitted(format!("call fit before {op}")).into())
    }
}

/// The multiplicative rules divide nonnegative quantities, so a negative
/// entry anywhere in X silently breaks both factor constraints. Rejected
/// up front instead.
fn ensure_nonnegative(x: &Tensor) -> Result<()> {
    let negative_mass = frobenius_norm(&(x.relu()? - x)?)?;
    if negative_mass > 0.0 {
        return Err(CoreError::Unsupported(
            "NMF requires entrywise-nonnegative input; use SemiNmf for signed data".into(),
        )
        .into());
    }
    Ok(())
}

/// D <- D * (Z^T X) / (Z^T Z D + eps)
fn mu_update_d(x: &Tensor, z: &Tensor, d: &Tensor) -> Result<Tensor> {
    let numerator = z.t()?.matmul(x)?;
    let denominator = (z.t()?.matmul(z)?.matmul(d)? + EPS)?;
    Ok(d.mul(&(numerator / denominator)?)?)
}

/// Z <- Z * (X D^T) / (Z D D^T + eps)
fn mu_update_z(x: &Tensor, z: &Tensor, d: &Tensor) -> Result<Tensor> {
    let numerator = x.matmul(&d.t()?)?;
    let denominator = (z.matmul(d)?.matmul(&d.t()?)? + EPS)?;
    Ok(z.mul(&(numerator / denominator)?)?)
}
