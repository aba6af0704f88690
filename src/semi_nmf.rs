//! Semi-nonnegative matrix factorization by alternating optimization
//!
//! Factors an activation matrix X (n_samples x dims) into nonnegative codes
//! Z (n_samples x n_components) and an unconstrained-sign dictionary
//! D (n_components x dims) minimizing ||X - Z D||_F^2, optionally with an L1
//! penalty on Z.
//!
//! Two interchangeable update strategies, selected once at construction:
//!
//! - `mu`: the multiplicative rule of Ding et al. for semi-NMF. D is the
//!   closed-form ridge least-squares solve given Z; Z is rescaled by the
//!   square-rooted ratio of the positive and negative parts of the objective
//!   gradient, which keeps Z nonnegative and the objective non-increasing.
//! - `pgd`: plain gradient steps with Lipschitz-bounded step sizes, Z
//!   projected onto the nonnegative orthant after each step.
//!
//! Iteration stops at `max_iter` or when the relative change of the Frobenius
//! reconstruction error falls below `tol`. Degenerate inputs (all-zero X,
//! K > n_samples) terminate with finite output; every division carries an
//! epsilon floor.

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::debug;

use crate::error::{ensure_2d, CoreError};
use crate::linalg::{frobenius_norm, solve_normal_equations};

/// Ridge coefficient for the least-squares D-update
const RIDGE: f64 = 1e-6;
/// Floor for multiplicative denominators and step-size divisors
pub(crate) const EPS: f64 = 1e-8;

/// Update-rule strategy for the alternating loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Solver {
    /// Multiplicative updates (monotone non-increasing objective)
    Mu,
    /// Projected gradient descent
    Pgd,
}

impl Solver {
    pub fn name(self) -> &'static str {
        match self {
            Solver::Mu => "mu",
            Solver::Pgd => "pgd",
        }
    }
}

impl std::str::FromStr for Solver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mu" => Ok(Solver::Mu),
            "pgd" => Ok(Solver::Pgd),
            other => Err(CoreError::Config(format!(
                "unknown solver '{other}', valid options: [\"mu\", \"pgd\"]"
            ))
            .into()),
        }
    }
}

impl std::fmt::Display for Solver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for a [`SemiNmf`] model
#[derive(Debug, Clone)]
pub struct SemiNmfConfig {
    /// Target rank K of the factorization
    pub n_components: usize,
    /// Update-rule strategy
    pub solver: Solver,
    /// Maximum number of alternating iterations
    pub max_iter: usize,
    /// Relative-decrease early-stop tolerance on the reconstruction error
    /// (0.0 disables early stopping)
    pub tol: f64,
    /// L1 coefficient on Z (never applied to D)
    pub l1_penalty: f64,
    /// Seed for the random Z initialization
    pub seed: u64,
}

impl SemiNmfConfig {
    pub fn new(n_components: usize) -> Self {
        Self {
            n_components,
            solver: Solver::Mu,
            max_iter: 500,
            tol: 1e-5,
            l1_penalty: 0.0,
            seed: 42,
        }
    }
}

/// Summary of a completed fit
#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    /// Number of alternating iterations actually run
    pub iterations: usize,
    /// Frobenius reconstruction error after each iteration
    pub errors: Vec<f32>,
    /// Final Frobenius reconstruction error
    pub final_error: f32,
    /// Whether the tolerance fired before `max_iter`
    pub converged: bool,
}

/// Fitted factors, exclusively owned by the model
#[derive(Debug)]
struct FittedState {
    z: Tensor,
    d: Tensor,
    dims: usize,
}

/// Semi-NMF dictionary-learning model
#[derive(Debug)]
pub struct SemiNmf {
    config: SemiNmfConfig,
    device: Device,
    state: Option<FittedState>,
    report: Option<FitReport>,
}

impl SemiNmf {
    /// Create an unfitted model; configuration is validated here, not at fit
    pub fn new(config: SemiNmfConfig, device: &Device) -> Result<Self> {
        if config.n_components == 0 {
            return Err(CoreError::Config("n_components must be at least 1".into()).into());
        }
        if config.max_iter == 0 {
            return Err(CoreError::Config("max_iter must be at least 1".into()).into());
        }
        if config.l1_penalty < 0.0 {
            return Err(CoreError::Config(format!(
                "l1_penalty must be nonnegative, got {}",
                config.l1_penalty
            ))
            .into());
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

    /// Dictionary seeded by the ridge least-squares solve against `z`
    pub fn init_random_d(&self, x: &Tensor, z: &Tensor) -> Result<Tensor> {
        ensure_2d(x, "x")?;
        update_d_least_squares(x, z)
    }

    /// Fit the factorization; returns clones of (Z, D).
    ///
    /// Z is entrywise nonnegative, shape (n_samples, n_components); D is
    /// unconstrained in sign, shape (n_components, dims). X is never mutated.
    pub fn fit(&mut self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (n, dims) = ensure_2d(x, "x")?;
        if n == 0 || dims == 0 {
            return Err(CoreError::Shape(format!(
                "cannot fit an empty matrix, got shape ({n}, {dims})"
            ))
            .into());
        }

        debug!(
            "Fitting semi-NMF: {} samples, {} dims, {} components, solver={}",
            n,
            dims,
            self.config.n_components,
            self.config.solver
        );

        let mut z = self.init_random_z(x)?;
        let mut d = self.init_random_d(x, &z)?;

        let lambda = self.config.l1_penalty;
        let max_iter = self.config.max_iter;
        let mut errors = Vec::with_capacity(max_iter);
        let mut prev = reconstruction_error(x, &z, &d)?;
        let mut converged = false;

        for iteration in 0..max_iter {
            match self.config.solver {
                Solver::Mu => {
                    d = update_d_least_squares(x, &z)?;
                    z = mu_update_z(x, &z, &d, lambda)?;
                }
                Solver::Pgd => {
                    d = pgd_update_d(x, &z, &d)?;
                    z = pgd_update_z(x, &z, &d, lambda)?;
                }
            }

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
    /// Re-solves Z for `x` with D held fixed, running the configured Z update
    /// rule from a fresh seeded initialization, capped at `max_iter`.
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

        let lambda = self.config.l1_penalty;
        let mut z = self.init_random_z(x)?;
        let mut prev = reconstruction_error(x, &z, &state.d)?;

        for _ in 0..self.config.max_iter {
            z = match self.config.solver {
                Solver::Mu => mu_update_z(x, &z, &state.d, lambda)?,
                Solver::Pgd => pgd_update_z(x, &z, &state.d, lambda)?,
            };
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

pub(crate) fn reconstruction_error(x: &Tensor, z: &Tensor, d: &Tensor) -> Result<f32> {
    frobenius_norm(&(x - z.matmul(d)?)?)
}

pub(crate) fn relative_change(prev: f32, current: f32) -> f32 {
    (prev - current).abs() / prev.max(EPS as f32)
}

/// Closed-form D-update: (Z^T Z + ridge I)^-1 Z^T X
fn update_d_least_squares(x: &Tensor, z: &Tensor) -> Result<Tensor> {
    let gram = z.t()?.matmul(z)?;
    let rhs = z.t()?.matmul(x)?;
    solve_normal_equations(&gram, &rhs, RIDGE)
}

/// Multiplicative Z-update (Ding et al.):
/// Z <- Z * sqrt(((X D^T)+ + Z (D D^T)-) / ((X D^T)- + Z (D D^T)+ + lambda))
///
/// The positive/negative split keeps both numerator and denominator
/// nonnegative, so Z stays in the nonnegative orthant by construction. The L1
/// coefficient lands in the denominator (standard multiplicative treatment)
/// and the epsilon floor keeps the ratio finite for all-zero inputs.
fn mu_update_z(x: &Tensor, z: &Tensor, d: &Tensor, lambda: f64) -> Result<Tensor> {
    let xdt = x.matmul(&d.t()?)?;
    let ddt = d.matmul(&d.t()?)?;

    let (xdt_pos, xdt_neg) = positive_negative_parts(&xdt)?;
    let (ddt_pos, ddt_neg) = positive_negative_parts(&ddt)?;

    let numerator = (xdt_pos + z.matmul(&ddt_neg)?)?;
    let denominator = ((xdt_neg + z.matmul(&ddt_pos)?)? + (lambda + EPS))?;

    let ratio = (numerator / denominator)?.sqrt()?;
    Ok(z.mul(&ratio)?)
}

/// Split a matrix into its entrywise positive and negative parts
fn positive_negative_parts(a: &Tensor) -> Result<(Tensor, Tensor)> {
    let abs = a.abs()?;
    let pos = ((&abs + a)? * 0.5)?;
    let neg = ((&abs - a)? * 0.5)?;
    Ok((pos, neg))
}

/// Gradient D-step, no projection (D is unconstrained in sign).
///
/// Step size 1 / ||Z^T Z||_F bounds the gradient's Lipschitz constant, so a
/// fixed step cannot diverge.
fn pgd_update_d(x: &Tensor, z: &Tensor, d: &Tensor) -> Result<Tensor> {
    let residual = (z.matmul(d)? - x)?;
    let grad = z.t()?.matmul(&residual)?;
    let lipschitz = frobenius_norm(&z.t()?.matmul(z)?)? as f64 + EPS;
    Ok((d - (grad * (1.0 / lipschitz))?)?)
}

/// Gradient Z-step with the L1 subgradient, projected onto Z >= 0
fn pgd_update_z(x: &Tensor, z: &Tensor, d: &Tensor, lambda: f64) -> Result<Tensor> {
    let residual = (z.matmul(d)? - x)?;
    let grad = (residual.matmul(&d.t()?)? + lambda)?;
    let lipschitz = frobenius_norm(&d.matmul(&d.t()?)?)? as f64 + EPS;
    Ok((z - (grad * (1.0 / lipschitz))?)?.relu()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 50;
    const DIMS: usize = 10;
    const K: usize = 5;

    fn uniform_matrix(n: usize, dims: usize, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..n * dims).map(|_| rng.gen_range(0.0..1.0)).collect();
        Tensor::from_vec(data, (n, dims), &Device::Cpu).unwrap()
    }

    fn signed_matrix(n: usize, dims: usize, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..n * dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Tensor::from_vec(data, (n, dims), &Device::Cpu).unwrap()
    }

    fn all_nonnegative(t: &Tensor) -> bool {
        t.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|&v| v >= 0.0)
    }

    fn model(solver: Solver, max_iter: usize) -> SemiNmf {
        let mut config = SemiNmfConfig::new(K);
        config.solver = solver;
        config.max_iter = max_iter;
        SemiNmf::new(config, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_initialization() {
        for solver in [Solver::Mu, Solver::Pgd] {
            let m = model(solver, 10);
            assert_eq!(m.n_components(), K);
            assert!(!m.is_fitted());
        }
    }

    #[test]
    fn test_invalid_config() {
        let err = SemiNmf::new(SemiNmfConfig::new(0), &Device::Cpu).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::Config(_))
        ));

        let mut config = SemiNmfConfig::new(K);
        config.l1_penalty = -0.5;
        assert!(SemiNmf::new(config, &Device::Cpu).is_err());
    }

    #[test]
    fn test_unknown_solver_name() {
        let err = "hals".parse::<Solver>().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::Config(_))
        ));
        assert_eq!("mu".parse::<Solver>().unwrap(), Solver::Mu);
        assert_eq!("pgd".parse::<Solver>().unwrap(), Solver::Pgd);
    }

    #[test]
    fn test_fit_shapes_and_nonnegativity() {
        let x = uniform_matrix(N, DIMS, 0);
        for solver in [Solver::Mu, Solver::Pgd] {
            let mut m = model(solver, 2);
            let (z, d) = m.fit(&x).unwrap();
            assert_eq!(z.dims(), &[N, K]);
            assert_eq!(d.dims(), &[K, DIMS]);
            assert!(all_nonnegative(&z), "negative codes with {solver}");
            assert!(m.is_fitted());
            assert!(m.report().is_some(), "no report after fit with {solver}");
        }
    }

    #[test]
    fn test_fit_negative_data() {
        let x = signed_matrix(N, DIMS, 7);
        for solver in [Solver::Mu, Solver::Pgd] {
            let mut m = model(solver, 50);
            let (z, _d) = m.fit(&x).unwrap();
            // Z stays nonnegative even on signed data; D is free to go negative
            assert!(all_nonnegative(&z), "negative codes with {solver}");
        }
    }

    #[test]
    fn test_encode_decode_shapes() {
        let x = uniform_matrix(N, DIMS, 3);
        for solver in [Solver::Mu, Solver::Pgd] {
            let mut m = model(solver, 2);
            m.fit(&x).unwrap();

            let z = m.encode(&x).unwrap();
            assert_eq!(z.dims(), &[N, K]);
            assert!(all_nonnegative(&z));

            let x_hat = m.decode(&z).unwrap();
            assert_eq!(x_hat.dims(), &[N, DIMS]);
        }
    }

    #[test]
    fn test_mu_monotone_descent() {
        let x = uniform_matrix(N, DIMS, 11);
        let mut m = model(Solver::Mu, 100);
        m.fit(&x).unwrap();

        let errors = &m.report().unwrap().errors;
        assert!(errors.len() > 1);
        for pair in errors.windows(2) {
            assert!(
                pair[1] <= pair[0] + 1e-4,
                "error increased: {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_error_decreases_from_initialization() {
        let x = uniform_matrix(N, DIMS, 5);
        for solver in [Solver::Mu, Solver::Pgd] {
            let mut m = model(solver, 100);
            let init_z = m.init_random_z(&x).unwrap();
            let init_d = m.init_random_d(&x, &init_z).unwrap();
            let initial = reconstruction_error(&x, &init_z, &init_d).unwrap();

            m.fit(&x).unwrap();
            let z = m.encode(&x).unwrap();
            let x_hat = m.decode(&z).unwrap();
            let fitted = frobenius_norm(&(&x - &x_hat).unwrap()).unwrap();

            assert!(all_nonnegative(&z));
            assert!(
                fitted < initial,
                "{solver}: error did not decrease ({initial} -> {fitted})"
            );
        }
    }

    #[test]
    fn test_zero_data() {
        let x = Tensor::zeros((N, DIMS), candle_core::DType::F32, &Device::Cpu).unwrap();
        for solver in [Solver::Mu, Solver::Pgd] {
            let mut m = model(solver, 100);
            let (z, d) = m.fit(&x).unwrap();
            let err = frobenius_norm(&(&x - z.matmul(&d).unwrap()).unwrap()).unwrap();
            assert!(all_nonnegative(&z));
            assert!(err < 1e-5, "{solver}: zero data not reconstructed ({err})");
        }
    }

    #[test]
    fn test_more_components_than_samples() {
        let x = uniform_matrix(8, 4, 13);
        for solver in [Solver::Mu, Solver::Pgd] {
            let mut config = SemiNmfConfig::new(20);
            config.solver = solver;
            config.max_iter = 20;
            let mut m = SemiNmf::new(config, &Device::Cpu).unwrap();
            let (z, d) = m.fit(&x).unwrap();
            assert_eq!(z.dims(), &[8, 20]);
            assert_eq!(d.dims(), &[20, 4]);
            let err = reconstruction_error(&x, &z, &d).unwrap();
            assert!(err.is_finite());
        }
    }

    #[test]
    fn test_unfitted_usage_fails() {
        let m = model(Solver::Mu, 10);
        let x = uniform_matrix(4, DIMS, 0);
        for err in [
            m.encode(&x).unwrap_err(),
            m.get_dictionary().unwrap_err(),
        ] {
            assert!(matches!(
                err.downcast_ref::<CoreError>(),
                Some(CoreError::NotFitted(_))
            ));
        }
    }

    #[test]
    fn test_decode_shape_mismatch() {
        let x = uniform_matrix(N, DIMS, 1);
        let mut m = model(Solver::Mu, 2);
        m.fit(&x).unwrap();

        let bad_z = uniform_matrix(N, K + 1, 2);
        let err = m.decode(&bad_z).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::Shape(_))
        ));

        let bad_x = uniform_matrix(N, DIMS + 3, 2);
        assert!(m.encode(&bad_x).is_err());
    }

    #[test]
    fn test_report_is_serializable() {
        let x = uniform_matrix(N, DIMS, 9);
        let mut m = model(Solver::Mu, 5);
        m.fit(&x).unwrap();
        let json = serde_json::to_string(m.report().unwrap()).unwrap();
        assert!(json.contains("final_error"));
    }
}
