//! Dense linear-algebra helpers for the Semi-NMF solver
//!
//! The multiplicative-update D-step is a ridge-regularized least squares:
//! `(Z^T Z + ridge * I) D = Z^T X`. The normal matrix is only K x K, so the
//! solve runs on `ndarray` in f64: Cholesky when the regularized matrix is
//! positive definite, Gauss elimination with pivot flooring otherwise (the
//! pseudo-inverse role for rank-deficient codes, e.g. K > N). Degeneracy is
//! absorbed here, never surfaced as an error.

use anyhow::{Context, Result};
use candle_core::Tensor;
use ndarray::Array2;

use crate::error::ensure_2d;

/// Floor applied to Gauss pivots when the normal matrix is singular
const PIVOT_FLOOR: f64 = 1e-10;

/// Convert a 2-D f32 tensor to an f64 ndarray matrix
pub fn to_array2(t: &Tensor, name: &str) -> Result<Array2<f64>> {
    let (rows, cols) = ensure_2d(t, name)?;
    let flat: Vec<f32> = t.flatten_all()?.to_vec1()?;
    let data: Vec<f64> = flat.into_iter().map(f64::from).collect();
    Array2::from_shape_vec((rows, cols), data).context("Failed to build ndarray matrix")
}

/// Convert an f64 ndarray matrix back to an f32 tensor on the given device
pub fn from_array2(a: &Array2<f64>, device: &candle_core::Device) -> Result<Tensor> {
    let (rows, cols) = a.dim();
    let data: Vec<f32> = a.iter().map(|&v| v as f32).collect();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

/// Solve `(gram + ridge * I) out = rhs` for `out`.
///
/// `gram` is K x K symmetric, `rhs` is K x D. Tries Cholesky first; on a
/// non-positive pivot falls back to partial-pivot Gauss elimination with
/// floored pivots so a singular normal matrix still yields finite output.
pub fn solve_normal_equations(gram: &Tensor, rhs: &Tensor, ridge: f64) -> Result<Tensor> {
    let device = gram.device().clone();
    let mut a = to_array2(gram, "gram")?;
    let b = to_array2(rhs, "rhs")?;

    let k = a.nrows();
    anyhow::ensure!(
        a.ncols() == k,
        "gram matrix must be square, got {}x{}",
        k,
        a.ncols()
    );
    anyhow::ensure!(
        b.nrows() == k,
        "rhs must have {} rows to match gram, got {}",
        k,
        b.nrows()
    );

    for i in 0..k {
        a[[i, i]] += ridge;
    }

    let solution = match cholesky_solve(&a, &b) {
        Some(x) => x,
        None => gauss_solve(a, b),
    };
    from_array2(&solution, &device)
}

/// Cholesky factorization + two triangular solves; None if not positive definite
fn cholesky_solve(a: &Array2<f64>, b: &Array2<f64>) -> Option<Array2<f64>> {
    let k = a.nrows();
    let d = b.ncols();
    let mut l = Array2::<f64>::zeros((k, k));

    for i in 0..k {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for p in 0..j {
                sum -= l[[i, p]] * l[[j, p]];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    // L y = b, then L^T x = y, column by column
    let mut x = Array2::<f64>::zeros((k, d));
    for c in 0..d {
        let mut y = vec![0.0f64; k];
        for i in 0..k {
            let mut sum = b[[i, c]];
            for p in 0..i {
                sum -= l[[i, p]] * y[p];
            }
            y[i] = sum / l[[i, i]];
        }
        for i in (0..k).rev() {
            let mut sum = y[i];
            for p in (i + 1)..k {
                sum -= l[[p, i]] * x[[p, c]];
            }
            x[[i, c]] = sum / l[[i, i]];
        }
    }
    Some(x)
}

/// Gauss elimination with partial pivoting and floored pivots
fn gauss_solve(mut a: Array2<f64>, mut b: Array2<f64>) -> Array2<f64> {
    let k = a.nrows();
    let d = b.ncols();

    for col in 0..k {
        // partial pivot
        let mut pivot_row = col;
        let mut pivot_val = a[[col, col]].abs();
        for row in (col + 1)..k {
            if a[[row, col]].abs() > pivot_val {
                pivot_val = a[[row, col]].abs();
                pivot_row = row;
            }
        }
        if pivot_row != col {
            for j in 0..k {
                let tmp = a[[col, j]];
                a[[col, j]] = a[[pivot_row, j]];
                a[[pivot_row, j]] = tmp;
            }
            for j in 0..d {
                let tmp = b[[col, j]];
                b[[col, j]] = b[[pivot_row, j]];
                b[[pivot_row, j]] = tmp;
            }
        }

        let mut pivot = a[[col, col]];
        if pivot.abs() < PIVOT_FLOOR {
            pivot = if pivot < 0.0 { -PIVOT_FLOOR } else { PIVOT_FLOOR };
            a[[col, col]] = pivot;
        }

        for row in (col + 1)..k {
            let factor = a[[row, col]] / pivot;
            if factor == 0.0 {
                continue;
            }
            for j in col..k {
                a[[row, j]] -= factor * a[[col, j]];
            }
            for j in 0..d {
                b[[row, j]] -= factor * b[[col, j]];
            }
        }
    }

    let mut x = Array2::<f64>::zeros((k, d));
    for c in 0..d {
        for i in (0..k).rev() {
            let mut sum = b[[i, c]];
            for p in (i + 1)..k {
                sum -= a[[i, p]] * x[[p, c]];
            }
            x[[i, c]] = sum / a[[i, i]];
        }
    }
    x
}

/// Frobenius norm of a tensor
pub fn frobenius_norm(t: &Tensor) -> Result<f32> {
    Ok(t.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
        a.matmul(b).unwrap()
    }

    #[test]
    fn test_solve_identity() {
        let device = Device::Cpu;
        let gram = Tensor::from_vec(
            vec![1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            (3, 3),
            &device,
        )
        .unwrap();
        let rhs =
            Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), &device).unwrap();

        let x = solve_normal_equations(&gram, &rhs, 0.0).unwrap();
        let diff: Vec<f32> = (x - &rhs).unwrap().abs().unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(diff.iter().all(|&v| v < 1e-6));
    }

    #[test]
    fn test_solve_spd_system() {
        let device = Device::Cpu;
        // gram = M^T M is SPD for a full-rank M
        let m = Tensor::from_vec(
            vec![2.0f32, 1.0, 0.5, -1.0, 1.5, 3.0, 0.0, 2.0, 1.0, 1.0, -0.5, 0.5],
            (4, 3),
            &device,
        )
        .unwrap();
        let gram = matmul(&m.t().unwrap(), &m);
        let truth = Tensor::from_vec(vec![1.0f32, -2.0, 0.5, 3.0, 2.0, -1.0], (3, 2), &device)
            .unwrap();
        let rhs = matmul(&gram, &truth);

        let x = solve_normal_equations(&gram, &rhs, 0.0).unwrap();
        let err: Vec<f32> = (x - &truth)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(err.iter().all(|&v| v < 1e-4), "solve error too large: {err:?}");
    }

    #[test]
    fn test_singular_gram_still_finite() {
        let device = Device::Cpu;
        // rank-1 gram: Cholesky fails, Gauss fallback with floored pivots
        let gram = Tensor::from_vec(
            vec![1.0f32, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            (3, 3),
            &device,
        )
        .unwrap();
        let rhs = Tensor::from_vec(vec![1.0f32, 1.0, 1.0], (3, 1), &device).unwrap();

        let x = solve_normal_equations(&gram, &rhs, 0.0).unwrap();
        let vals: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_frobenius_norm() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![3.0f32, 4.0], (1, 2), &device).unwrap();
        assert!((frobenius_norm(&t).unwrap() - 5.0).abs() < 1e-6);
    }
}
