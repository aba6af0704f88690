//! Smoothing kernels for surrogate-gradient estimation
//!
//! Each kernel is a bounded, symmetric, unit-area density shape evaluated at
//! the scaled delta `u = (x - threshold) / bandwidth`. The surrogate-gradient
//! ops use these as localized weights around the threshold; the `1/bandwidth`
//! factor of the density estimate is applied by the ops themselves, not here.
//!
//! Compact-support kernels (rectangle, triangular, epanechnikov, quartic, and
//! cosine with support `|u| <= pi/2`) return exactly zero outside their
//! support, which makes the threshold gradient exactly zero far from the jump.

use candle_core::{Result, Tensor};

use crate::error::CoreError;

/// Closed registry of smoothing kernels, pinned at model construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Rectangle,
    Gaussian,
    Triangular,
    Cosine,
    Epanechnikov,
    Quartic,
    Silverman,
    Cauchy,
}

impl Kernel {
    /// All registered kernels, in registry order
    pub fn all() -> &'static [Kernel] {
        &[
            Kernel::Rectangle,
            Kernel::Gaussian,
            Kernel::Triangular,
            Kernel::Cosine,
            Kernel::Epanechnikov,
            Kernel::Quartic,
            Kernel::Silverman,
            Kernel::Cauchy,
        ]
    }

    /// Registry name of this kernel
    pub fn name(self) -> &'static str {
        match self {
            Kernel::Rectangle => "rectangle",
            Kernel::Gaussian => "gaussian",
            Kernel::Triangular => "triangular",
            Kernel::Cosine => "cosine",
            Kernel::Epanechnikov => "epanechnikov",
            Kernel::Quartic => "quartic",
            Kernel::Silverman => "silverman",
            Kernel::Cauchy => "cauchy",
        }
    }

    /// Resolve a kernel by registry name.
    ///
    /// Fails at construction time with a `Config` error listing the valid
    /// options; an unknown kernel must never survive until first use.
    pub fn from_name(name: &str) -> anyhow::Result<Kernel> {
        Kernel::all()
            .iter()
            .copied()
            .find(|k| k.name() == name)
            .ok_or_else(|| {
                let valid: Vec<&str> = Kernel::all().iter().map(|k| k.name()).collect();
                CoreError::Config(format!(
                    "unknown kernel '{name}', valid options: {valid:?}"
                ))
                .into()
            })
    }

    /// Evaluate the unit kernel K(u) at a single scaled delta
    pub fn weight(self, u: f32) -> f32 {
        let a = u.abs();
        match self {
            Kernel::Rectangle => {
                if a <= 1.0 {
                    0.5
                } else {
                    0.0
                }
            }
            Kernel::Gaussian => (-0.5 * u * u).exp() / (2.0 * std::f32::consts::PI).sqrt(),
            Kernel::Triangular => (1.0 - a).max(0.0),
            Kernel::Cosine => {
                if a <= std::f32::consts::FRAC_PI_2 {
                    0.5 * u.cos()
                } else {
                    0.0
                }
            }
            Kernel::Epanechnikov => (0.75 * (1.0 - u * u)).max(0.0),
            Kernel::Quartic => {
                if a <= 1.0 {
                    let s = 1.0 - u * u;
                    15.0 / 16.0 * s * s
                } else {
                    0.0
                }
            }
            Kernel::Silverman => {
                let v = a / std::f32::consts::SQRT_2;
                0.5 * (-v).exp() * (v + std::f32::consts::FRAC_PI_4).sin()
            }
            Kernel::Cauchy => 1.0 / (std::f32::consts::PI * (1.0 + u * u)),
        }
    }

    /// Elementwise K(delta / bandwidth), same shape as `delta`.
    ///
    /// The caller guarantees `bandwidth > 0`; the public activation entry
    /// points validate it before any tensor work.
    pub fn evaluate(self, delta: &Tensor, bandwidth: f64) -> Result<Tensor> {
        let u = (delta / bandwidth)?;
        let zeros = u.zeros_like()?;
        match self {
            Kernel::Rectangle => {
                let inside = u.abs()?.le(1.0)?;
                inside.where_cond(&(u.ones_like()? * 0.5)?, &zeros)
            }
            Kernel::Gaussian => {
                let norm = 1.0 / (2.0 * std::f64::consts::PI).sqrt();
                (u.sqr()? * -0.5)?.exp()? * norm
            }
            Kernel::Triangular => (u.abs()?.neg()? + 1.0)?.relu(),
            Kernel::Cosine => {
                let inside = u.abs()?.le(std::f64::consts::FRAC_PI_2)?;
                inside.where_cond(&(u.cos()? * 0.5)?, &zeros)
            }
            Kernel::Epanechnikov => ((u.sqr()?.neg()? + 1.0)? * 0.75)?.relu(),
            Kernel::Quartic => {
                let inside = u.abs()?.le(1.0)?;
                let s = (u.sqr()?.neg()? + 1.0)?;
                inside.where_cond(&(s.sqr()? * (15.0 / 16.0))?, &zeros)
            }
            Kernel::Silverman => {
                let v = (u.abs()? / std::f64::consts::SQRT_2)?;
                let decay = v.neg()?.exp()?;
                let wave = (v + std::f64::consts::FRAC_PI_4)?.sin()?;
                (decay * wave)? * 0.5
            }
            Kernel::Cauchy => {
                let denom = ((u.sqr()? + 1.0)? * std::f64::consts::PI)?;
                denom.recip()
            }
        }
    }
}

impl std::str::FromStr for Kernel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Kernel::from_name(s)
    }
}

impl std::fmt::Display for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_registry_roundtrip() {
        for &kernel in Kernel::all() {
            assert_eq!(Kernel::from_name(kernel.name()).unwrap(), kernel);
        }
    }

    #[test]
    fn test_unknown_kernel_fails_with_config_error() {
        let err = Kernel::from_name("sinc").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::CoreError>(),
            Some(crate::error::CoreError::Config(_))
        ));
        // error message lists the valid options
        assert!(err.to_string().contains("gaussian"));
    }

    #[test]
    fn test_max_at_zero() {
        for &kernel in Kernel::all() {
            let at_zero = kernel.weight(0.0);
            for u in [-2.0f32, -0.7, -0.1, 0.1, 0.7, 2.0] {
                assert!(
                    kernel.weight(u) <= at_zero + 1e-7,
                    "{kernel} not maximal at 0: K({u}) = {} > K(0) = {at_zero}",
                    kernel.weight(u)
                );
            }
        }
    }

    #[test]
    fn test_symmetry() {
        for &kernel in Kernel::all() {
            for u in [0.1f32, 0.5, 1.0, 1.3, 3.0] {
                let diff = (kernel.weight(u) - kernel.weight(-u)).abs();
                assert!(diff < 1e-7, "{kernel} not symmetric at {u}");
            }
        }
    }

    #[test]
    fn test_compact_support_exact_zero() {
        let compact = [
            Kernel::Rectangle,
            Kernel::Triangular,
            Kernel::Epanechnikov,
            Kernel::Quartic,
        ];
        for kernel in compact {
            assert_eq!(kernel.weight(1.5), 0.0, "{kernel} nonzero outside support");
            assert_eq!(kernel.weight(-10.0), 0.0);
        }
        // cosine support ends at pi/2
        assert_eq!(Kernel::Cosine.weight(2.0), 0.0);
        assert!(Kernel::Cosine.weight(1.5) > 0.0);
    }

    #[test]
    fn test_known_values() {
        assert!((Kernel::Rectangle.weight(0.0) - 0.5).abs() < 1e-7);
        assert!((Kernel::Gaussian.weight(0.0) - 0.398_942_3).abs() < 1e-5);
        assert!((Kernel::Triangular.weight(0.5) - 0.5).abs() < 1e-7);
        assert!((Kernel::Epanechnikov.weight(0.0) - 0.75).abs() < 1e-7);
        assert!((Kernel::Quartic.weight(0.0) - 15.0 / 16.0).abs() < 1e-7);
        assert!((Kernel::Cosine.weight(0.0) - 0.5).abs() < 1e-7);
        assert!((Kernel::Cauchy.weight(0.0) - 1.0 / std::f32::consts::PI).abs() < 1e-6);
        // silverman at 0: 0.5 * sin(pi/4)
        let expected = 0.5 * std::f32::consts::FRAC_PI_4.sin();
        assert!((Kernel::Silverman.weight(0.0) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_tensor_evaluation_matches_scalar() {
        let device = Device::Cpu;
        let deltas = vec![-2.0f32, -0.5, 0.0, 0.3, 1.0, 4.0];
        let bandwidth = 0.7;
        let t = Tensor::from_vec(deltas.clone(), (6,), &device).unwrap();

        for &kernel in Kernel::all() {
            let out: Vec<f32> = kernel.evaluate(&t, bandwidth).unwrap().to_vec1().unwrap();
            for (delta, got) in deltas.iter().zip(out.iter()) {
                let want = kernel.weight(delta / bandwidth as f32);
                assert!(
                    (want - got).abs() < 1e-5,
                    "{kernel} mismatch at delta={delta}: scalar {want} vs tensor {got}"
                );
            }
        }
    }
}
