//! Dictionary (decoder) layer with row-normalization policies
//!
//! Holds the K x dims basis matrix as a trainable `Var` and exposes it through
//! a normalization policy, so an external optimizer can update the raw weights
//! while every read and every decode sees the normalized rows.

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ensure_2d, CoreError};

/// Floor on row norms to keep normalization finite
const NORM_EPS: f64 = 1e-8;

/// Row-normalization policy applied to the dictionary on read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Raw rows, no rescaling
    Identity,
    /// Rows scaled to unit L2 norm
    L2,
    /// Rows scaled down only when their L2 norm exceeds 1
    MaxL2,
    /// Rows scaled to unit L1 norm
    L1,
}

impl Normalization {
    pub fn name(self) -> &'static str {
        match self {
            Normalization::Identity => "identity",
            Normalization::L2 => "l2",
            Normalization::MaxL2 => "max_l2",
            Normalization::L1 => "l1",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "identity" => Ok(Normalization::Identity),
            "l2" => Ok(Normalization::L2),
            "max_l2" => Ok(Normalization::MaxL2),
            "l1" => Ok(Normalization::L1),
            other => Err(CoreError::Config(format!(
                "unknown normalization '{other}', valid options: [\"identity\", \"l2\", \"max_l2\", \"l1\"]"
            ))
            .into()),
        }
    }
}

/// Trainable dictionary of shape (n_components, dims)
#[derive(Debug)]
pub struct DictionaryLayer {
    weights: Var,
    normalization: Normalization,
    n_components: usize,
    dims: usize,
}

impl DictionaryLayer {
    /// Random-init dictionary; rows start near unit scale
    pub fn new(
        n_components: usize,
        dims: usize,
        normalization: Normalization,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if n_components == 0 || dims == 0 {
            return Err(CoreError::Config(format!(
                "dictionary must be non-empty, got ({n_components}, {dims})"
            ))
            .into());
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (dims as f32).sqrt();
        let data: Vec<f32> = (0..n_components * dims)
            .map(|_| rng.gen_range(-scale..scale))
            .collect();
        let weights = Var::from_tensor(&Tensor::from_vec(data, (n_components, dims), device)?)?;
        Ok(Self {
            weights,
            normalization,
            n_components,
            dims,
        })
    }

    /// Wrap existing weights (e.g. from a Semi-NMF fit)
    pub fn from_weights(weights: &Tensor, normalization: Normalization) -> Result<Self> {
        let (n_components, dims) = ensure_2d(weights, "weights")?;
        Ok(Self {
            weights: Var::from_tensor(weights)?,
            normalization,
            n_components,
            dims,
        })
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Raw trainable weights, for an external optimizer
    pub fn weights(&self) -> &Var {
        &self.weights
    }

    /// The dictionary as seen through the normalization policy
    pub fn get_dictionary(&self) -> Result<Tensor> {
        let w = self.weights.as_tensor();
        let normalized = match self.normalization {
            Normalization::Identity => w.clone(),
            Normalization::L2 => {
                let norms = (w.sqr()?.sum_keepdim(1)?.sqrt()? + NORM_EPS)?;
                w.broadcast_div(&norms)?
            }
            Normalization::MaxL2 => {
                let norms = (w.sqr()?.sum_keepdim(1)?.sqrt()? + NORM_EPS)?;
                let divisor = norms.maximum(1.0)?;
                w.broadcast_div(&divisor)?
            }
            Normalization::L1 => {
                let norms = (w.abs()?.sum_keepdim(1)? + NORM_EPS)?;
                w.broadcast_div(&norms)?
            }
        };
        Ok(normalized)
    }

    /// Decode codes through the normalized dictionary: z -> z D
    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let (_, k) = ensure_2d(z, "z")?;
        if k != self.n_components {
            return Err(CoreError::Shape(format!(
                "z has {k} components but the dictionary has {}",
                self.n_components
            ))
            .into());
        }
        Ok(z.matmul(&self.get_dictionary()?)?)
    }
}
