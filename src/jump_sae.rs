//! JumpReLU sparse autoencoder: the model-facing glue
//!
//! Wires the surrogate-gradient activation into an encode/decode pair: a
//! linear encoder produces pre-codes, JumpReLU with a learned per-component
//! threshold produces the sparse codes, and the dictionary layer reconstructs
//! the input. Training happens outside this crate — an external loop takes
//! `trainable_vars()`, computes a loss on [`SaeOutput`], and steps an
//! optimizer; `fit` deliberately fails with an unsupported-operation error.

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use candle_nn::{Linear, Module};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::dictionary::{DictionaryLayer, Normalization};
use crate::error::{ensure_2d, CoreError};
use crate::jump_ops::jump_relu;
use crate::kernels::Kernel;

/// Configuration for a [`JumpSae`]
#[derive(Debug, Clone)]
pub struct JumpSaeConfig {
    /// Input dimensionality (dims of the activation matrix)
    pub input_dim: usize,
    /// Number of dictionary components K
    pub n_components: usize,
    /// Smoothing-kernel registry name for the threshold pseudo-gradient
    pub kernel: String,
    /// Kernel bandwidth; must be positive
    pub bandwidth: f64,
    /// Dictionary row-normalization policy name
    pub normalization: String,
    /// Seed for encoder and dictionary initialization
    pub seed: u64,
}

impl JumpSaeConfig {
    pub fn new(input_dim: usize, n_components: usize) -> Self {
        Self {
            input_dim,
            n_components,
            kernel: "silverman".to_string(),
            bandwidth: 1e-3,
            normalization: "l2".to_string(),
            seed: 42,
        }
    }
}

/// Output of a forward pass
#[derive(Debug)]
pub struct SaeOutput {
    /// Encoder output before the activation, shape (n, K)
    pub pre_codes: Tensor,
    /// Sparse codes after JumpReLU, shape (n, K)
    pub codes: Tensor,
    /// Reconstruction through the dictionary, shape (n, dims)
    pub reconstruction: Tensor,
}

/// Gradient-trained sparse autoencoder with a JumpReLU activation
#[derive(Debug)]
pub struct JumpSae {
    encoder: Linear,
    encoder_weight: Var,
    encoder_bias: Var,
    dictionary: DictionaryLayer,
    threshold: Var,
    kernel: Kernel,
    bandwidth: f64,
}

impl JumpSae {
    /// Build the model; kernel name, normalization name and bandwidth are all
    /// validated here so misconfiguration cannot survive until first use.
    pub fn new(config: &JumpSaeConfig, device: &Device) -> Result<Self> {
        let kernel = Kernel::from_name(&config.kernel)?;
        let normalization = Normalization::from_name(&config.normalization)?;
        if config.bandwidth <= 0.0 {
            return Err(CoreError::Config(format!(
                "bandwidth must be positive, got {}",
                config.bandwidth
            ))
            .into());
        }
        if config.input_dim == 0 || config.n_components == 0 {
            return Err(CoreError::Config(format!(
                "input_dim and n_components must be at least 1, got ({}, {})",
                config.input_dim, config.n_components
            ))
            .into());
        }

        let (input_dim, k) = (config.input_dim, config.n_components);
        debug!(
            "Building JumpSAE: {input_dim} dims, {k} components, kernel={kernel}, bandwidth={}",
            config.bandwidth
        );

        // Xavier-uniform encoder init
        let mut rng = StdRng::seed_from_u64(config.seed);
        let bound = (6.0 / (input_dim + k) as f32).sqrt();
        let w_data: Vec<f32> = (0..k * input_dim)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        let encoder_weight =
            Var::from_tensor(&Tensor::from_vec(w_data, (k, input_dim), device)?)?;
        let encoder_bias = Var::zeros(k, candle_core::DType::F32, device)?;
        // clones share storage with the vars, so gradients reach them
        let encoder = Linear::new(
            encoder_weight.as_tensor().clone(),
            Some(encoder_bias.as_tensor().clone()),
        );

        let dictionary =
            DictionaryLayer::new(k, input_dim, normalization, config.seed.wrapping_add(1), device)?;

        // threshold starts at zero: the activation begins as a plain ReLU-like
        // passthrough and the thresholds move by gradient steps only
        let threshold = Var::zeros(k, candle_core::DType::F32, device)?;

        Ok(Self {
            encoder,
            encoder_weight,
            encoder_bias,
            dictionary,
            threshold,
            kernel,
            bandwidth: config.bandwidth,
        })
    }

    pub fn n_components(&self) -> usize {
        self.dictionary.n_components()
    }

    pub fn input_dim(&self) -> usize {
        self.dictionary.dims()
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    /// The learned per-component threshold, shape (K,)
    pub fn threshold(&self) -> &Var {
        &self.threshold
    }

    /// All trainable parameters, for an external optimizer
    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![
            self.encoder_weight.clone(),
            self.encoder_bias.clone(),
            self.dictionary.weights().clone(),
            self.threshold.clone(),
        ]
    }

    /// The dictionary as seen through its normalization policy
    pub fn get_dictionary(&self) -> Result<Tensor> {
        self.dictionary.get_dictionary()
    }

    /// Encode activations into (pre_codes, codes), both shape (n, K)
    pub fn encode(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, dims) = ensure_2d(x, "x")?;
        if dims != self.input_dim() {
            return Err(CoreError::Shape(format!(
                "x has {dims} dims but the encoder expects {}",
                self.input_dim()
            ))
            .into());
        }
        let pre_codes = self.encoder.forward(x)?;
        let codes = jump_relu(
            &pre_codes,
            self.threshold.as_tensor(),
            self.kernel,
            self.bandwidth,
        )?;
        Ok((pre_codes, codes))
    }

    /// Decode codes through the dictionary
    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        self.dictionary.forward(z)
    }

    /// Full forward pass: encode, threshold, reconstruct
    pub fn forward(&self, x: &Tensor) -> Result<SaeOutput> {
        let (pre_codes, codes) = self.encode(x)?;
        let reconstruction = self.decode(&codes)?;
        Ok(SaeOutput {
            pre_codes,
            codes,
            reconstruction,
        })
    }

    /// Not supported: this family is trained by backpropagation through an
    /// external loop, not by an internal fit procedure.
    pub fn fit(&mut self, _x: &Tensor) -> Result<(Tensor, Tensor)> {
        Err(CoreError::Unsupported(
            "JumpSae has no fit method; train it with an external training loop \
             using trainable_vars() and a gradient optimizer"
                .into(),
        )
        .into())
    }
}
