// Pedantic clippy configuration for numerical/ML code
#![allow(clippy::cast_precision_loss)] // usize→f32/f64 intentional in math code
#![allow(clippy::cast_possible_truncation)] // f64→f32 in tensor conversions
#![allow(clippy::many_single_char_names)] // x, z, d, k standard in factorization math
#![allow(clippy::similar_names)] // related variables like `xdt`/`ddt`
#![allow(clippy::module_name_repetitions)] // SemiNmfConfig in semi_nmf.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive

//! dictlearn-rs: dictionary learning for activation matrices
//!
//! Decomposes a matrix of observed activation vectors into nonnegative codes
//! and a dictionary, two ways:
//!
//! - [`SemiNmf`]: classical alternating-optimization semi-NMF (multiplicative
//!   or projected-gradient updates, optional L1 sparsity on the codes)
//! - [`JumpSae`]: a gradient-trained sparse autoencoder whose JumpReLU
//!   activation carries a kernel-density pseudo-gradient for its learned
//!   thresholds
//!
//! ## Architecture
//!
//! - `kernels`: smoothing-kernel registry used by the surrogate gradients
//! - `jump_ops`: JumpReLU / Heaviside custom forward+backward operators
//! - `semi_nmf`: the alternating Semi-NMF solver (fit / encode / decode)
//! - `nmf`: plain both-factors-nonnegative NMF, multiplicative updates
//! - `dictionary`: trainable dictionary layer with row normalization
//! - `jump_sae`: SAE glue wiring encoder, activation and dictionary together
//! - `losses`: differentiable training-loss helper for external loops
//! - `metrics`: reconstruction error and sparsity metrics
//! - `linalg`: dense normal-equation solves backing the mu D-update
//! - `error`: typed error classes surfaced through `anyhow`

pub mod dictionary;
pub mod error;
pub mod jump_ops;
pub mod jump_sae;
pub mod kernels;
pub mod linalg;
pub mod losses;
pub mod metrics;
pub mod nmf;
pub mod semi_nmf;

pub use dictionary::{DictionaryLayer, Normalization};
pub use error::CoreError;
pub use jump_ops::{heaviside, heaviside_backward, jump_relu, jump_relu_backward};
pub use jump_sae::{JumpSae, JumpSaeConfig, SaeOutput};
pub use kernels::Kernel;
pub use losses::mse_l1_loss;
pub use metrics::{
    avg_l1_loss, avg_l2_loss, dead_codes, relative_avg_l1_loss, relative_avg_l2_loss, sparsity,
    sparsity_eps,
};
pub use nmf::{Nmf, NmfConfig};
pub use semi_nmf::{FitReport, SemiNmf, SemiNmfConfig, Solver};
