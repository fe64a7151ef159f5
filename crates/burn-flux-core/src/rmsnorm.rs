//! Root Mean Square Layer Normalization
//!
//! FLUX applies RMSNorm per attention head to queries and keys before the
//! rotary embedding ("QK-norm"), which keeps attention logits bounded.

use burn::prelude::*;

/// Root Mean Square Layer Normalization
///
/// Unlike LayerNorm, RMSNorm does not subtract the mean or apply a bias.
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = x / sqrt(mean(x^2) + eps) * weight
/// ```
///
/// # References
///
/// - [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    weight: Tensor<B, 1>,
    eps: f64,
}

impl<B: Backend> RmsNorm<B> {
    /// Creates a new RMSNorm module with unit scale
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the normalized dimension (last dimension)
    /// * `device` - Device to create tensors on
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            weight: Tensor::ones([size], device),
            eps: 1e-6,
        }
    }

    /// Creates RMSNorm from a pre-loaded scale vector
    pub fn from_weight(weight: Tensor<B, 1>, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Learned per-feature scale
    pub fn weight(&self) -> Tensor<B, 1> {
        self.weight.clone()
    }

    /// Applies RMS normalization over the last dimension
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of any dimensionality
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean_sq = x.clone().powf_scalar(2.0).mean_dim(last_dim);
        let x_norm = x / (mean_sq + self.eps).sqrt();
        x_norm * self.weight.clone().unsqueeze()
    }
}
