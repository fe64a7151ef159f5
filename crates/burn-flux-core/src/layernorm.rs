//! Layer normalization without a learned affine transform
//!
//! FLUX normalizes every stream with a plain LayerNorm and lets the
//! conditioning vector supply scale and shift (see [`crate::dit`]), so the
//! norm itself carries no parameters.

use burn::prelude::*;

/// Parameter-free layer normalization
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps)
/// ```
/// where `var` is the biased (population) variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerNorm {
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for LayerNorm {
    fn default() -> Self {
        Self { eps: 1e-6 }
    }
}

impl LayerNorm {
    /// Creates a layer norm with a custom epsilon
    pub fn new(eps: f64) -> Self {
        Self { eps }
    }

    /// Normalizes the input over its last dimension
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of any dimensionality
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let centered = x - mean;
        let var = centered.clone().powf_scalar(2.0).mean_dim(last_dim);

        centered / (var + self.eps).sqrt()
    }
}
