//! Feed-forward sublayers
//!
//! FLUX uses a plain two-layer MLP with the tanh approximation of GELU, both
//! in the dual-stream blocks and (fused with attention) in the single-stream
//! blocks.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// GELU with the tanh approximation
///
/// ```text
/// gelu(x) = 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
/// ```
pub fn gelu_tanh<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let sqrt_2_over_pi = (2.0 / std::f64::consts::PI).sqrt();
    let cubic = x.clone().powf_scalar(3.0) * 0.044715;
    let inner = (x.clone() + cubic) * sqrt_2_over_pi;
    x * 0.5 * (inner.tanh() + 1.0)
}

/// Two-layer GELU(tanh) feed-forward network
///
/// # Architecture
///
/// ```text
/// output = linear2(gelu_tanh(linear1(x)))
/// ```
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    /// Expansion projection (hidden -> intermediate)
    pub linear1: Linear<B>,
    /// Contraction projection (intermediate -> hidden)
    pub linear2: Linear<B>,
}

/// Configuration for [`FeedForward`]
pub struct FeedForwardConfig {
    /// Input/output dimension
    pub hidden_size: usize,
    /// Intermediate (expanded) dimension
    pub intermediate_size: usize,
}

impl FeedForwardConfig {
    /// Creates a new config
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
        }
    }

    /// Initializes the module with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeedForward<B> {
        FeedForward {
            linear1: LinearConfig::new(self.hidden_size, self.intermediate_size)
                .with_bias(true)
                .init(device),
            linear2: LinearConfig::new(self.intermediate_size, self.hidden_size)
                .with_bias(true)
                .init(device),
        }
    }
}

impl<B: Backend> FeedForward<B> {
    /// Applies the feed-forward network
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape [batch, seq_len, hidden_size]
    ///
    /// # Returns
    ///
    /// Output tensor of shape [batch, seq_len, hidden_size]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.linear1.forward(x);
        self.linear2.forward(gelu_tanh(x))
    }
}
