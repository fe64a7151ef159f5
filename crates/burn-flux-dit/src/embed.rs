//! Timestep and pooled-text conditioning

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

/// Continuous time in [0, 1] is scaled to this range before encoding
pub const TIME_SCALE: f32 = 1000.0;

/// Max period of the sinusoidal encoding
const MAX_PERIOD: f32 = 10_000.0;

/// Sinusoidal timestep encoding, ordered `[cos, sin]`
///
/// `freq_j = exp(-ln(10000) * j / (dim / 2))`
///
/// # Arguments
///
/// * `t` - Timesteps `[n]`, already scaled
/// * `dim` - Encoding width (even)
pub fn timestep_sinusoid<B: Backend>(t: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let device = t.device();
    let half = dim / 2;

    let freqs: Vec<f32> = (0..half)
        .map(|j| (-MAX_PERIOD.ln() * j as f32 / half as f32).exp())
        .collect();
    let freqs = Tensor::<B, 1>::from_floats(freqs.as_slice(), &device);

    let angles = t.unsqueeze_dim::<2>(1).matmul(freqs.unsqueeze_dim::<2>(0));
    Tensor::cat(vec![angles.clone().cos(), angles.sin()], 1)
}

/// `linear_2(SiLU(linear_1(x)))`
#[derive(Module, Debug)]
pub struct MlpEmbedder<B: Backend> {
    pub linear_1: Linear<B>,
    pub linear_2: Linear<B>,
}

impl<B: Backend> MlpEmbedder<B> {
    pub fn new(in_dim: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            linear_1: LinearConfig::new(in_dim, hidden_size).with_bias(true).init(device),
            linear_2: LinearConfig::new(hidden_size, hidden_size)
                .with_bias(true)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear_2.forward(silu(self.linear_1.forward(x)))
    }
}

/// Fuses the timestep and the pooled text embedding into one conditioning vector
#[derive(Module, Debug)]
pub struct TimeTextEmbedding<B: Backend> {
    pub timestep_embedder: MlpEmbedder<B>,
    pub text_embedder: MlpEmbedder<B>,
    /// Sinusoid width
    pub time_dim: usize,
}

impl<B: Backend> TimeTextEmbedding<B> {
    /// # Arguments
    ///
    /// * `time` - Continuous time in [0, 1], `[1]` or `[batch]`
    /// * `pooled` - Pooled text embedding `[batch, pooled_dim]`
    ///
    /// # Returns
    ///
    /// Conditioning vector `[batch, hidden_size]`
    pub fn forward(&self, time: Tensor<B, 1>, pooled: Tensor<B, 2>) -> Tensor<B, 2> {
        let time = timestep_sinusoid(time * TIME_SCALE, self.time_dim);
        let time = self.timestep_embedder.forward(time);
        let text = self.text_embedder.forward(pooled);

        // [1, hidden] broadcasts over the batch
        time + text
    }
}
