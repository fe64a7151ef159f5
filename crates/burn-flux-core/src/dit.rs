//! Diffusion Transformer (DiT) building blocks
//!
//! Adaptive layer norms that turn the conditioning vector into per-feature
//! shift/scale/gate terms, plus the latent packing that turns a VAE latent
//! into a token sequence.
//!
//! All modulation layers compute `linear(SiLU(cond))` and apply
//! `(1 + scale) * LayerNorm(x) + shift`.
//!
//! # References
//!
//! - [Scalable Diffusion Models with Transformers](https://arxiv.org/abs/2212.09748)

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

use crate::layernorm::LayerNorm;

/// Splits `[batch, N * hidden]` modulation output into `N` tensors of
/// `[batch, 1, hidden]`, ready to broadcast over the token axis.
pub fn chunk_modulation<B: Backend, const N: usize>(params: Tensor<B, 2>) -> [Tensor<B, 3>; N] {
    let [_batch, width] = params.dims();
    let hidden = width / N;

    std::array::from_fn(|i| params.clone().narrow(1, i * hidden, hidden).unsqueeze_dim(1))
}

/// `(1 + scale) * x + shift`
pub fn modulate<B: Backend>(x: Tensor<B, 3>, shift: Tensor<B, 3>, scale: Tensor<B, 3>) -> Tensor<B, 3> {
    x * (scale + 1.0) + shift
}

/// Gates and MLP modulation produced alongside the attention input by
/// [`AdaLayerNormZero`]
#[derive(Debug, Clone)]
pub struct ZeroModulation<B: Backend> {
    /// Gate for the attention residual
    pub gate_msa: Tensor<B, 3>,
    /// Shift for the MLP input
    pub shift_mlp: Tensor<B, 3>,
    /// Scale for the MLP input
    pub scale_mlp: Tensor<B, 3>,
    /// Gate for the MLP residual
    pub gate_mlp: Tensor<B, 3>,
}

/// AdaLN-Zero with six modulation chunks
///
/// Chunks, in order: `shift_msa, scale_msa, gate_msa, shift_mlp, scale_mlp, gate_mlp`.
/// The first two modulate the attention input here; the rest are returned for
/// the caller's residual and MLP branch.
#[derive(Module, Debug)]
pub struct AdaLayerNormZero<B: Backend> {
    /// Linear predicting the six chunks from the conditioning vector
    pub linear: Linear<B>,
}

/// Configuration shared by the adaptive norms
pub struct AdaLayerNormConfig {
    /// Hidden dimension
    pub hidden_size: usize,
    /// Conditioning dimension
    pub cond_dim: usize,
}

impl AdaLayerNormConfig {
    /// Creates a new config
    pub fn new(hidden_size: usize, cond_dim: usize) -> Self {
        Self {
            hidden_size,
            cond_dim,
        }
    }

    fn linear<B: Backend>(&self, chunks: usize, device: &B::Device) -> Linear<B> {
        LinearConfig::new(self.cond_dim, chunks * self.hidden_size)
            .with_bias(true)
            .init(device)
    }

    /// Six-chunk AdaLN-Zero for dual-stream blocks
    pub fn init_zero<B: Backend>(&self, device: &B::Device) -> AdaLayerNormZero<B> {
        AdaLayerNormZero {
            linear: self.linear(6, device),
        }
    }

    /// Three-chunk AdaLN-Zero for single-stream blocks
    pub fn init_zero_single<B: Backend>(&self, device: &B::Device) -> AdaLayerNormZeroSingle<B> {
        AdaLayerNormZeroSingle {
            linear: self.linear(3, device),
        }
    }

    /// Two-chunk continuous AdaLN for the output head
    pub fn init_continuous<B: Backend>(&self, device: &B::Device) -> AdaLayerNormContinuous<B> {
        AdaLayerNormContinuous {
            linear: self.linear(2, device),
        }
    }
}

impl<B: Backend> AdaLayerNormZero<B> {
    /// Builds the layer from a bound linear
    pub fn from_linear(linear: Linear<B>) -> Self {
        Self { linear }
    }

    /// Forward pass with conditioning
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq_len, hidden_size]
    /// * `cond` - Conditioning tensor [batch, cond_dim]
    ///
    /// # Returns
    ///
    /// The modulated attention input and the remaining modulation terms
    pub fn forward(&self, x: Tensor<B, 3>, cond: Tensor<B, 2>) -> (Tensor<B, 3>, ZeroModulation<B>) {
        let params = self.linear.forward(silu(cond));
        let [shift_msa, scale_msa, gate_msa, shift_mlp, scale_mlp, gate_mlp] =
            chunk_modulation::<B, 6>(params);
        let modulation = ZeroModulation {
            gate_msa,
            shift_mlp,
            scale_mlp,
            gate_mlp,
        };

        let x = modulate(LayerNorm::default().forward(x), shift_msa, scale_msa);
        (x, modulation)
    }
}

/// AdaLN-Zero with three modulation chunks: `shift, scale, gate`
#[derive(Module, Debug)]
pub struct AdaLayerNormZeroSingle<B: Backend> {
    /// Linear predicting the three chunks from the conditioning vector
    pub linear: Linear<B>,
}

impl<B: Backend> AdaLayerNormZeroSingle<B> {
    /// Builds the layer from a bound linear
    pub fn from_linear(linear: Linear<B>) -> Self {
        Self { linear }
    }

    /// Returns the modulated input and the residual gate `[batch, 1, hidden]`
    pub fn forward(&self, x: Tensor<B, 3>, cond: Tensor<B, 2>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let params = self.linear.forward(silu(cond));
        let [shift, scale, gate] = chunk_modulation::<B, 3>(params);

        (modulate(LayerNorm::default().forward(x), shift, scale), gate)
    }
}

/// Continuous AdaLN: two chunks in the order `scale, shift`, no gate
#[derive(Module, Debug)]
pub struct AdaLayerNormContinuous<B: Backend> {
    /// Linear predicting scale and shift from the conditioning vector
    pub linear: Linear<B>,
}

impl<B: Backend> AdaLayerNormContinuous<B> {
    /// Builds the layer from a bound linear
    pub fn from_linear(linear: Linear<B>) -> Self {
        Self { linear }
    }

    /// Forward pass with conditioning
    pub fn forward(&self, x: Tensor<B, 3>, cond: Tensor<B, 2>) -> Tensor<B, 3> {
        let params = self.linear.forward(silu(cond));
        let [scale, shift] = chunk_modulation::<B, 2>(params);

        modulate(LayerNorm::default().forward(x), shift, scale)
    }
}

/// Packs a VAE latent into patch tokens
///
/// Each 2x2 spatial patch becomes one token whose features are ordered
/// channel-major: `[c0(0,0), c0(0,1), c0(1,0), c0(1,1), c1(0,0), ...]`.
///
/// `[batch, channels, 2h, 2w]` -> `[batch, h * w, channels * 4]`
pub fn pack_latents<B: Backend>(latents: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = latents.dims();
    let (h, w) = (height / 2, width / 2);

    // [B, C, h, 2, w, 2] -> [B, h, w, C, 2, 2]
    latents
        .reshape([batch, channels, h, 2, w, 2])
        .permute([0, 2, 4, 1, 3, 5])
        .reshape([batch, h * w, channels * 4])
}

/// Inverse of [`pack_latents`]
///
/// `[batch, h * w, channels * 4]` -> `[batch, channels, 2h, 2w]` where
/// `height` and `width` are the unpacked (2h, 2w) sizes.
pub fn unpack_latents<B: Backend>(tokens: Tensor<B, 3>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, _num_tokens, features] = tokens.dims();
    let channels = features / 4;
    let (h, w) = (height / 2, width / 2);

    // [B, h, w, C, 2, 2] -> [B, C, h, 2, w, 2]
    tokens
        .reshape([batch, h, w, channels, 2, 2])
        .permute([0, 3, 1, 4, 2, 5])
        .reshape([batch, channels, height, width])
}
