//! FLUX.1-schnell Transformer
//!
//! Predicts the noise residual for one denoising step from packed latent
//! tokens, T5 text embeddings and the pooled CLIP embedding.
//!
//! # Architecture Overview
//!
//! ```text
//! hidden_states [b, 4096, 64]      prompt_embeds [b, 256, 4096]     t, pooled [b, 768]
//!        ↓ x_embedder                      ↓ context_embedder               ↓ time_text_embed
//!   image tokens [b, 4096, 3072]     text tokens [b, 256, 3072]      cond [b, 3072]
//!        ↓─────────────[19 dual-stream blocks, joint attention]──────────↓
//!                     concat text + image [b, 4352, 3072]
//!                     [38 single-stream blocks]
//!                     drop text prefix → norm_out → proj_out
//!                     noise prediction [b, 4096, 64]
//! ```

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use burn_flux_core::dit::{AdaLayerNormConfig, AdaLayerNormContinuous};
use burn_flux_core::numeric::{finite_report, tensor_stats};
use burn_flux_core::rope::{image_position_ids, joint_position_ids, text_position_ids, RotaryEmbedding};

use crate::blocks::{FluxBlockConfig, JointTransformerBlock, SingleTransformerBlock};
use crate::embed::{MlpEmbedder, TimeTextEmbedding};
use crate::error::FluxError;
use crate::schedule::SampleConfig;

/// Flux Model Configuration
#[derive(Debug, Clone, PartialEq)]
pub struct FluxConfig {
    /// Packed latent channels per token (16 VAE channels x 2x2 patch)
    pub in_channels: usize,
    /// Hidden dimension
    pub hidden_size: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Number of dual-stream blocks
    pub num_double_blocks: usize,
    /// Number of single-stream blocks
    pub num_single_blocks: usize,
    /// Text embedding width (T5-XXL)
    pub context_dim: usize,
    /// Text token count
    pub text_len: usize,
    /// Pooled text embedding width (CLIP)
    pub pooled_dim: usize,
    /// Timestep sinusoid width
    pub time_dim: usize,
    /// Rotary widths per position axis; must sum to the head dimension
    pub axes_dim: [usize; 3],
    /// Rotary base
    pub theta: f32,
    /// FFN intermediate size multiplier
    pub mlp_ratio: f32,
}

impl FluxConfig {
    /// Flux.1-schnell configuration
    pub fn flux_schnell() -> Self {
        Self {
            in_channels: 64,
            hidden_size: 3072,
            num_heads: 24,
            num_double_blocks: 19,
            num_single_blocks: 38,
            context_dim: 4096, // T5-XXL
            text_len: 256,
            pooled_dim: 768, // CLIP-L
            time_dim: 256,
            axes_dim: [16, 56, 56],
            theta: 10_000.0,
            mlp_ratio: 4.0,
        }
    }

    /// Tiny model for testing, same structure at toy widths
    pub fn tiny() -> Self {
        Self {
            in_channels: 64,
            hidden_size: 64,
            num_heads: 2,
            num_double_blocks: 2,
            num_single_blocks: 2,
            context_dim: 32,
            text_len: 8,
            pooled_dim: 16,
            time_dim: 32,
            axes_dim: [8, 12, 12],
            theta: 10_000.0,
            mlp_ratio: 4.0,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn intermediate_size(&self) -> usize {
        (self.hidden_size as f32 * self.mlp_ratio) as usize
    }

    /// Checks that the widths fit together
    pub fn validate(&self) -> Result<(), FluxError> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(FluxError::Configuration(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        let axes_sum: usize = self.axes_dim.iter().sum();
        if axes_sum != self.head_dim() {
            return Err(FluxError::Configuration(format!(
                "rotary axes {:?} sum to {axes_sum}, head dim is {}",
                self.axes_dim,
                self.head_dim()
            )));
        }
        if self.axes_dim.iter().any(|d| d % 2 != 0) || self.time_dim % 2 != 0 {
            return Err(FluxError::Configuration(
                "rotary axes and the timestep width must be even".to_string(),
            ));
        }
        Ok(())
    }

    /// Initialize the model with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<FluxTransformer<B>, FluxError> {
        self.validate()?;

        let blocks = FluxBlockConfig::new(self.hidden_size, self.num_heads, self.intermediate_size());
        let linear = |d_in, d_out| LinearConfig::new(d_in, d_out).with_bias(true).init(device);

        Ok(FluxTransformer {
            x_embedder: linear(self.in_channels, self.hidden_size),
            context_embedder: linear(self.context_dim, self.hidden_size),
            time_text_embed: TimeTextEmbedding {
                timestep_embedder: MlpEmbedder::new(self.time_dim, self.hidden_size, device),
                text_embedder: MlpEmbedder::new(self.pooled_dim, self.hidden_size, device),
                time_dim: self.time_dim,
            },
            transformer_blocks: (0..self.num_double_blocks)
                .map(|_| blocks.init_joint(device))
                .collect(),
            single_transformer_blocks: (0..self.num_single_blocks)
                .map(|_| blocks.init_single(device))
                .collect(),
            norm_out: AdaLayerNormConfig::new(self.hidden_size, self.hidden_size).init_continuous(device),
            proj_out: linear(self.hidden_size, self.in_channels),
            config: self.clone(),
        })
    }
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self::flux_schnell()
    }
}

impl core::fmt::Display for FluxConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "FluxConfig(hidden_size: {}, num_heads: {}, blocks: {}+{}, text_len: {})",
            self.hidden_size, self.num_heads, self.num_double_blocks, self.num_single_blocks, self.text_len
        )
    }
}

use burn::constant;
constant!(FluxConfig);

/// Flux transformer
#[derive(Module, Debug)]
pub struct FluxTransformer<B: Backend> {
    /// Latent token projection (in_channels -> hidden)
    pub x_embedder: Linear<B>,
    /// Text projection (context_dim -> hidden)
    pub context_embedder: Linear<B>,
    /// Timestep + pooled text conditioning
    pub time_text_embed: TimeTextEmbedding<B>,
    /// Dual-stream blocks
    pub transformer_blocks: Vec<JointTransformerBlock<B>>,
    /// Single-stream blocks
    pub single_transformer_blocks: Vec<SingleTransformerBlock<B>>,
    /// Final continuous AdaLN
    pub norm_out: AdaLayerNormContinuous<B>,
    /// Output projection (hidden -> in_channels)
    pub proj_out: Linear<B>,
    /// Architecture the weights were built for
    pub config: FluxConfig,
}

impl<B: Backend> FluxTransformer<B> {
    pub fn config(&self) -> &FluxConfig {
        &self.config
    }

    /// Predicts the noise residual for schedule step `t`
    ///
    /// # Arguments
    ///
    /// * `t` - Index into `config.time_steps`
    /// * `prompt_embeds` - Text embeddings `[batch, text_len, context_dim]`
    /// * `pooled_prompt_embeds` - Pooled text embedding `[batch, pooled_dim]`
    /// * `hidden_states` - Packed latents `[batch, image_tokens, in_channels]`
    /// * `config` - Schedule, image size and execution options
    ///
    /// # Returns
    ///
    /// Noise prediction with the shape of `hidden_states`
    pub fn predict(
        &self,
        t: usize,
        prompt_embeds: Tensor<B, 3>,
        pooled_prompt_embeds: Tensor<B, 2>,
        hidden_states: Tensor<B, 3>,
        config: &SampleConfig,
    ) -> Result<Tensor<B, 3>, FluxError> {
        let time_step = config.time_step(t)?;
        let (rows, cols) = config.latent_grid()?;
        self.check_inputs(&prompt_embeds, &pooled_prompt_embeds, &hidden_states, rows * cols)?;

        let [batch, image_len, _] = hidden_states.dims();
        let text_len = self.config.text_len;
        let hidden = self.config.hidden_size;
        let device = hidden_states.device();

        let _span = tracing::debug_span!("predict", t, time_step, batch, image_len).entered();

        let time = Tensor::<B, 1>::from_floats([time_step], &device);
        let cond = self.time_text_embed.forward(time, pooled_prompt_embeds);
        check_finite(config, "time_text_embed", "conditioning", &cond)?;

        let mut hidden_states = self.x_embedder.forward(hidden_states);
        let mut encoder_hidden_states = self.context_embedder.forward(prompt_embeds);

        let ids = joint_position_ids(
            text_position_ids(batch, text_len, &device),
            image_position_ids(batch, rows, cols, &device),
        );
        let rope = RotaryEmbedding::from_position_ids(ids, &self.config.axes_dim, self.config.theta);

        for (index, block) in self.transformer_blocks.iter().enumerate() {
            let _span = tracing::debug_span!("transformer_block", index).entered();
            (encoder_hidden_states, hidden_states) = block.forward(
                hidden_states,
                encoder_hidden_states,
                cond.clone(),
                &rope,
                config.attention,
            );
            if config.check_finite {
                let stage = format!("transformer block {index}");
                ensure_finite(&stage, "hidden_states", &hidden_states)?;
                ensure_finite(&stage, "encoder_hidden_states", &encoder_hidden_states)?;
            }
        }

        let mut x = Tensor::cat(vec![encoder_hidden_states, hidden_states], 1);

        for (index, block) in self.single_transformer_blocks.iter().enumerate() {
            let _span = tracing::debug_span!("single_transformer_block", index).entered();
            x = block.forward(x, cond.clone(), &rope, config.attention);
            if config.check_finite {
                ensure_finite(&format!("single transformer block {index}"), "hidden_states", &x)?;
            }
        }

        let image = x.slice([0..batch, text_len..text_len + image_len, 0..hidden]);
        let out = self.proj_out.forward(self.norm_out.forward(image, cond));
        check_finite(config, "proj_out", "noise_pred", &out)?;

        tracing::debug!("prediction complete");
        Ok(out)
    }

    fn check_inputs(
        &self,
        prompt_embeds: &Tensor<B, 3>,
        pooled_prompt_embeds: &Tensor<B, 2>,
        hidden_states: &Tensor<B, 3>,
        image_tokens: usize,
    ) -> Result<(), FluxError> {
        let cfg = &self.config;
        let [batch, _, _] = hidden_states.dims();

        // an empty batch is reported against a batch of one
        let expected_hidden = [batch.max(1), image_tokens, cfg.in_channels];
        if hidden_states.dims() != expected_hidden {
            return Err(FluxError::shape("hidden_states", &expected_hidden, &hidden_states.dims()));
        }

        let expected_prompt = [batch, cfg.text_len, cfg.context_dim];
        if prompt_embeds.dims() != expected_prompt {
            return Err(FluxError::shape("prompt_embeds", &expected_prompt, &prompt_embeds.dims()));
        }

        let expected_pooled = [batch, cfg.pooled_dim];
        if pooled_prompt_embeds.dims() != expected_pooled {
            return Err(FluxError::shape(
                "pooled_prompt_embeds",
                &expected_pooled,
                &pooled_prompt_embeds.dims(),
            ));
        }

        Ok(())
    }
}

fn check_finite<B: Backend, const D: usize>(
    config: &SampleConfig,
    stage: &str,
    name: &str,
    tensor: &Tensor<B, D>,
) -> Result<(), FluxError> {
    if config.check_finite {
        ensure_finite(stage, name, tensor)?;
    }
    Ok(())
}

fn ensure_finite<B: Backend, const D: usize>(
    stage: &str,
    name: &str,
    tensor: &Tensor<B, D>,
) -> Result<(), FluxError> {
    let report = finite_report(tensor);
    if report.is_finite() {
        return Ok(());
    }

    tracing::warn!(stage, name, stats = %tensor_stats(tensor), "non-finite values");
    Err(FluxError::NonFinite {
        stage: stage.to_string(),
        name: name.to_string(),
        nan: report.nan,
        inf: report.inf,
    })
}
