//! Flux Weight Loading
//!
//! Binds FLUX transformer weights stored with the HuggingFace diffusers key
//! layout (`transformer_blocks.{i}.attn.to_q.weight`, ...). Every expected
//! tensor must be present with the expected shape, and every tensor in the
//! source must be used.

use std::path::Path;

use burn::prelude::*;
use burn_flux_convert::{LoadError, SafeTensorFile, TensorSource, WeightBinder, WeightMap};
use burn_flux_core::dit::{AdaLayerNormContinuous, AdaLayerNormZero, AdaLayerNormZeroSingle};
use burn_flux_core::mlp::FeedForward;
use burn_flux_core::rmsnorm::RmsNorm;

use crate::blocks::{JointAttention, JointTransformerBlock, QkvProjection, SingleTransformerBlock};
use crate::embed::{MlpEmbedder, TimeTextEmbedding};
use crate::error::FluxError;
use crate::flux::{FluxConfig, FluxTransformer};

/// QK-norm epsilon
const QK_NORM_EPS: f64 = 1e-6;

/// Load a Flux transformer from a safetensors file
///
/// # Arguments
///
/// * `path` - Path to the transformer safetensors file
/// * `config` - Model configuration
/// * `device` - Device to load onto
pub fn load_flux<B: Backend, P: AsRef<Path>>(
    path: P,
    config: &FluxConfig,
    device: &B::Device,
) -> Result<FluxTransformer<B>, FluxError> {
    let file = SafeTensorFile::open(path)?;
    FluxTransformer::from_source(&file, config, device)
}

impl<B: Backend> FluxTransformer<B> {
    /// Bind a model from any named tensor source
    pub fn from_source<S: TensorSource + ?Sized>(
        source: &S,
        config: &FluxConfig,
        device: &B::Device,
    ) -> Result<Self, FluxError> {
        config.validate()?;

        let _span = tracing::info_span!(
            "bind_weights",
            double_blocks = config.num_double_blocks,
            single_blocks = config.num_single_blocks
        )
        .entered();

        let mut binder = WeightBinder::new(source);
        let hidden = config.hidden_size;

        let x_embedder = binder.linear("x_embedder", config.in_channels, hidden, device)?;
        let context_embedder = binder.linear("context_embedder", config.context_dim, hidden, device)?;
        let time_text_embed = TimeTextEmbedding {
            timestep_embedder: load_mlp_embedder(
                &mut binder,
                "time_text_embed.timestep_embedder",
                config.time_dim,
                hidden,
                device,
            )?,
            text_embedder: load_mlp_embedder(
                &mut binder,
                "time_text_embed.text_embedder",
                config.pooled_dim,
                hidden,
                device,
            )?,
            time_dim: config.time_dim,
        };

        let mut transformer_blocks = Vec::with_capacity(config.num_double_blocks);
        for i in 0..config.num_double_blocks {
            transformer_blocks.push(load_joint_block(&mut binder, i, config, device)?);
        }

        let mut single_transformer_blocks = Vec::with_capacity(config.num_single_blocks);
        for i in 0..config.num_single_blocks {
            single_transformer_blocks.push(load_single_block(&mut binder, i, config, device)?);
        }

        let norm_out =
            AdaLayerNormContinuous::from_linear(binder.linear("norm_out.linear", hidden, 2 * hidden, device)?);
        let proj_out = binder.linear("proj_out", hidden, config.in_channels, device)?;

        let bound = binder.finish()?;
        tracing::info!(tensors = bound, "bound flux transformer");

        Ok(FluxTransformer {
            x_embedder,
            context_embedder,
            time_text_embed,
            transformer_blocks,
            single_transformer_blocks,
            norm_out,
            proj_out,
            config: config.clone(),
        })
    }

    /// Export all weights under the diffusers key layout
    pub fn to_weight_map(&self) -> Result<WeightMap, LoadError> {
        let mut map = WeightMap::new();

        map.insert_linear("x_embedder", &self.x_embedder)?;
        map.insert_linear("context_embedder", &self.context_embedder)?;
        export_mlp_embedder(&mut map, "time_text_embed.timestep_embedder", &self.time_text_embed.timestep_embedder)?;
        export_mlp_embedder(&mut map, "time_text_embed.text_embedder", &self.time_text_embed.text_embedder)?;

        for (i, block) in self.transformer_blocks.iter().enumerate() {
            let prefix = format!("transformer_blocks.{i}");
            map.insert_linear(&format!("{prefix}.norm1.linear"), &block.norm1.linear)?;
            map.insert_linear(&format!("{prefix}.norm1_context.linear"), &block.norm1_context.linear)?;
            export_qkv(&mut map, &format!("{prefix}.attn"), &block.attn.image, ["to_q", "to_k", "to_v", "norm_q", "norm_k"])?;
            export_qkv(
                &mut map,
                &format!("{prefix}.attn"),
                &block.attn.context,
                ["add_q_proj", "add_k_proj", "add_v_proj", "norm_added_q", "norm_added_k"],
            )?;
            map.insert_linear(&format!("{prefix}.attn.to_out.0"), &block.attn.to_out)?;
            map.insert_linear(&format!("{prefix}.attn.to_add_out"), &block.attn.to_add_out)?;
            export_feed_forward(&mut map, &format!("{prefix}.ff"), &block.ff)?;
            export_feed_forward(&mut map, &format!("{prefix}.ff_context"), &block.ff_context)?;
        }

        for (i, block) in self.single_transformer_blocks.iter().enumerate() {
            let prefix = format!("single_transformer_blocks.{i}");
            map.insert_linear(&format!("{prefix}.norm.linear"), &block.norm.linear)?;
            map.insert_linear(&format!("{prefix}.proj_mlp"), &block.proj_mlp)?;
            export_qkv(&mut map, &format!("{prefix}.attn"), &block.attn, ["to_q", "to_k", "to_v", "norm_q", "norm_k"])?;
            map.insert_linear(&format!("{prefix}.proj_out"), &block.proj_out)?;
        }

        map.insert_linear("norm_out.linear", &self.norm_out.linear)?;
        map.insert_linear("proj_out", &self.proj_out)?;

        Ok(map)
    }
}

fn load_mlp_embedder<B: Backend, S: TensorSource + ?Sized>(
    binder: &mut WeightBinder<'_, S>,
    prefix: &str,
    in_dim: usize,
    hidden_size: usize,
    device: &B::Device,
) -> Result<MlpEmbedder<B>, LoadError> {
    Ok(MlpEmbedder {
        linear_1: binder.linear(&format!("{prefix}.linear_1"), in_dim, hidden_size, device)?,
        linear_2: binder.linear(&format!("{prefix}.linear_2"), hidden_size, hidden_size, device)?,
    })
}

fn load_rms_norm<B: Backend, S: TensorSource + ?Sized>(
    binder: &mut WeightBinder<'_, S>,
    name: &str,
    head_dim: usize,
    device: &B::Device,
) -> Result<RmsNorm<B>, LoadError> {
    let weight = binder.tensor(&format!("{name}.weight"), [head_dim], device)?;
    Ok(RmsNorm::from_weight(weight, QK_NORM_EPS))
}

/// Loads q/k/v projections and their norms; `names` lists the q, k, v, q-norm
/// and k-norm keys under `prefix`
fn load_qkv<B: Backend, S: TensorSource + ?Sized>(
    binder: &mut WeightBinder<'_, S>,
    prefix: &str,
    names: [&str; 5],
    config: &FluxConfig,
    device: &B::Device,
) -> Result<QkvProjection<B>, LoadError> {
    let hidden = config.hidden_size;
    let [q, k, v, norm_q, norm_k] = names;

    Ok(QkvProjection {
        to_q: binder.linear(&format!("{prefix}.{q}"), hidden, hidden, device)?,
        to_k: binder.linear(&format!("{prefix}.{k}"), hidden, hidden, device)?,
        to_v: binder.linear(&format!("{prefix}.{v}"), hidden, hidden, device)?,
        norm_q: load_rms_norm(binder, &format!("{prefix}.{norm_q}"), config.head_dim(), device)?,
        norm_k: load_rms_norm(binder, &format!("{prefix}.{norm_k}"), config.head_dim(), device)?,
        num_heads: config.num_heads,
    })
}

fn load_feed_forward<B: Backend, S: TensorSource + ?Sized>(
    binder: &mut WeightBinder<'_, S>,
    prefix: &str,
    config: &FluxConfig,
    device: &B::Device,
) -> Result<FeedForward<B>, LoadError> {
    let hidden = config.hidden_size;
    let intermediate = config.intermediate_size();

    Ok(FeedForward {
        linear1: binder.linear(&format!("{prefix}.net.0.proj"), hidden, intermediate, device)?,
        linear2: binder.linear(&format!("{prefix}.net.2"), intermediate, hidden, device)?,
    })
}

fn load_joint_block<B: Backend, S: TensorSource + ?Sized>(
    binder: &mut WeightBinder<'_, S>,
    index: usize,
    config: &FluxConfig,
    device: &B::Device,
) -> Result<JointTransformerBlock<B>, LoadError> {
    let prefix = format!("transformer_blocks.{index}");
    let hidden = config.hidden_size;

    let norm1 = AdaLayerNormZero::from_linear(binder.linear(&format!("{prefix}.norm1.linear"), hidden, 6 * hidden, device)?);
    let norm1_context = AdaLayerNormZero::from_linear(binder.linear(
        &format!("{prefix}.norm1_context.linear"),
        hidden,
        6 * hidden,
        device,
    )?);

    let attn_prefix = format!("{prefix}.attn");
    let attn = JointAttention {
        image: load_qkv(binder, &attn_prefix, ["to_q", "to_k", "to_v", "norm_q", "norm_k"], config, device)?,
        context: load_qkv(
            binder,
            &attn_prefix,
            ["add_q_proj", "add_k_proj", "add_v_proj", "norm_added_q", "norm_added_k"],
            config,
            device,
        )?,
        to_out: binder.linear(&format!("{attn_prefix}.to_out.0"), hidden, hidden, device)?,
        to_add_out: binder.linear(&format!("{attn_prefix}.to_add_out"), hidden, hidden, device)?,
    };

    Ok(JointTransformerBlock {
        norm1,
        norm1_context,
        attn,
        ff: load_feed_forward(binder, &format!("{prefix}.ff"), config, device)?,
        ff_context: load_feed_forward(binder, &format!("{prefix}.ff_context"), config, device)?,
    })
}

fn load_single_block<B: Backend, S: TensorSource + ?Sized>(
    binder: &mut WeightBinder<'_, S>,
    index: usize,
    config: &FluxConfig,
    device: &B::Device,
) -> Result<SingleTransformerBlock<B>, LoadError> {
    let prefix = format!("single_transformer_blocks.{index}");
    let hidden = config.hidden_size;
    let intermediate = config.intermediate_size();

    Ok(SingleTransformerBlock {
        norm: AdaLayerNormZeroSingle::from_linear(binder.linear(
            &format!("{prefix}.norm.linear"),
            hidden,
            3 * hidden,
            device,
        )?),
        proj_mlp: binder.linear(&format!("{prefix}.proj_mlp"), hidden, intermediate, device)?,
        attn: load_qkv(
            binder,
            &format!("{prefix}.attn"),
            ["to_q", "to_k", "to_v", "norm_q", "norm_k"],
            config,
            device,
        )?,
        proj_out: binder.linear(&format!("{prefix}.proj_out"), hidden + intermediate, hidden, device)?,
    })
}

fn export_mlp_embedder<B: Backend>(
    map: &mut WeightMap,
    prefix: &str,
    embedder: &MlpEmbedder<B>,
) -> Result<(), LoadError> {
    map.insert_linear(&format!("{prefix}.linear_1"), &embedder.linear_1)?;
    map.insert_linear(&format!("{prefix}.linear_2"), &embedder.linear_2)
}

fn export_qkv<B: Backend>(
    map: &mut WeightMap,
    prefix: &str,
    proj: &QkvProjection<B>,
    names: [&str; 5],
) -> Result<(), LoadError> {
    let [q, k, v, norm_q, norm_k] = names;
    map.insert_linear(&format!("{prefix}.{q}"), &proj.to_q)?;
    map.insert_linear(&format!("{prefix}.{k}"), &proj.to_k)?;
    map.insert_linear(&format!("{prefix}.{v}"), &proj.to_v)?;
    map.insert_tensor(format!("{prefix}.{norm_q}.weight"), proj.norm_q.weight())?;
    map.insert_tensor(format!("{prefix}.{norm_k}.weight"), proj.norm_k.weight())
}

fn export_feed_forward<B: Backend>(
    map: &mut WeightMap,
    prefix: &str,
    ff: &FeedForward<B>,
) -> Result<(), LoadError> {
    map.insert_linear(&format!("{prefix}.net.0.proj"), &ff.linear1)?;
    map.insert_linear(&format!("{prefix}.net.2"), &ff.linear2)
}
