//! Dual-stream and single-stream transformer blocks

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use burn_flux_core::attention::{merge_heads, scaled_dot_product_attention, split_heads, AttentionStrategy};
use burn_flux_core::dit::{modulate, AdaLayerNormConfig, AdaLayerNormZero, AdaLayerNormZeroSingle};
use burn_flux_core::layernorm::LayerNorm;
use burn_flux_core::mlp::{gelu_tanh, FeedForward, FeedForwardConfig};
use burn_flux_core::rmsnorm::RmsNorm;
use burn_flux_core::rope::RotaryEmbedding;

/// Query/key/value projections with per-head RMSNorm on q and k
#[derive(Module, Debug)]
pub struct QkvProjection<B: Backend> {
    pub to_q: Linear<B>,
    pub to_k: Linear<B>,
    pub to_v: Linear<B>,
    pub norm_q: RmsNorm<B>,
    pub norm_k: RmsNorm<B>,
    pub num_heads: usize,
}

impl<B: Backend> QkvProjection<B> {
    pub fn new(hidden_size: usize, num_heads: usize, device: &B::Device) -> Self {
        let head_dim = hidden_size / num_heads;
        let linear = || LinearConfig::new(hidden_size, hidden_size).with_bias(true).init(device);

        Self {
            to_q: linear(),
            to_k: linear(),
            to_v: linear(),
            norm_q: RmsNorm::new(head_dim, device),
            norm_k: RmsNorm::new(head_dim, device),
            num_heads,
        }
    }

    /// Returns q, k, v as `[batch, heads, seq_len, head_dim]`
    pub fn forward(&self, x: Tensor<B, 3>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let q = split_heads(self.to_q.forward(x.clone()), self.num_heads);
        let k = split_heads(self.to_k.forward(x.clone()), self.num_heads);
        let v = split_heads(self.to_v.forward(x), self.num_heads);

        (self.norm_q.forward(q), self.norm_k.forward(k), v)
    }
}

/// Joint text+image attention of the dual-stream blocks
///
/// Both streams are projected separately, concatenated text-first along the
/// token axis, rotated, attended over jointly and split back.
#[derive(Module, Debug)]
pub struct JointAttention<B: Backend> {
    /// Image-stream projections (`to_q`, `to_k`, `to_v`, `norm_q`, `norm_k`)
    pub image: QkvProjection<B>,
    /// Text-stream projections (`add_*_proj`, `norm_added_*`)
    pub context: QkvProjection<B>,
    /// Image output projection (`to_out.0`)
    pub to_out: Linear<B>,
    /// Text output projection (`to_add_out`)
    pub to_add_out: Linear<B>,
}

impl<B: Backend> JointAttention<B> {
    pub fn new(hidden_size: usize, num_heads: usize, device: &B::Device) -> Self {
        Self {
            image: QkvProjection::new(hidden_size, num_heads, device),
            context: QkvProjection::new(hidden_size, num_heads, device),
            to_out: LinearConfig::new(hidden_size, hidden_size).with_bias(true).init(device),
            to_add_out: LinearConfig::new(hidden_size, hidden_size).with_bias(true).init(device),
        }
    }

    /// Returns `(image_out, text_out)`
    pub fn forward(
        &self,
        hidden_states: Tensor<B, 3>,
        encoder_hidden_states: Tensor<B, 3>,
        rope: &RotaryEmbedding<B>,
        strategy: AttentionStrategy,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let [batch, image_len, hidden] = hidden_states.dims();
        let [_, text_len, _] = encoder_hidden_states.dims();

        let (q, k, v) = self.image.forward(hidden_states);
        let (cq, ck, cv) = self.context.forward(encoder_hidden_states);

        let q = Tensor::cat(vec![cq, q], 2);
        let k = Tensor::cat(vec![ck, k], 2);
        let v = Tensor::cat(vec![cv, v], 2);

        let (q, k) = rope.forward(q, k);
        let out = merge_heads(scaled_dot_product_attention(q, k, v, strategy));

        let total = text_len + image_len;
        let text_out = out.clone().slice([0..batch, 0..text_len, 0..hidden]);
        let image_out = out.slice([0..batch, text_len..total, 0..hidden]);

        (self.to_out.forward(image_out), self.to_add_out.forward(text_out))
    }
}

/// Configuration for both block kinds
pub struct FluxBlockConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub intermediate_size: usize,
}

impl FluxBlockConfig {
    pub fn new(hidden_size: usize, num_heads: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            num_heads,
            intermediate_size,
        }
    }

    pub fn init_joint<B: Backend>(&self, device: &B::Device) -> JointTransformerBlock<B> {
        let norm = AdaLayerNormConfig::new(self.hidden_size, self.hidden_size);
        let ff = FeedForwardConfig::new(self.hidden_size, self.intermediate_size);

        JointTransformerBlock {
            norm1: norm.init_zero(device),
            norm1_context: norm.init_zero(device),
            attn: JointAttention::new(self.hidden_size, self.num_heads, device),
            ff: ff.init(device),
            ff_context: ff.init(device),
        }
    }

    pub fn init_single<B: Backend>(&self, device: &B::Device) -> SingleTransformerBlock<B> {
        SingleTransformerBlock {
            norm: AdaLayerNormConfig::new(self.hidden_size, self.hidden_size).init_zero_single(device),
            proj_mlp: LinearConfig::new(self.hidden_size, self.intermediate_size)
                .with_bias(true)
                .init(device),
            attn: QkvProjection::new(self.hidden_size, self.num_heads, device),
            proj_out: LinearConfig::new(self.hidden_size + self.intermediate_size, self.hidden_size)
                .with_bias(true)
                .init(device),
        }
    }
}

/// Dual-stream block
///
/// Text and image keep separate weights for modulation, projections and
/// feed-forward but attend jointly.
#[derive(Module, Debug)]
pub struct JointTransformerBlock<B: Backend> {
    pub norm1: AdaLayerNormZero<B>,
    pub norm1_context: AdaLayerNormZero<B>,
    pub attn: JointAttention<B>,
    pub ff: FeedForward<B>,
    pub ff_context: FeedForward<B>,
}

impl<B: Backend> JointTransformerBlock<B> {
    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Image tokens `[batch, image_len, hidden]`
    /// * `encoder_hidden_states` - Text tokens `[batch, text_len, hidden]`
    /// * `cond` - Conditioning vector `[batch, hidden]`
    /// * `rope` - Rotary table for `text_len + image_len` tokens
    ///
    /// # Returns
    ///
    /// `(encoder_hidden_states, hidden_states)`, same shapes as the inputs
    pub fn forward(
        &self,
        hidden_states: Tensor<B, 3>,
        encoder_hidden_states: Tensor<B, 3>,
        cond: Tensor<B, 2>,
        rope: &RotaryEmbedding<B>,
        strategy: AttentionStrategy,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let (norm_hidden, hidden_mod) = self.norm1.forward(hidden_states.clone(), cond.clone());
        let (norm_context, context_mod) = self.norm1_context.forward(encoder_hidden_states.clone(), cond);

        let (attn_out, context_attn_out) = self.attn.forward(norm_hidden, norm_context, rope, strategy);
        let norm2 = LayerNorm::default();

        // Image stream
        let hidden_states = hidden_states + hidden_mod.gate_msa * attn_out;
        let norm_hidden = modulate(
            norm2.forward(hidden_states.clone()),
            hidden_mod.shift_mlp,
            hidden_mod.scale_mlp,
        );
        let hidden_states = hidden_states + hidden_mod.gate_mlp * self.ff.forward(norm_hidden);

        // Text stream
        let encoder_hidden_states = encoder_hidden_states + context_mod.gate_msa * context_attn_out;
        let norm_context = modulate(
            norm2.forward(encoder_hidden_states.clone()),
            context_mod.shift_mlp,
            context_mod.scale_mlp,
        );
        let encoder_hidden_states =
            encoder_hidden_states + context_mod.gate_mlp * self.ff_context.forward(norm_context);

        (encoder_hidden_states, hidden_states)
    }
}

/// Single-stream block over the merged text+image sequence
///
/// Attention and the MLP run in parallel on the same modulated input and
/// share one output projection and gate.
#[derive(Module, Debug)]
pub struct SingleTransformerBlock<B: Backend> {
    pub norm: AdaLayerNormZeroSingle<B>,
    pub proj_mlp: Linear<B>,
    pub attn: QkvProjection<B>,
    pub proj_out: Linear<B>,
}

impl<B: Backend> SingleTransformerBlock<B> {
    /// Maps `[batch, seq_len, hidden]` to the same shape
    pub fn forward(
        &self,
        hidden_states: Tensor<B, 3>,
        cond: Tensor<B, 2>,
        rope: &RotaryEmbedding<B>,
        strategy: AttentionStrategy,
    ) -> Tensor<B, 3> {
        let (norm_hidden, gate) = self.norm.forward(hidden_states.clone(), cond);

        let mlp = gelu_tanh(self.proj_mlp.forward(norm_hidden.clone()));

        let (q, k, v) = self.attn.forward(norm_hidden);
        let (q, k) = rope.forward(q, k);
        let attn = merge_heads(scaled_dot_product_attention(q, k, v, strategy));

        let out = self.proj_out.forward(Tensor::cat(vec![attn, mlp], 2));
        hidden_states + gate * out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_flux_core::rope::{image_position_ids, joint_position_ids, text_position_ids};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn rope(text_len: usize, rows: usize, cols: usize) -> RotaryEmbedding<TestBackend> {
        let device = Default::default();
        let ids = joint_position_ids(
            text_position_ids(1, text_len, &device),
            image_position_ids(1, rows, cols, &device),
        );
        RotaryEmbedding::from_position_ids(ids, &[4, 6, 6], 10_000.0)
    }

    #[test]
    fn test_qkv_projection_shapes() {
        let device = Default::default();
        let proj = QkvProjection::<TestBackend>::new(32, 2, &device);
        let x = Tensor::random([2, 5, 32], Distribution::Normal(0.0, 1.0), &device);

        let (q, k, v) = proj.forward(x);
        assert_eq!(q.dims(), [2, 2, 5, 16]);
        assert_eq!(k.dims(), [2, 2, 5, 16]);
        assert_eq!(v.dims(), [2, 2, 5, 16]);
    }

    #[test]
    fn test_joint_block_preserves_token_counts() {
        let device = Default::default();
        let block = FluxBlockConfig::new(32, 2, 128).init_joint::<TestBackend>(&device);

        let image = Tensor::random([2, 9, 32], Distribution::Normal(0.0, 1.0), &device);
        let text = Tensor::random([2, 4, 32], Distribution::Normal(0.0, 1.0), &device);
        let cond = Tensor::random([2, 32], Distribution::Normal(0.0, 1.0), &device);

        let (text_out, image_out) =
            block.forward(image, text, cond, &rope(4, 3, 3), AttentionStrategy::Standard);

        assert_eq!(text_out.dims(), [2, 4, 32]);
        assert_eq!(image_out.dims(), [2, 9, 32]);
    }

    #[test]
    fn test_single_block_preserves_length() {
        let device = Default::default();
        let block = FluxBlockConfig::new(32, 2, 128).init_single::<TestBackend>(&device);

        let x = Tensor::random([1, 13, 32], Distribution::Normal(0.0, 1.0), &device);
        let cond = Tensor::random([1, 32], Distribution::Normal(0.0, 1.0), &device);

        let out = block.forward(x, cond, &rope(4, 3, 3), AttentionStrategy::Standard);
        assert_eq!(out.dims(), [1, 13, 32]);
    }

    #[test]
    fn test_single_block_strategies_agree() {
        let device = Default::default();
        let block = FluxBlockConfig::new(32, 2, 128).init_single::<TestBackend>(&device);
        let rope = rope(4, 3, 3);

        let x: Tensor<TestBackend, 3> = Tensor::random([1, 13, 32], Distribution::Normal(0.0, 1.0), &device);
        let cond: Tensor<TestBackend, 2> = Tensor::random([1, 32], Distribution::Normal(0.0, 1.0), &device);

        let standard = block.forward(x.clone(), cond.clone(), &rope, AttentionStrategy::Standard);
        let chunked = block.forward(x, cond, &rope, AttentionStrategy::QueryChunked(5));

        let diff: f32 = (standard - chunked).abs().max().into_scalar();
        assert!(diff < 1e-4, "strategies differ by {diff}");
    }
}
