//! Scaled dot-product attention
//!
//! FLUX attention is bidirectional and unmasked: every token attends to every
//! other token of the joint text+image sequence. At 1024x1024 that is 4352
//! tokens, so the full score matrix is large; the chunked strategies trade a
//! loop for a bounded peak allocation and compute the same result.

use burn::prelude::*;

/// How the score matrix is materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttentionStrategy {
    /// Materialize `[batch, heads, seq, seq]` at once
    #[default]
    Standard,
    /// Process queries in chunks of the given length
    QueryChunked(usize),
    /// Process heads in slices of the given size
    HeadSliced(usize),
}

impl AttentionStrategy {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            AttentionStrategy::Standard => "standard",
            AttentionStrategy::QueryChunked(_) => "query_chunked",
            AttentionStrategy::HeadSliced(_) => "head_sliced",
        }
    }
}

/// Computes `softmax(Q K^T / sqrt(d)) V` with the chosen strategy
///
/// # Arguments
///
/// * `q`, `k`, `v` - `[batch, heads, seq_len, head_dim]`
///
/// # Returns
///
/// `[batch, heads, seq_len, head_dim]`
pub fn scaled_dot_product_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    strategy: AttentionStrategy,
) -> Tensor<B, 4> {
    match strategy {
        AttentionStrategy::Standard => standard_attention(q, k, v),
        AttentionStrategy::QueryChunked(chunk) => query_chunked_attention(q, k, v, chunk.max(1)),
        AttentionStrategy::HeadSliced(slice) => head_sliced_attention(q, k, v, slice.max(1)),
    }
}

fn standard_attention<B: Backend>(q: Tensor<B, 4>, k: Tensor<B, 4>, v: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, _, head_dim] = q.dims();
    let scale = (head_dim as f64).powf(-0.5);

    let attn = q.matmul(k.transpose()) * scale;
    let attn = burn::tensor::activation::softmax(attn, 3);
    attn.matmul(v)
}

/// Softmax is row-wise over keys, so splitting the query axis is exact.
fn query_chunked_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    chunk_size: usize,
) -> Tensor<B, 4> {
    let [batch, heads, seq_len, head_dim] = q.dims();

    if seq_len <= chunk_size {
        return standard_attention(q, k, v);
    }

    let outputs: Vec<_> = (0..seq_len)
        .step_by(chunk_size)
        .map(|start| {
            let end = (start + chunk_size).min(seq_len);
            let q_chunk = q.clone().slice([0..batch, 0..heads, start..end, 0..head_dim]);
            standard_attention(q_chunk, k.clone(), v.clone())
        })
        .collect();

    Tensor::cat(outputs, 2)
}

fn head_sliced_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    slice_size: usize,
) -> Tensor<B, 4> {
    let [batch, heads, seq_len, head_dim] = q.dims();
    let [_, _, kv_len, _] = k.dims();

    if heads <= slice_size {
        return standard_attention(q, k, v);
    }

    let outputs: Vec<_> = (0..heads)
        .step_by(slice_size)
        .map(|start| {
            let end = (start + slice_size).min(heads);
            let q_slice = q.clone().slice([0..batch, start..end, 0..seq_len, 0..head_dim]);
            let k_slice = k.clone().slice([0..batch, start..end, 0..kv_len, 0..head_dim]);
            let v_slice = v.clone().slice([0..batch, start..end, 0..kv_len, 0..head_dim]);
            standard_attention(q_slice, k_slice, v_slice)
        })
        .collect();

    Tensor::cat(outputs, 1)
}

/// `[batch, seq, heads * head_dim]` -> `[batch, heads, seq, head_dim]`
pub fn split_heads<B: Backend>(x: Tensor<B, 3>, num_heads: usize) -> Tensor<B, 4> {
    let [batch, seq_len, hidden] = x.dims();
    x.reshape([batch, seq_len, num_heads, hidden / num_heads])
        .swap_dims(1, 2)
}

/// `[batch, heads, seq, head_dim]` -> `[batch, seq, heads * head_dim]`
pub fn merge_heads<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, heads, seq_len, head_dim] = x.dims();
    x.swap_dims(1, 2).reshape([batch, seq_len, heads * head_dim])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn random_qkv() -> [Tensor<TestBackend, 4>; 3] {
        let device = Default::default();
        let shape = [2, 4, 37, 8];
        [
            Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device),
            Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device),
            Tensor::random(shape, Distribution::Normal(0.0, 1.0), &device),
        ]
    }

    fn max_abs_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_strategies_agree() {
        let [q, k, v] = random_qkv();
        let reference = scaled_dot_product_attention(
            q.clone(),
            k.clone(),
            v.clone(),
            AttentionStrategy::Standard,
        );

        for strategy in [
            AttentionStrategy::QueryChunked(8),
            AttentionStrategy::QueryChunked(100),
            AttentionStrategy::HeadSliced(1),
            AttentionStrategy::HeadSliced(3),
        ] {
            let out = scaled_dot_product_attention(q.clone(), k.clone(), v.clone(), strategy);
            assert_eq!(out.dims(), [2, 4, 37, 8]);
            let diff = max_abs_diff(reference.clone(), out);
            assert!(diff < 1e-4, "{} differs by {diff}", strategy.name());
        }
    }

    #[test]
    fn test_uniform_keys_average_values() {
        let device = Default::default();
        let q: Tensor<TestBackend, 4> = Tensor::zeros([1, 1, 2, 4], &device);
        let k: Tensor<TestBackend, 4> = Tensor::zeros([1, 1, 3, 4], &device);
        let v: Tensor<TestBackend, 4> =
            Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, 0.0, 0.0, 3.0, 3.0, 3.0, 3.0, 6.0, 6.0, 6.0, 6.0], &device)
                .reshape([1, 1, 3, 4]);

        let out: Vec<f32> = scaled_dot_product_attention(q, k, v, AttentionStrategy::Standard)
            .into_data()
            .to_vec()
            .unwrap();
        assert!(out.iter().all(|x| (x - 3.0).abs() < 1e-5));
    }

    #[test]
    fn test_split_merge_heads_inverse() {
        let device = Default::default();
        let x: Tensor<TestBackend, 3> =
            Tensor::random([2, 5, 12], Distribution::Normal(0.0, 1.0), &device);

        let heads = split_heads(x.clone(), 3);
        assert_eq!(heads.dims(), [2, 3, 5, 4]);

        let merged = merge_heads(heads);
        let diff: f32 = (merged - x).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }
}
