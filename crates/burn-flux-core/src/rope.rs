//! Multi-axis Rotary Position Embedding (RoPE)
//!
//! FLUX assigns every token a position triple `(flag, row, col)` and splits
//! each attention head into one frequency band per axis. Text tokens sit at the
//! origin, image tokens at their latent-grid coordinates, so attention scores
//! between image tokens depend on their relative 2D offset while text tokens
//! carry no spatial bias.

use burn::prelude::*;

/// Number of coordinates in a FLUX position id: `(flag, row, col)`
pub const POSITION_AXES: usize = 3;

/// Position ids for text tokens
///
/// Text has no spatial position, so every id is the zero triple.
///
/// Returns `[batch, num_tokens, 3]`.
pub fn text_position_ids<B: Backend>(
    batch: usize,
    num_tokens: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    Tensor::zeros([batch, num_tokens, POSITION_AXES], device)
}

/// Position ids for the image tokens of a `height x width` latent grid
///
/// Tokens are laid out row-major; token `r * width + c` gets `(0, r, c)`.
/// Every batch element receives the same grid.
///
/// Returns `[batch, height * width, 3]`.
pub fn image_position_ids<B: Backend>(
    batch: usize,
    height: usize,
    width: usize,
    device: &B::Device,
) -> Tensor<B, 3> {
    let mut ids = Vec::with_capacity(height * width * POSITION_AXES);
    for row in 0..height {
        for col in 0..width {
            ids.extend_from_slice(&[0.0f32, row as f32, col as f32]);
        }
    }

    let grid: Tensor<B, 3> = Tensor::from_data(
        TensorData::new(ids, [1, height * width, POSITION_AXES]),
        device,
    );
    grid.repeat_dim(0, batch)
}

/// Concatenates text ids and image ids along the token axis (text first)
///
/// The order must match the order in which the two streams are concatenated
/// inside attention.
pub fn joint_position_ids<B: Backend>(text_ids: Tensor<B, 3>, image_ids: Tensor<B, 3>) -> Tensor<B, 3> {
    Tensor::cat(vec![text_ids, image_ids], 1)
}

/// Rotary embedding tables for one token sequence
///
/// Holds cos/sin factors of shape `[seq_len, head_dim]`, repeat-interleaved so
/// that each adjacent feature pair `(x_2i, x_2i+1)` is rotated by one angle:
///
/// ```text
/// x'_2i   = x_2i * cos - x_2i+1 * sin
/// x'_2i+1 = x_2i * sin + x_2i+1 * cos
/// ```
///
/// The head dimension is split into one band per position axis; band `a` of
/// width `d_a` uses frequencies `theta^(-2i / d_a)` applied to coordinate `a`.
///
/// # References
///
/// - [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)
#[derive(Debug, Clone)]
pub struct RotaryEmbedding<B: Backend> {
    cos: Tensor<B, 2>,
    sin: Tensor<B, 2>,
    head_dim: usize,
}

impl<B: Backend> RotaryEmbedding<B> {
    /// Builds rotary tables from position ids
    ///
    /// # Arguments
    ///
    /// * `ids` - Position ids `[batch, seq_len, num_axes]`. Ids are shared across
    ///   the batch, so only the first element is read and the table length does
    ///   not depend on the batch size.
    /// * `axes_dim` - Feature width allotted to each axis (each must be even)
    /// * `theta` - Base frequency
    ///
    /// # Panics
    ///
    /// Panics if `axes_dim` does not have one entry per id axis or contains an
    /// odd width.
    pub fn from_position_ids(ids: Tensor<B, 3>, axes_dim: &[usize], theta: f32) -> Self {
        let [_batch, seq_len, num_axes] = ids.dims();
        assert_eq!(
            num_axes,
            axes_dim.len(),
            "position ids have {num_axes} axes but {} axis widths were given",
            axes_dim.len()
        );
        assert!(
            axes_dim.iter().all(|d| d % 2 == 0),
            "every rotary axis width must be even, got {axes_dim:?}"
        );

        let device = ids.device();
        let ids = ids.slice([0..1, 0..seq_len, 0..num_axes]).reshape([seq_len, num_axes]);

        let mut cos_bands = Vec::with_capacity(num_axes);
        let mut sin_bands = Vec::with_capacity(num_axes);

        for (axis, &dim) in axes_dim.iter().enumerate() {
            let half_dim = dim / 2;
            let inv_freq: Vec<f32> = (0..half_dim)
                .map(|i| 1.0 / theta.powf((2 * i) as f32 / dim as f32))
                .collect();
            let inv_freq = Tensor::<B, 1>::from_floats(inv_freq.as_slice(), &device);

            // [seq_len, 1] x [1, half_dim] -> [seq_len, half_dim]
            let positions = ids.clone().slice([0..seq_len, axis..axis + 1]);
            let angles = positions.matmul(inv_freq.unsqueeze());

            cos_bands.push(Self::repeat_interleave(angles.clone().cos()));
            sin_bands.push(Self::repeat_interleave(angles.sin()));
        }

        Self {
            cos: Tensor::cat(cos_bands, 1),
            sin: Tensor::cat(sin_bands, 1),
            head_dim: axes_dim.iter().sum(),
        }
    }

    /// Repeats each value to create pairs: [a, b, c] -> [a, a, b, b, c, c]
    fn repeat_interleave(x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [seq_len, half_dim] = x.dims();
        let x_expanded = x.unsqueeze_dim::<3>(2);
        let x_repeated = x_expanded.repeat_dim(2, 2);
        x_repeated.reshape([seq_len, half_dim * 2])
    }

    /// Number of positions covered by the tables
    pub fn len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Whether the tables cover no positions
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rotated feature width (sum of the axis widths)
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Cosine table `[seq_len, head_dim]`
    pub fn cos(&self) -> Tensor<B, 2> {
        self.cos.clone()
    }

    /// Sine table `[seq_len, head_dim]`
    pub fn sin(&self) -> Tensor<B, 2> {
        self.sin.clone()
    }

    /// Applies the rotation to query and key tensors
    ///
    /// # Arguments
    ///
    /// * `q` - Query tensor `[batch, heads, seq_len, head_dim]`
    /// * `k` - Key tensor `[batch, heads, seq_len, head_dim]`
    ///
    /// `seq_len` must equal [`len`](Self::len); callers validate this.
    pub fn forward(&self, q: Tensor<B, 4>, k: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        // Broadcast to [1, 1, seq_len, head_dim]
        let cos = self.cos.clone().unsqueeze::<4>();
        let sin = self.sin.clone().unsqueeze::<4>();

        let q_rotated = Self::apply_rotary(q, cos.clone(), sin.clone());
        let k_rotated = Self::apply_rotary(k, cos, sin);

        (q_rotated, k_rotated)
    }

    fn apply_rotary(x: Tensor<B, 4>, cos: Tensor<B, 4>, sin: Tensor<B, 4>) -> Tensor<B, 4> {
        let x_rotated = Self::rotate_pairs(x.clone());
        x * cos + x_rotated * sin
    }

    /// Rotates adjacent pairs: [x0, x1, x2, x3] -> [-x1, x0, -x3, x2]
    fn rotate_pairs(x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, heads, seq_len, head_dim] = x.dims();
        let half = head_dim / 2;

        let x_reshaped = x.reshape([batch, heads, seq_len, half, 2]);

        let x_even = x_reshaped
            .clone()
            .slice([0..batch, 0..heads, 0..seq_len, 0..half, 0..1]);
        let x_odd = x_reshaped.slice([0..batch, 0..heads, 0..seq_len, 0..half, 1..2]);

        let rotated = Tensor::cat(vec![x_odd.neg(), x_even], 4);

        rotated.reshape([batch, heads, seq_len, head_dim])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    const FLUX_AXES: [usize; 3] = [16, 56, 56];

    fn flux_ids(batch: usize) -> Tensor<TestBackend, 3> {
        let device = Default::default();
        joint_position_ids(
            text_position_ids::<TestBackend>(batch, 256, &device),
            image_position_ids::<TestBackend>(batch, 64, 64, &device),
        )
    }

    #[test]
    fn test_table_length_independent_of_batch() {
        for batch in [1, 3] {
            let rope = RotaryEmbedding::from_position_ids(flux_ids(batch), &FLUX_AXES, 10_000.0);
            assert_eq!(rope.len(), 4352);
            assert_eq!(rope.head_dim(), 128);
            assert_eq!(rope.cos().dims(), [4352, 128]);
            assert_eq!(rope.sin().dims(), [4352, 128]);
        }
    }

    #[test]
    fn test_image_ids_are_row_major_grid() {
        let device = Default::default();
        let ids = image_position_ids::<TestBackend>(2, 3, 4, &device);
        assert_eq!(ids.dims(), [2, 12, 3]);

        let values: Vec<f32> = ids.into_data().to_vec().unwrap();
        // Second batch element, token 6 = row 1, col 2
        let offset = (12 + 6) * 3;
        assert_eq!(&values[offset..offset + 3], &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_text_ids_have_no_spatial_rotation() {
        let device = Default::default();
        let ids = text_position_ids::<TestBackend>(1, 8, &device);
        let rope = RotaryEmbedding::from_position_ids(ids, &[4, 6, 6], 10_000.0);

        let q: Tensor<TestBackend, 4> =
            Tensor::random([1, 2, 8, 16], Distribution::Normal(0.0, 1.0), &device);
        let (q_rot, _) = rope.forward(q.clone(), q.clone());

        let diff: f32 = (q_rot - q).abs().max().into_scalar();
        assert!(diff < 1e-6, "zero positions must leave vectors unchanged, diff {diff}");
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let device = Default::default();
        let ids = image_position_ids::<TestBackend>(1, 4, 4, &device);
        let rope = RotaryEmbedding::from_position_ids(ids, &[4, 6, 6], 10_000.0);

        let k: Tensor<TestBackend, 4> =
            Tensor::random([1, 2, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        let (_, k_rot) = rope.forward(k.clone(), k.clone());

        let norm_before: Vec<f32> = k.powf_scalar(2.0).sum_dim(3).into_data().to_vec().unwrap();
        let norm_after: Vec<f32> = k_rot.powf_scalar(2.0).sum_dim(3).into_data().to_vec().unwrap();
        for (before, after) in norm_before.iter().zip(norm_after.iter()) {
            assert!((before - after).abs() < 1e-3, "{before} vs {after}");
        }
    }

    #[test]
    fn test_rotation_changes_image_tokens() {
        let device = Default::default();
        let ids = image_position_ids::<TestBackend>(1, 2, 2, &device);
        let rope = RotaryEmbedding::from_position_ids(ids, &[2, 2, 2], 10_000.0);

        let q: Tensor<TestBackend, 4> = Tensor::ones([1, 1, 4, 6], &device);
        let (q_rot, _) = rope.forward(q.clone(), q.clone());

        let q_data: Vec<f32> = q.into_data().to_vec().unwrap();
        let q_rot_data: Vec<f32> = q_rot.into_data().to_vec().unwrap();

        // Token 0 sits at the origin; token 3 at (1, 1) must move
        assert_eq!(&q_rot_data[0..6], &q_data[0..6]);
        let any_changed = q_data[18..24]
            .iter()
            .zip(q_rot_data[18..24].iter())
            .any(|(orig, rotated)| (orig - rotated).abs() > 1e-6);
        assert!(any_changed, "RoPE should modify off-origin tokens");
    }
}
