//! Rotary Position Embedding over N-axis position ids
//!
//! Flux addresses every token with a small vector of position ids (text
//! tokens use all zeros, image tokens use `(0, row, col)`). Each axis gets its
//! own slice of the head dimension and its own frequency ladder; the per-axis
//! rotations are concatenated into one `cos`/`sin` pair per token.
//!
//! Because the embedding is computed per token, a stream can be shifted in
//! position space simply by offsetting its ids before calling
//! [`FluxPosEmbed::forward`]. Condition streams rely on this.

use burn::prelude::*;

/// Generator of rotary embeddings from position ids
///
/// # Formula
///
/// For axis `a` with dimension `d_a` and position `p`, pair `i` rotates by
/// `p * theta^(-2i/d_a)`. Pairs are adjacent channels `(x_2i, x_2i+1)`.
///
/// # References
///
/// - [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)
#[derive(Debug, Clone, PartialEq)]
pub struct FluxPosEmbed {
    /// Base frequency
    pub theta: f32,
    /// Head-dimension share of each position axis (each must be even)
    pub axes_dim: Vec<usize>,
}

impl FluxPosEmbed {
    /// Creates a positional embedder
    ///
    /// # Panics
    ///
    /// Panics if any axis dimension is odd
    pub fn new(theta: f32, axes_dim: Vec<usize>) -> Self {
        assert!(
            axes_dim.iter().all(|d| d % 2 == 0),
            "every rotary axis dimension must be even"
        );
        Self { theta, axes_dim }
    }

    /// The Flux.1 layout: theta 10000, axes `[16, 56, 56]` (head_dim 128)
    pub fn flux() -> Self {
        Self::new(10000.0, vec![16, 56, 56])
    }

    /// Head dimension covered by all axes together
    pub fn head_dim(&self) -> usize {
        self.axes_dim.iter().sum()
    }

    /// Computes the rotary embedding for a stream
    ///
    /// # Arguments
    ///
    /// * `ids` - Position ids `[seq_len, n_axes]`
    ///
    /// # Returns
    ///
    /// Rotary tables of shape `[seq_len, head_dim]`
    ///
    /// # Panics
    ///
    /// Panics if `ids` does not carry one column per axis
    pub fn forward<B: Backend>(&self, ids: Tensor<B, 2>) -> Rotary<B> {
        let [seq_len, n_axes] = ids.dims();
        assert_eq!(
            n_axes,
            self.axes_dim.len(),
            "position ids carry {} axes but the embedder expects {}",
            n_axes,
            self.axes_dim.len()
        );
        let device = ids.device();

        let mut cos_parts = Vec::with_capacity(n_axes);
        let mut sin_parts = Vec::with_capacity(n_axes);

        for (axis, &dim) in self.axes_dim.iter().enumerate() {
            let half = dim / 2;
            let inv_freq: Vec<f32> = (0..half)
                .map(|i| 1.0 / self.theta.powf((2 * i) as f32 / dim as f32))
                .collect();
            let inv_freq = Tensor::<B, 1>::from_floats(inv_freq.as_slice(), &device)
                .reshape([1, half]);

            // [seq_len, 1] x [1, half] -> [seq_len, half]
            let positions = ids.clone().narrow(1, axis, 1);
            let angles = positions.matmul(inv_freq);

            cos_parts.push(repeat_interleave(angles.clone().cos()));
            sin_parts.push(repeat_interleave(angles.sin()));
        }

        let cos = Tensor::cat(cos_parts, 1);
        let sin = Tensor::cat(sin_parts, 1);
        debug_assert_eq!(cos.dims(), [seq_len, self.head_dim()]);

        Rotary { cos, sin }
    }
}

/// Repeats each value to create pairs: [a, b, c] -> [a, a, b, b, c, c]
fn repeat_interleave<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [seq_len, half_dim] = x.dims();
    let x_expanded = x.unsqueeze_dim::<3>(2);
    let x_repeated = x_expanded.repeat_dim(2, 2);
    x_repeated.reshape([seq_len, half_dim * 2])
}

/// Precomputed rotary tables for one token stream
#[derive(Debug, Clone)]
pub struct Rotary<B: Backend> {
    /// Cosine table `[seq_len, head_dim]`
    pub cos: Tensor<B, 2>,
    /// Sine table `[seq_len, head_dim]`
    pub sin: Tensor<B, 2>,
}

impl<B: Backend> Rotary<B> {
    /// A rotary embedding that leaves its input unchanged
    pub fn identity(seq_len: usize, head_dim: usize, device: &B::Device) -> Self {
        Self {
            cos: Tensor::ones([seq_len, head_dim], device),
            sin: Tensor::zeros([seq_len, head_dim], device),
        }
    }

    /// Number of positions covered
    pub fn seq_len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Head dimension covered
    pub fn head_dim(&self) -> usize {
        self.cos.dims()[1]
    }

    /// Concatenates tables along the sequence axis, in the given order
    pub fn cat(parts: Vec<Self>) -> Self {
        let (cos, sin): (Vec<_>, Vec<_>) = parts.into_iter().map(|r| (r.cos, r.sin)).unzip();
        Self {
            cos: Tensor::cat(cos, 0),
            sin: Tensor::cat(sin, 0),
        }
    }

    /// Rotates a query or key tensor
    ///
    /// # Arguments
    ///
    /// * `x` - Tensor of shape `[batch, heads, seq_len, head_dim]`
    ///
    /// # Returns
    ///
    /// Rotated tensor with the same shape
    pub fn apply(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        // Broadcast to [1, 1, seq_len, head_dim]
        let cos = self.cos.clone().unsqueeze::<4>();
        let sin = self.sin.clone().unsqueeze::<4>();

        let x_rotated = rotate_pairs(x.clone());
        x * cos + x_rotated * sin
    }
}

/// Rotates adjacent pairs: [x0, x1, x2, x3] -> [-x1, x0, -x3, x2]
fn rotate_pairs<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
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
