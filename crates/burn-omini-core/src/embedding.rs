//! Timestep embeddings
//!
//! Converts scalar diffusion timesteps into conditioning vectors: a fixed
//! sinusoidal encoding followed by a two-layer SiLU MLP.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Sinusoidal timestep encoding, cosine half first
///
/// # Arguments
///
/// * `t` - Timesteps `[batch]`, already in the model's scale (Flux uses `t * 1000`)
/// * `dim` - Encoding width (even)
///
/// # Returns
///
/// `[batch, dim]` laid out as `[cos(t * f_0..f_half), sin(t * f_0..f_half)]`
/// with `f_i = 10000^(-i / half)`
pub fn timestep_sinusoidal<B: Backend>(t: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let device = t.device();
    let half = dim / 2;
    let exponent = -(10000.0_f32.ln()) / half as f32;

    let freqs: Vec<f32> = (0..half).map(|i| (exponent * i as f32).exp()).collect();
    let freqs = Tensor::<B, 1>::from_floats(freqs.as_slice(), &device).reshape([1, half]);

    // [batch, 1] x [1, half] -> [batch, half]
    let angles = t.unsqueeze_dim::<2>(1).matmul(freqs);

    Tensor::cat(vec![angles.clone().cos(), angles.sin()], 1)
}

/// Timestep embedding MLP
///
/// Converts scalar timestep to embedding via sinusoidal encoding + MLP
#[derive(Module, Debug)]
pub struct TimestepEmbedding<B: Backend> {
    /// First linear
    pub linear1: Linear<B>,
    /// Second linear
    pub linear2: Linear<B>,
    /// Embedding dimension for sinusoidal encoding
    #[module(skip)]
    pub embed_dim: usize,
}

impl<B: Backend> TimestepEmbedding<B> {
    /// Creates the MLP mapping a `embed_dim` encoding to `hidden_size`
    pub fn new(embed_dim: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            linear1: LinearConfig::new(embed_dim, hidden_size)
                .with_bias(true)
                .init(device),
            linear2: LinearConfig::new(hidden_size, hidden_size)
                .with_bias(true)
                .init(device),
            embed_dim,
        }
    }

    /// Forward pass - converts timestep scalar to hidden dimension embedding
    pub fn forward(&self, t: Tensor<B, 1>) -> Tensor<B, 2> {
        let emb = timestep_sinusoidal(t, self.embed_dim);
        let x = self.linear1.forward(emb);
        let x = burn::tensor::activation::silu(x);
        self.linear2.forward(x)
    }
}
