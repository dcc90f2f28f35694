//! Root Mean Square Layer Normalization
//!
//! Used as the per-head query/key normalisation inside Flux attention.

use burn::prelude::*;

/// Root Mean Square Layer Normalization
///
/// Unlike LayerNorm, RMSNorm does not subtract the mean or apply a bias.
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = x / sqrt(mean(x^2) + eps) * weight
/// ```
///
/// # References
///
/// - [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    pub weight: Tensor<B, 1>,
    pub eps: f64,
}

impl<B: Backend> RmsNorm<B> {
    /// Creates a new RMSNorm module with the Flux epsilon (1e-6)
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the normalized dimension (last dimension)
    /// * `device` - Device to create tensors on
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self::with_eps(size, 1e-6, device)
    }

    /// Creates RMSNorm with a custom epsilon value
    pub fn with_eps(size: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            weight: Tensor::ones([size], device),
            eps,
        }
    }

    /// Applies RMS normalization over the last dimension
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean_sq = x.clone().powf_scalar(2.0).mean_dim(last_dim);
        let x_norm = x / (mean_sq + self.eps).sqrt();
        x_norm * self.weight.clone().unsqueeze()
    }
}
