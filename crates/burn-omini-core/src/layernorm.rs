//! Layer normalization implementation
//!
//! Flux blocks normalise every stream without a learned affine transform and
//! let adaLN modulation supply scale and shift instead, so the affine part is
//! optional here.

use burn::prelude::*;

/// Layer normalization module
///
/// Normalizes inputs across the last dimension, then optionally applies a
/// learned affine transformation (scale and shift).
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    /// Scale parameter (absent when elementwise affine is disabled)
    pub weight: Option<Tensor<B, 1>>,
    /// Shift parameter (absent when elementwise affine is disabled)
    pub bias: Option<Tensor<B, 1>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Creates a layer norm with unit weight and zero bias
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the normalized dimension (last dimension)
    /// * `device` - Device to create tensors on
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            weight: Some(Tensor::ones([size], device)),
            bias: Some(Tensor::zeros([size], device)),
            eps: 1e-5,
        }
    }

    /// Creates a layer norm with no learned parameters
    ///
    /// This is the `elementwise_affine=False` variant used in front of every
    /// adaLN modulation.
    pub fn without_affine(eps: f64) -> Self {
        Self {
            weight: None,
            bias: None,
            eps,
        }
    }

    /// Applies layer normalization to the input tensor
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of any dimensionality
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        // Population variance, as torch's layer_norm uses
        let centered = x - mean;
        let var = centered.clone().powf_scalar(2.0).mean_dim(last_dim);

        let x_norm = centered / (var + self.eps).sqrt();

        let x_norm = match &self.weight {
            Some(weight) => x_norm * weight.clone().unsqueeze(),
            None => x_norm,
        };
        match &self.bias {
            Some(bias) => x_norm + bias.clone().unsqueeze(),
            None => x_norm,
        }
    }
}
