//! adaLN-Zero modulation and the feed-forward network
//!
//! Each stream is normalised without a learned affine and modulated by
//! shift/scale/gate vectors projected from that stream's own timestep
//! embedding. The projections are [`LoraLinear`] so that adapters can reach
//! them, and every forward call takes the [`AdapterScope`] it runs under.

use burn::prelude::*;
use burn::tensor::activation::silu;
use burn_omini_core::layernorm::LayerNorm;
use burn_omini_core::lora::{AdapterScope, LoraLinear};

/// Epsilon of every Flux normalisation
pub const NORM_EPS: f64 = 1e-6;

/// GELU with the tanh approximation
///
/// `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`
pub fn gelu_tanh<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let inner = (x.clone() + x.clone().powf_scalar(3.0) * 0.044715)
        * (2.0 / std::f64::consts::PI).sqrt();
    x * (inner.tanh() + 1.0) * 0.5
}

/// Chunk `index` of a `[batch, n * dim]` projection, as broadcastable `[batch, 1, dim]`
fn chunk<B: Backend>(x: &Tensor<B, 2>, index: usize, dim: usize) -> Tensor<B, 3> {
    x.clone().narrow(1, index * dim, dim).unsqueeze_dim(1)
}

/// `x * (1 + scale) + shift`
pub fn modulate<B: Backend>(x: Tensor<B, 3>, shift: Tensor<B, 3>, scale: Tensor<B, 3>) -> Tensor<B, 3> {
    x * (scale + 1.0) + shift
}

/// Output of the dual-block modulation for one stream
#[derive(Debug, Clone)]
pub struct Modulated<B: Backend> {
    /// Normalised input to attention
    pub x: Tensor<B, 3>,
    pub gate_msa: Tensor<B, 3>,
    pub shift_mlp: Tensor<B, 3>,
    pub scale_mlp: Tensor<B, 3>,
    pub gate_mlp: Tensor<B, 3>,
}

/// adaLN-Zero for dual-stream blocks (six modulation vectors)
#[derive(Module, Debug)]
pub struct AdaLayerNormZero<B: Backend> {
    pub linear: LoraLinear<B>,
    pub norm: LayerNorm<B>,
}

impl<B: Backend> AdaLayerNormZero<B> {
    /// `path` is the module path, e.g. `transformer_blocks.0.norm1`
    pub fn new(dim: usize, path: &str, device: &B::Device) -> Self {
        Self {
            linear: LoraLinear::init(dim, 6 * dim, format!("{path}.linear"), device),
            norm: LayerNorm::without_affine(NORM_EPS),
        }
    }

    /// # Arguments
    ///
    /// * `x` - Stream `[batch, seq, dim]`
    /// * `emb` - That stream's timestep embedding `[batch, dim]`
    pub fn forward(&self, x: Tensor<B, 3>, emb: Tensor<B, 2>, scope: &AdapterScope) -> Modulated<B> {
        let dim = x.dims()[2];
        let emb = self.linear.forward(silu(emb), scope);

        let shift_msa = chunk(&emb, 0, dim);
        let scale_msa = chunk(&emb, 1, dim);

        Modulated {
            x: modulate(self.norm.forward(x), shift_msa, scale_msa),
            gate_msa: chunk(&emb, 2, dim),
            shift_mlp: chunk(&emb, 3, dim),
            scale_mlp: chunk(&emb, 4, dim),
            gate_mlp: chunk(&emb, 5, dim),
        }
    }
}

/// adaLN-Zero for single-stream blocks: shift, scale, gate
#[derive(Module, Debug)]
pub struct AdaLayerNormZeroSingle<B: Backend> {
    pub linear: LoraLinear<B>,
    pub norm: LayerNorm<B>,
}

impl<B: Backend> AdaLayerNormZeroSingle<B> {
    pub fn new(dim: usize, path: &str, device: &B::Device) -> Self {
        Self {
            linear: LoraLinear::init(dim, 3 * dim, format!("{path}.linear"), device),
            norm: LayerNorm::without_affine(NORM_EPS),
        }
    }

    /// Returns the modulated input and the gate
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        emb: Tensor<B, 2>,
        scope: &AdapterScope,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let dim = x.dims()[2];
        let emb = self.linear.forward(silu(emb), scope);

        let shift = chunk(&emb, 0, dim);
        let scale = chunk(&emb, 1, dim);
        (modulate(self.norm.forward(x), shift, scale), chunk(&emb, 2, dim))
    }
}

/// Final adaLN, scale chunk first
#[derive(Module, Debug)]
pub struct AdaLayerNormContinuous<B: Backend> {
    pub linear: LoraLinear<B>,
    pub norm: LayerNorm<B>,
}

impl<B: Backend> AdaLayerNormContinuous<B> {
    pub fn new(dim: usize, path: &str, device: &B::Device) -> Self {
        Self {
            linear: LoraLinear::init(dim, 2 * dim, format!("{path}.linear"), device),
            norm: LayerNorm::without_affine(NORM_EPS),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, emb: Tensor<B, 2>, scope: &AdapterScope) -> Tensor<B, 3> {
        let dim = x.dims()[2];
        let emb = self.linear.forward(silu(emb), scope);

        let scale = chunk(&emb, 0, dim);
        let shift = chunk(&emb, 1, dim);
        modulate(self.norm.forward(x), shift, scale)
    }
}

/// Two-layer GELU(tanh) MLP
///
/// Paths follow `ff.net.0.proj` / `ff.net.2`.
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    /// dim -> inner
    pub proj_in: LoraLinear<B>,
    /// inner -> dim
    pub proj_out: LoraLinear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(dim: usize, inner_dim: usize, path: &str, device: &B::Device) -> Self {
        Self {
            proj_in: LoraLinear::init(dim, inner_dim, format!("{path}.net.0.proj"), device),
            proj_out: LoraLinear::init(inner_dim, dim, format!("{path}.net.2"), device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, scope: &AdapterScope) -> Tensor<B, 3> {
        let hidden = gelu_tanh(self.proj_in.forward(x, scope));
        self.proj_out.forward(hidden, scope)
    }
}
