//! Single-stream block
//!
//! Attention and MLP run in parallel from one modulated input and are fused
//! by a shared output projection:
//!
//! ```text
//! x' = x + gate * proj_out(cat(attn(norm(x)), gelu(proj_mlp(norm(x)))))
//! ```
//!
//! The driver passes text and image tokens as one main stream here.

use burn::prelude::*;
use burn_omini_core::lora::{AdapterScope, LoraLinear};
use burn_omini_core::precision::clamp_if_half;
use burn_omini_core::rope::Rotary;

use crate::attention::JointAttention;
use crate::config::BlockOptions;
use crate::error::BlockError;
use crate::modulation::{gelu_tanh, AdaLayerNormZeroSingle};
use crate::stream::{StreamRole, Streams};

/// Flux single-stream transformer block
#[derive(Module, Debug)]
pub struct SingleStreamBlock<B: Backend> {
    pub norm: AdaLayerNormZeroSingle<B>,
    pub proj_mlp: LoraLinear<B>,
    pub attn: JointAttention<B>,
    /// `(dim + mlp_dim) -> dim`
    pub proj_out: LoraLinear<B>,
}

impl<B: Backend> SingleStreamBlock<B> {
    pub fn new(dim: usize, num_heads: usize, mlp_dim: usize, path: &str, device: &B::Device) -> Self {
        Self {
            norm: AdaLayerNormZeroSingle::new(dim, &format!("{path}.norm"), device),
            proj_mlp: LoraLinear::init(dim, mlp_dim, format!("{path}.proj_mlp"), device),
            attn: JointAttention::pre_only(dim, num_heads, &format!("{path}.attn"), device),
            proj_out: LoraLinear::init(dim + mlp_dim, dim, format!("{path}.proj_out"), device),
        }
    }

    pub fn lora_layers_mut(&mut self) -> Vec<&mut LoraLinear<B>> {
        let mut layers = vec![&mut self.norm.linear, &mut self.proj_mlp];
        layers.extend(self.attn.lora_layers_mut());
        layers.push(&mut self.proj_out);
        layers
    }

    /// One block update of the main stream and any condition streams
    ///
    /// A context stream is rejected with [`BlockError::UnsupportedStream`].
    pub fn forward(
        &self,
        hidden: Streams<Tensor<B, 3>>,
        temb: &Streams<Tensor<B, 2>>,
        rotary: Option<&Streams<Rotary<B>>>,
        options: &BlockOptions,
        scope: &AdapterScope,
    ) -> Result<Streams<Tensor<B, 3>>, BlockError> {
        if hidden.context.is_some() {
            return Err(BlockError::UnsupportedStream(StreamRole::Context));
        }

        let prepared = hidden.as_ref().try_map(|role, x| {
            let emb = temb.get(role).ok_or(BlockError::MissingEmbedding(role))?.clone();
            let _latent = scope.enable(
                &[&self.norm.linear, &self.proj_mlp],
                options.adapters_enabled(role),
            );
            let (normed, gate) = self.norm.forward(x.clone(), emb, scope);
            let mlp = gelu_tanh(self.proj_mlp.forward(normed.clone(), scope));
            Ok::<_, BlockError>((normed, gate, mlp))
        })?;

        let attn_in = prepared.as_ref().map(|_, (normed, _, _)| normed.clone());
        let attn_out = self.attn.forward(attn_in, rotary, options, scope)?;

        let mut out = hidden
            .zip(prepared)
            .zip(attn_out)
            .map(|role, ((x, (_, gate, mlp)), attn)| {
                let _latent = scope.enable(&[&self.proj_out], options.adapters_enabled(role));
                let fused = self.proj_out.forward(Tensor::cat(vec![attn, mlp], 2), scope);
                x + gate * fused
            });

        out.main = clamp_if_half(out.main);
        Ok(out)
    }
}
