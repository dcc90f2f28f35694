//! Dual-stream block
//!
//! The context stream has its own modulation, projections and feed-forward;
//! main and condition streams share one set. Each stream is modulated by its
//! own timestep embedding and gated only by its own gates.

use burn::prelude::*;
use burn_omini_core::layernorm::LayerNorm;
use burn_omini_core::lora::{AdapterScope, LoraLinear};
use burn_omini_core::precision::clamp_if_half;
use burn_omini_core::rope::Rotary;

use crate::attention::JointAttention;
use crate::config::BlockOptions;
use crate::error::BlockError;
use crate::modulation::{modulate, AdaLayerNormZero, FeedForward, NORM_EPS};
use crate::stream::{StreamRole, Streams};

/// Flux dual-stream (joint) transformer block
#[derive(Module, Debug)]
pub struct DoubleStreamBlock<B: Backend> {
    pub norm1: AdaLayerNormZero<B>,
    pub norm1_context: AdaLayerNormZero<B>,
    pub attn: JointAttention<B>,
    pub norm2: LayerNorm<B>,
    pub ff: FeedForward<B>,
    pub norm2_context: LayerNorm<B>,
    pub ff_context: FeedForward<B>,
}

impl<B: Backend> DoubleStreamBlock<B> {
    /// # Arguments
    ///
    /// * `dim` - Hidden size
    /// * `num_heads` - Attention heads
    /// * `mlp_dim` - Feed-forward inner size
    /// * `path` - Module path, e.g. `transformer_blocks.3`
    pub fn new(dim: usize, num_heads: usize, mlp_dim: usize, path: &str, device: &B::Device) -> Self {
        Self {
            norm1: AdaLayerNormZero::new(dim, &format!("{path}.norm1"), device),
            norm1_context: AdaLayerNormZero::new(dim, &format!("{path}.norm1_context"), device),
            attn: JointAttention::joint(dim, num_heads, &format!("{path}.attn"), device),
            norm2: LayerNorm::without_affine(NORM_EPS),
            ff: FeedForward::new(dim, mlp_dim, &format!("{path}.ff"), device),
            norm2_context: LayerNorm::without_affine(NORM_EPS),
            ff_context: FeedForward::new(dim, mlp_dim, &format!("{path}.ff_context"), device),
        }
    }

    pub fn lora_layers_mut(&mut self) -> Vec<&mut LoraLinear<B>> {
        let mut layers = vec![&mut self.norm1.linear, &mut self.norm1_context.linear];
        layers.extend(self.attn.lora_layers_mut());
        layers.extend([
            &mut self.ff.proj_in,
            &mut self.ff.proj_out,
            &mut self.ff_context.proj_in,
            &mut self.ff_context.proj_out,
        ]);
        layers
    }

    /// One block update of every present stream
    ///
    /// # Arguments
    ///
    /// * `hidden` - Hidden states `[batch, seq, dim]` per stream
    /// * `temb` - Timestep embedding `[batch, dim]` for every present stream
    /// * `rotary` - Rotary tables per stream
    /// * `options` - Block options
    /// * `scope` - Adapter state
    ///
    /// # Returns
    ///
    /// Updated streams, exactly the roles of `hidden`.
    pub fn forward(
        &self,
        hidden: Streams<Tensor<B, 3>>,
        temb: &Streams<Tensor<B, 2>>,
        rotary: Option<&Streams<Rotary<B>>>,
        options: &BlockOptions,
        scope: &AdapterScope,
    ) -> Result<Streams<Tensor<B, 3>>, BlockError> {
        let modulated = hidden.as_ref().try_map(|role, x| {
            let emb = temb.get(role).ok_or(BlockError::MissingEmbedding(role))?.clone();
            let norm = match role {
                StreamRole::Context => &self.norm1_context,
                _ => &self.norm1,
            };
            let _latent = scope.enable(&[&norm.linear], options.adapters_enabled(role));
            Ok::<_, BlockError>(norm.forward(x.clone(), emb, scope))
        })?;

        let attn_in = modulated.as_ref().map(|_, m| m.x.clone());
        let attn_out = self.attn.forward(attn_in, rotary, options, scope)?;

        let gated = modulated
            .as_ref()
            .zip(attn_out)
            .map(|_, (m, out)| m.gate_msa.clone() * out);

        // Fused before any residual is updated
        let side = if options.add_cond_attn {
            [gated.condition.clone(), gated.extra_condition.clone()]
                .into_iter()
                .flatten()
                .reduce(|a, b| a + b)
        } else {
            None
        };

        let mut hidden = hidden.zip(gated).map(|_, (x, attn)| x + attn);
        if let Some(side) = side {
            hidden.main = hidden.main + side;
        }

        let mut out = hidden.zip(modulated).map(|role, (x, m)| {
            let ff_out = match role {
                StreamRole::Context => {
                    let normed = modulate(self.norm2_context.forward(x.clone()), m.shift_mlp, m.scale_mlp);
                    self.ff_context.forward(normed, scope)
                }
                _ => {
                    let normed = modulate(self.norm2.forward(x.clone()), m.shift_mlp, m.scale_mlp);
                    let _latent = scope.enable(&[&self.ff.proj_out], options.adapters_enabled(role));
                    self.ff.forward(normed, scope)
                }
            };
            x + m.gate_mlp * ff_out
        });

        out.context = out.context.map(clamp_if_half);
        Ok(out)
    }
}
