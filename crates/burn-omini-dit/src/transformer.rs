//! Flux transformer with condition streams
//!
//! Threads text, image and condition tokens through the dual-stream blocks,
//! then merges text and image into one stream for the single-stream blocks.
//!
//! # Architecture Overview
//!
//! ```text
//! packed latents ─ x_embedder ────────┐
//! condition tokens ─ x_embedder ──────┤
//! text ─ context_embedder ────────────┤
//!                                     ↓
//! [Dual-stream blocks]   context | main | condition | extra condition
//!                                     ↓
//! [Single-stream blocks] (context + main) | condition | extra condition
//!                                     ↓
//! drop text prefix ─ norm_out ─ proj_out ─ velocity
//! ```
//!
//! Condition streams are modulated by a timestep embedding taken at
//! `condition_timestep` (0 by default), so they act as clean references
//! throughout sampling.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;
use burn_omini_core::embedding::TimestepEmbedding;
use burn_omini_core::lora::{AdapterScope, AdapterSet, LoraLinear};
use burn_omini_core::rope::{FluxPosEmbed, Rotary};
use burn_omini_core::LoraError;

use crate::condition::EncodedCondition;
use crate::config::BlockOptions;
use crate::double_block::DoubleStreamBlock;
use crate::error::{BlockError, ConfigError};
use crate::modulation::AdaLayerNormContinuous;
use crate::single_block::SingleStreamBlock;
use crate::stream::{ConditionSlot, StreamRole, Streams};

/// OminiFlux model configuration
#[derive(Debug, Clone)]
pub struct OminiFluxConfig {
    /// Channels of a packed latent token (4 x VAE channels)
    pub in_channels: usize,
    /// Hidden dimension
    pub hidden_size: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Number of dual-stream blocks
    pub num_double_blocks: usize,
    /// Number of single-stream blocks
    pub num_single_blocks: usize,
    /// Text embedding dimension (T5)
    pub text_dim: usize,
    /// Pooled text embedding dimension (CLIP)
    pub pooled_dim: usize,
    /// Sinusoidal timestep encoding width
    pub time_dim: usize,
    /// Whether the model embeds a guidance scale
    pub guidance_embeds: bool,
    /// FFN intermediate size multiplier
    pub mlp_ratio: f32,
    /// Rotary base frequency
    pub theta: f32,
    /// Head-dimension share of each position axis
    pub axes_dim: Vec<usize>,
}

impl OminiFluxConfig {
    /// Flux.1-dev configuration
    pub fn flux_dev() -> Self {
        Self {
            in_channels: 64,
            hidden_size: 3072,
            num_heads: 24,
            num_double_blocks: 19,
            num_single_blocks: 38,
            text_dim: 4096,
            pooled_dim: 768,
            time_dim: 256,
            guidance_embeds: true,
            mlp_ratio: 4.0,
            theta: 10000.0,
            axes_dim: vec![16, 56, 56],
        }
    }

    /// Flux.1-schnell: same architecture, no guidance embedding
    pub fn flux_schnell() -> Self {
        Self {
            guidance_embeds: false,
            ..Self::flux_dev()
        }
    }

    /// Tiny model for testing
    pub fn tiny() -> Self {
        Self {
            in_channels: 16,
            hidden_size: 64,
            num_heads: 4,
            num_double_blocks: 2,
            num_single_blocks: 2,
            text_dim: 32,
            pooled_dim: 16,
            time_dim: 32,
            guidance_embeds: true,
            mlp_ratio: 4.0,
            theta: 10000.0,
            axes_dim: vec![4, 6, 6],
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn mlp_dim(&self) -> usize {
        (self.hidden_size as f32 * self.mlp_ratio) as usize
    }

    /// Checks that heads split the hidden size and the rotary axes cover a head
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(ConfigError::HeadSplit {
                hidden: self.hidden_size,
                heads: self.num_heads,
            });
        }
        let axes: usize = self.axes_dim.iter().sum();
        if axes != self.head_dim() {
            return Err(ConfigError::AxesMismatch {
                axes,
                head_dim: self.head_dim(),
            });
        }
        Ok(())
    }

    /// Initialize the model
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<(OminiFlux<B>, OminiFluxRuntime), ConfigError> {
        self.validate()?;
        let dim = self.hidden_size;

        let time_text_embed = CombinedTimestepEmbedding {
            timestep_embedder: TimestepEmbedding::new(self.time_dim, dim, device),
            guidance_embedder: self
                .guidance_embeds
                .then(|| TimestepEmbedding::new(self.time_dim, dim, device)),
            text_linear1: LinearConfig::new(self.pooled_dim, dim)
                .with_bias(true)
                .init(device),
            text_linear2: LinearConfig::new(dim, dim).with_bias(true).init(device),
        };

        let transformer_blocks = (0..self.num_double_blocks)
            .map(|i| {
                DoubleStreamBlock::new(
                    dim,
                    self.num_heads,
                    self.mlp_dim(),
                    &format!("transformer_blocks.{i}"),
                    device,
                )
            })
            .collect();

        let single_transformer_blocks = (0..self.num_single_blocks)
            .map(|i| {
                SingleStreamBlock::new(
                    dim,
                    self.num_heads,
                    self.mlp_dim(),
                    &format!("single_transformer_blocks.{i}"),
                    device,
                )
            })
            .collect();

        let model = OminiFlux {
            x_embedder: LoraLinear::init(self.in_channels, dim, "x_embedder", device),
            context_embedder: LinearConfig::new(self.text_dim, dim)
                .with_bias(true)
                .init(device),
            time_text_embed,
            transformer_blocks,
            single_transformer_blocks,
            norm_out: AdaLayerNormContinuous::new(dim, "norm_out", device),
            proj_out: LoraLinear::init(dim, self.in_channels, "proj_out", device),
        };

        let runtime = OminiFluxRuntime {
            pos_embed: FluxPosEmbed::new(self.theta, self.axes_dim.clone()),
            config: self.clone(),
        };

        Ok((model, runtime))
    }
}

/// Timestep, guidance and pooled-text embedding
#[derive(Module, Debug)]
pub struct CombinedTimestepEmbedding<B: Backend> {
    pub timestep_embedder: TimestepEmbedding<B>,
    /// Present on guidance-distilled models
    pub guidance_embedder: Option<TimestepEmbedding<B>>,
    pub text_linear1: Linear<B>,
    pub text_linear2: Linear<B>,
}

impl<B: Backend> CombinedTimestepEmbedding<B> {
    /// # Arguments
    ///
    /// * `timestep` - `[batch]` in `[0, 1]`
    /// * `guidance` - `[batch]` guidance scale, ignored without a guidance embedder
    /// * `pooled` - Pooled text embedding `[batch, pooled_dim]`
    pub fn forward(
        &self,
        timestep: Tensor<B, 1>,
        guidance: Option<Tensor<B, 1>>,
        pooled: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let mut emb = self.timestep_embedder.forward(timestep * 1000.0);
        if let (Some(embedder), Some(guidance)) = (&self.guidance_embedder, guidance) {
            emb = emb + embedder.forward(guidance * 1000.0);
        }
        let text = self.text_linear2.forward(silu(self.text_linear1.forward(pooled)));
        emb + text
    }
}

/// Runtime state for OminiFlux
#[derive(Debug)]
pub struct OminiFluxRuntime {
    /// Rotary embedding generator
    pub pos_embed: FluxPosEmbed,
    /// Configuration
    pub config: OminiFluxConfig,
}

impl OminiFluxRuntime {
    /// Rotary tables for one stream's `[seq, n_axes]` position ids
    pub fn rotary<B: Backend>(
        &self,
        role: StreamRole,
        ids: Tensor<B, 2>,
    ) -> Result<Rotary<B>, BlockError> {
        let [_, found] = ids.dims();
        let expected = self.pos_embed.axes_dim.len();
        if found != expected {
            return Err(BlockError::PositionAxes {
                role,
                found,
                expected,
            });
        }
        Ok(self.pos_embed.forward(ids))
    }
}

/// Inputs of one transformer forward pass
#[derive(Debug, Clone)]
pub struct OminiFluxInput<B: Backend> {
    /// Packed noisy latents `[batch, seq, in_channels]`
    pub latents: Tensor<B, 3>,
    /// Latent position ids `[seq, 3]`
    pub latent_ids: Tensor<B, 2>,
    /// Text embeddings `[batch, txt_len, text_dim]`
    pub text: Tensor<B, 3>,
    /// Text position ids `[txt_len, 3]`, usually zeros
    pub text_ids: Tensor<B, 2>,
    /// Pooled text embedding `[batch, pooled_dim]`
    pub pooled: Tensor<B, 2>,
    /// Diffusion timestep `[batch]` in `[0, 1]`
    pub timestep: Tensor<B, 1>,
    /// Guidance scale `[batch]`
    pub guidance: Option<Tensor<B, 1>>,
    pub condition: Option<EncodedCondition<B>>,
    pub extra_condition: Option<EncodedCondition<B>>,
    /// Timestep the condition streams are modulated at
    pub condition_timestep: f32,
}

impl<B: Backend> OminiFluxInput<B> {
    /// Unconditioned input; the ids default to a `[seq, 3]` zero grid
    pub fn new(
        latents: Tensor<B, 3>,
        latent_ids: Tensor<B, 2>,
        text: Tensor<B, 3>,
        pooled: Tensor<B, 2>,
        timestep: Tensor<B, 1>,
    ) -> Self {
        let [_, txt_len, _] = text.dims();
        let text_ids = Tensor::zeros([txt_len, 3], &text.device());
        Self {
            latents,
            latent_ids,
            text,
            text_ids,
            pooled,
            timestep,
            guidance: None,
            condition: None,
            extra_condition: None,
            condition_timestep: 0.0,
        }
    }

    pub fn with_guidance(mut self, guidance: Tensor<B, 1>) -> Self {
        self.guidance = Some(guidance);
        self
    }

    pub fn with_condition(mut self, condition: EncodedCondition<B>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_extra_condition(mut self, condition: EncodedCondition<B>) -> Self {
        self.extra_condition = Some(condition);
        self
    }
}

/// Flux transformer accepting condition streams
#[derive(Module, Debug)]
pub struct OminiFlux<B: Backend> {
    /// Packed latent (and condition token) projection
    pub x_embedder: LoraLinear<B>,
    /// Text embedding projection
    pub context_embedder: Linear<B>,
    pub time_text_embed: CombinedTimestepEmbedding<B>,
    /// Dual-stream blocks
    pub transformer_blocks: Vec<DoubleStreamBlock<B>>,
    /// Single-stream blocks
    pub single_transformer_blocks: Vec<SingleStreamBlock<B>>,
    pub norm_out: AdaLayerNormContinuous<B>,
    pub proj_out: LoraLinear<B>,
}

impl<B: Backend> OminiFlux<B> {
    /// Attaches `[primary, extra]` condition factors to every attention
    ///
    /// Factors of exactly 1.0 for both streams clear them, leaving the mask
    /// to the block options: at unit scale the Isolated and One-way policies
    /// apply again instead of Bias. Any other value selects Bias, which
    /// outranks both.
    pub fn set_condition_scale(&mut self, primary: f32, extra: f32, device: &B::Device) {
        let factor = (primary != 1.0 || extra != 1.0).then_some([primary, extra]);
        for block in &mut self.transformer_blocks {
            block.attn.set_condition_factor(factor, device);
        }
        for block in &mut self.single_transformer_blocks {
            block.attn.set_condition_factor(factor, device);
        }
        tracing::debug!(?factor, "condition scale set");
    }

    /// Every projection adapters can attach to
    pub fn lora_layers_mut(&mut self) -> Vec<&mut LoraLinear<B>> {
        let mut layers = vec![&mut self.x_embedder];
        for block in &mut self.transformer_blocks {
            layers.extend(block.lora_layers_mut());
        }
        for block in &mut self.single_transformer_blocks {
            layers.extend(block.lora_layers_mut());
        }
        layers.push(&mut self.norm_out.linear);
        layers.push(&mut self.proj_out);
        layers
    }

    /// Attaches an adapter set, returning the number of layers it reached
    pub fn attach_adapters(&mut self, set: &AdapterSet<B>) -> Result<usize, LoraError> {
        let count = set.attach_to(self.lora_layers_mut())?;
        tracing::debug!(adapter = %set.name, layers = count, "adapters attached");
        Ok(count)
    }

    /// Forward pass
    ///
    /// # Returns
    ///
    /// Velocity prediction for the packed latents `[batch, seq, in_channels]`
    pub fn forward(
        &self,
        input: OminiFluxInput<B>,
        runtime: &OminiFluxRuntime,
        options: &BlockOptions,
        scope: &AdapterScope,
    ) -> Result<Tensor<B, 3>, BlockError> {
        let device = input.latents.device();
        let [batch, _, _] = input.latents.dims();
        let [_, txt_len, _] = input.text.dims();

        let main = {
            let _latent = scope.enable(&[&self.x_embedder], options.adapters_enabled(StreamRole::Main));
            self.x_embedder.forward(input.latents, scope)
        };
        let context = self.context_embedder.forward(input.text);

        let temb = self.time_text_embed.forward(
            input.timestep,
            input.guidance.clone(),
            input.pooled.clone(),
        );
        let cond_temb = self.time_text_embed.forward(
            Tensor::full([batch], input.condition_timestep, &device),
            input.guidance,
            input.pooled,
        );

        let mut hidden = Streams::new(main).with_context(context);
        let mut temb_streams = Streams::new(temb.clone()).with_context(temb.clone());
        let mut rotary = Streams::new(runtime.rotary(StreamRole::Main, input.latent_ids)?)
            .with_context(runtime.rotary(StreamRole::Context, input.text_ids)?);

        let conditions = [input.condition, input.extra_condition];
        for (slot, condition) in conditions.into_iter().enumerate() {
            let Some(condition) = condition else { continue };
            let role = StreamRole::Condition(if slot == 0 {
                ConditionSlot::Primary
            } else {
                ConditionSlot::Extra
            });
            let rope = runtime.rotary(role, condition.position_ids)?;
            let tokens = self.x_embedder.forward(condition.tokens, scope);
            let tokens = if tokens.dims()[0] == batch {
                tokens
            } else {
                tokens.repeat_dim(0, batch)
            };
            if slot == 0 {
                hidden.condition = Some(tokens);
                temb_streams.condition = Some(cond_temb.clone());
                rotary.condition = Some(rope);
            } else {
                hidden.extra_condition = Some(tokens);
                temb_streams.extra_condition = Some(cond_temb.clone());
                rotary.extra_condition = Some(rope);
            }
        }

        for (index, block) in self.transformer_blocks.iter().enumerate() {
            tracing::trace!(index, streams = hidden.count(), "dual-stream block");
            hidden = block.forward(hidden, &temb_streams, Some(&rotary), options, scope)?;
        }

        // Text and image continue as one main stream, text first
        let (mut hidden, rotary) = merge_context(hidden, rotary);
        temb_streams.context = None;

        for (index, block) in self.single_transformer_blocks.iter().enumerate() {
            tracing::trace!(index, streams = hidden.count(), "single-stream block");
            hidden = block.forward(hidden, &temb_streams, Some(&rotary), options, scope)?;
        }

        let [_, seq, _] = hidden.main.dims();
        let main = hidden.main.narrow(1, txt_len, seq - txt_len);
        let main = self.norm_out.forward(main, temb, scope);
        Ok(self.proj_out.forward(main, scope))
    }
}

/// Folds the context stream into the front of the main stream
fn merge_context<B: Backend>(
    mut hidden: Streams<Tensor<B, 3>>,
    mut rotary: Streams<Rotary<B>>,
) -> (Streams<Tensor<B, 3>>, Streams<Rotary<B>>) {
    if let Some(context) = hidden.context.take() {
        hidden.main = Tensor::cat(vec![context, hidden.main], 1);
    }
    if let Some(context) = rotary.context.take() {
        rotary.main = Rotary::cat(vec![context, rotary.main]);
    }
    (hidden, rotary)
}
