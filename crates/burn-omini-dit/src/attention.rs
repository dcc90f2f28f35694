//! Joint attention over concatenated token streams
//!
//! Every present stream is projected to query/key/value with the weights its
//! role calls for, rotated by its own rotary table, then all streams attend
//! jointly over their concatenation. The output is split back per stream.
//!
//! ```text
//! context ─ add_{q,k,v}_proj ─┐                                ┌─ to_add_out ─ context
//! main ──── to_{q,k,v} ───────┤ cat ─ mask ─ attention ─ split ┼─ to_out ───── main
//! conditions ─ to_{q,k,v} ────┘                                └─ to_out ───── conditions
//! ```

use burn::prelude::*;
use burn_omini_core::attention::scaled_dot_product_attention;
use burn_omini_core::lora::{AdapterScope, LoraLinear};
use burn_omini_core::rmsnorm::RmsNorm;
use burn_omini_core::rope::Rotary;

use crate::config::BlockOptions;
use crate::error::BlockError;
use crate::mask::MaskPolicy;
use crate::stream::{StreamLayout, StreamRole, Streams};

/// Text-stream projections of a dual-stream attention
#[derive(Module, Debug)]
pub struct ContextProjections<B: Backend> {
    pub add_q_proj: LoraLinear<B>,
    pub add_k_proj: LoraLinear<B>,
    pub add_v_proj: LoraLinear<B>,
    pub norm_added_q: RmsNorm<B>,
    pub norm_added_k: RmsNorm<B>,
    pub to_add_out: LoraLinear<B>,
}

/// Multi-stream joint attention
///
/// Main and condition streams share `to_q/to_k/to_v/to_out`; the context
/// stream uses [`ContextProjections`]. Attention built with
/// [`JointAttention::pre_only`] (single-stream blocks) has neither and
/// returns the raw attention output.
#[derive(Module, Debug)]
pub struct JointAttention<B: Backend> {
    pub to_q: LoraLinear<B>,
    pub to_k: LoraLinear<B>,
    pub to_v: LoraLinear<B>,
    pub norm_q: Option<RmsNorm<B>>,
    pub norm_k: Option<RmsNorm<B>>,
    pub context: Option<ContextProjections<B>>,
    pub to_out: Option<LoraLinear<B>>,
    /// `[f_primary, f_extra]`; when set, condition streams attend through
    /// an additive `ln(f)` bias instead of a hard mask
    pub condition_factor: Option<Tensor<B, 1>>,
    #[module(skip)]
    pub num_heads: usize,
    #[module(skip)]
    pub head_dim: usize,
}

impl<B: Backend> JointAttention<B> {
    /// Attention of a dual-stream block, with context projections and output projections
    pub fn joint(dim: usize, num_heads: usize, path: &str, device: &B::Device) -> Self {
        let head_dim = dim / num_heads;
        let mut attn = Self::pre_only(dim, num_heads, path, device);

        attn.context = Some(ContextProjections {
            add_q_proj: LoraLinear::init(dim, dim, format!("{path}.add_q_proj"), device),
            add_k_proj: LoraLinear::init(dim, dim, format!("{path}.add_k_proj"), device),
            add_v_proj: LoraLinear::init(dim, dim, format!("{path}.add_v_proj"), device),
            norm_added_q: RmsNorm::new(head_dim, device),
            norm_added_k: RmsNorm::new(head_dim, device),
            to_add_out: LoraLinear::init(dim, dim, format!("{path}.to_add_out"), device),
        });
        attn.to_out = Some(LoraLinear::init(dim, dim, format!("{path}.to_out.0"), device));
        attn
    }

    /// Attention of a single-stream block: no context stream, no output projection
    pub fn pre_only(dim: usize, num_heads: usize, path: &str, device: &B::Device) -> Self {
        let head_dim = dim / num_heads;
        Self {
            to_q: LoraLinear::init(dim, dim, format!("{path}.to_q"), device),
            to_k: LoraLinear::init(dim, dim, format!("{path}.to_k"), device),
            to_v: LoraLinear::init(dim, dim, format!("{path}.to_v"), device),
            norm_q: Some(RmsNorm::new(head_dim, device)),
            norm_k: Some(RmsNorm::new(head_dim, device)),
            context: None,
            to_out: None,
            condition_factor: None,
            num_heads,
            head_dim,
        }
    }

    /// Sets or clears the `[f_primary, f_extra]` condition factor
    pub fn set_condition_factor(&mut self, factor: Option<[f32; 2]>, device: &B::Device) {
        self.condition_factor = factor.map(|f| Tensor::from_floats(f, device));
    }

    /// Width of every stream this attention accepts
    pub fn inner_dim(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Projection layers adapters can attach to
    pub fn lora_layers_mut(&mut self) -> Vec<&mut LoraLinear<B>> {
        let mut layers = vec![&mut self.to_q, &mut self.to_k, &mut self.to_v];
        if let Some(to_out) = self.to_out.as_mut() {
            layers.push(to_out);
        }
        if let Some(context) = self.context.as_mut() {
            layers.extend([
                &mut context.add_q_proj,
                &mut context.add_k_proj,
                &mut context.add_v_proj,
                &mut context.to_add_out,
            ]);
        }
        layers
    }

    /// Joint attention over every present stream
    ///
    /// # Arguments
    ///
    /// * `streams` - Normalised hidden states `[batch, seq, dim]` per stream
    /// * `rotary` - Rotary tables per stream; a stream without one is not rotated
    /// * `options` - Mask policy flags and `latent_lora`
    /// * `scope` - Adapter state the projections run under
    ///
    /// # Returns
    ///
    /// Attention output for exactly the streams supplied, each with the
    /// shape of its input.
    pub fn forward(
        &self,
        streams: Streams<Tensor<B, 3>>,
        rotary: Option<&Streams<Rotary<B>>>,
        options: &BlockOptions,
        scope: &AdapterScope,
    ) -> Result<Streams<Tensor<B, 3>>, BlockError> {
        self.validate(&streams, rotary)?;

        let device = streams.main.device();
        let [batch, _, _] = streams.main.dims();
        let layout = StreamLayout::of(&streams);

        let qkv = streams.map(|role, x| {
            let (q, k, v) = self.project(role, x, options, scope);
            match rotary.and_then(|r| r.get(role)) {
                Some(rope) => (rope.apply(q), rope.apply(k), v),
                None => (q, k, v),
            }
        });

        let mut qs = Vec::new();
        let mut ks = Vec::new();
        let mut vs = Vec::new();
        for (_, (q, k, v)) in qkv.into_ordered() {
            qs.push(q);
            ks.push(k);
            vs.push(v);
        }
        let q = Tensor::cat(qs, 2);
        let k = Tensor::cat(ks, 2);
        let v = Tensor::cat(vs, 2);

        let policy = MaskPolicy::select(options, self.condition_factor.is_some(), &layout);
        let mask = policy.build(&layout, self.condition_factor.as_ref(), &device);
        tracing::debug!(
            tokens = layout.total(),
            lengths = ?layout.lengths(),
            policy = policy.name(),
            "joint attention"
        );

        let out = scaled_dot_product_attention(q, k, v, mask.as_ref());
        let out = out
            .swap_dims(1, 2)
            .reshape([batch, layout.total(), self.inner_dim()]);

        Ok(layout
            .split(out)
            .map(|role, x| self.project_out(role, x, options, scope)))
    }

    fn validate(
        &self,
        streams: &Streams<Tensor<B, 3>>,
        rotary: Option<&Streams<Rotary<B>>>,
    ) -> Result<(), BlockError> {
        let [batch, _, _] = streams.main.dims();

        for (role, x) in streams.iter() {
            let [b, tokens, channels] = x.dims();
            if b != batch {
                return Err(BlockError::BatchMismatch {
                    role,
                    expected: batch,
                    found: b,
                });
            }
            if channels != self.inner_dim() || self.to_q.d_output() != self.inner_dim() {
                return Err(BlockError::HeadMismatch {
                    role,
                    channels,
                    heads: self.num_heads,
                    head_dim: self.head_dim,
                });
            }
            if role == StreamRole::Context && self.context.is_none() {
                return Err(BlockError::UnsupportedStream(role));
            }
            if let Some(rope) = rotary.and_then(|r| r.get(role)) {
                if rope.seq_len() != tokens {
                    return Err(BlockError::RotaryMismatch {
                        role,
                        rotary: rope.seq_len(),
                        tokens,
                    });
                }
                if rope.head_dim() != self.head_dim {
                    return Err(BlockError::RotaryWidth {
                        role,
                        rotary: rope.head_dim(),
                        head_dim: self.head_dim,
                    });
                }
            }
        }
        Ok(())
    }

    /// `[batch, seq, dim]` -> `[batch, heads, seq, head_dim]`
    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, seq_len, _] = x.dims();
        x.reshape([batch, seq_len, self.num_heads, self.head_dim])
            .swap_dims(1, 2)
    }

    fn project(
        &self,
        role: StreamRole,
        x: Tensor<B, 3>,
        options: &BlockOptions,
        scope: &AdapterScope,
    ) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        if let (StreamRole::Context, Some(ctx)) = (role, &self.context) {
            let q = self.split_heads(ctx.add_q_proj.forward(x.clone(), scope));
            let k = self.split_heads(ctx.add_k_proj.forward(x.clone(), scope));
            let v = self.split_heads(ctx.add_v_proj.forward(x, scope));
            return (ctx.norm_added_q.forward(q), ctx.norm_added_k.forward(k), v);
        }

        let _latent = scope.enable(
            &[&self.to_q, &self.to_k, &self.to_v],
            options.adapters_enabled(role),
        );
        let q = self.split_heads(self.to_q.forward(x.clone(), scope));
        let k = self.split_heads(self.to_k.forward(x.clone(), scope));
        let v = self.split_heads(self.to_v.forward(x, scope));

        let q = match &self.norm_q {
            Some(norm) => norm.forward(q),
            None => q,
        };
        let k = match &self.norm_k {
            Some(norm) => norm.forward(k),
            None => k,
        };
        (q, k, v)
    }

    fn project_out(
        &self,
        role: StreamRole,
        x: Tensor<B, 3>,
        options: &BlockOptions,
        scope: &AdapterScope,
    ) -> Tensor<B, 3> {
        match (role, &self.context, &self.to_out) {
            (StreamRole::Context, Some(ctx), _) => ctx.to_add_out.forward(x, scope),
            (_, _, Some(to_out)) => {
                let _latent = scope.enable(&[to_out], options.adapters_enabled(role));
                to_out.forward(x, scope)
            }
            _ => x,
        }
    }
}
