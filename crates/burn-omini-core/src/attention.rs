use burn::prelude::*;
use burn::tensor::Bool;

/// Mask applied to attention scores of shape `[seq_q, seq_k]`
#[derive(Debug, Clone)]
pub enum AttentionMask<B: Backend> {
    /// Hard visibility: `true` marks a query/key pair that may not attend
    Blocked(Tensor<B, 2, Bool>),
    /// Soft attenuation added to the scores before softmax
    Bias(Tensor<B, 2>),
}

/// Scaled dot-product attention, non-causal, no dropout
///
/// # Arguments
///
/// * `q`, `k`, `v` - `[batch, heads, seq, head_dim]`
/// * `mask` - Optional mask broadcast over batch and heads
///
/// # Returns
///
/// `[batch, heads, seq_q, head_dim]`
pub fn scaled_dot_product_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    mask: Option<&AttentionMask<B>>,
) -> Tensor<B, 4> {
    let [batch, heads, seq_q, head_dim] = q.dims();
    let [_, _, seq_k, _] = k.dims();
    let scale = (head_dim as f64).sqrt().recip();

    // [batch, heads, seq_q, seq_k]
    let scores = q.matmul(k.swap_dims(2, 3)) * scale;

    let scores = match mask {
        Some(AttentionMask::Blocked(blocked)) => {
            let blocked = blocked
                .clone()
                .unsqueeze::<4>()
                .expand([batch, heads, seq_q, seq_k]);
            scores.mask_fill(blocked, f32::NEG_INFINITY)
        }
        Some(AttentionMask::Bias(bias)) => scores + bias.clone().unsqueeze::<4>(),
        None => scores,
    };

    let weights = burn::tensor::activation::softmax(scores, 3);

    weights.matmul(v)
}
