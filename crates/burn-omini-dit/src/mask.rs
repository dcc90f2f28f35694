//! Attention mask policies over concatenated streams
//!
//! Rows are queries and columns are keys, both in stream concatenation order.
//! Exactly one policy applies per attention call; see [`MaskPolicy::select`].

use std::ops::Range;

use burn::prelude::*;
use burn_omini_core::attention::AttentionMask;

use crate::config::BlockOptions;
use crate::stream::{ConditionSlot, StreamLayout, StreamRole};

/// How condition and non-condition tokens may see each other
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Additive `ln(factor)` on the cross terms of each condition stream
    Bias,
    /// No attention between condition and non-condition tokens
    Isolated,
    /// Condition tokens may not attend outward; the reverse stays visible
    OneWay,
    /// Every token attends to every token
    Full,
}

impl MaskPolicy {
    /// Picks the policy for one attention call, first match wins:
    /// condition factor, then `union_cond_attn == false`, then
    /// `independent_condition`. Without condition tokens it is always `Full`.
    pub fn select(options: &BlockOptions, has_factor: bool, layout: &StreamLayout) -> Self {
        if !layout.has_condition() {
            MaskPolicy::Full
        } else if has_factor {
            MaskPolicy::Bias
        } else if !options.union_cond_attn {
            MaskPolicy::Isolated
        } else if options.independent_condition {
            MaskPolicy::OneWay
        } else {
            MaskPolicy::Full
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MaskPolicy::Bias => "bias",
            MaskPolicy::Isolated => "isolated",
            MaskPolicy::OneWay => "one-way",
            MaskPolicy::Full => "full",
        }
    }

    /// Builds the `[total, total]` mask for `layout`
    ///
    /// # Arguments
    ///
    /// * `layout` - Stream positions in the concatenated sequence
    /// * `factor` - `[f_primary, f_extra]` attenuation, used by [`MaskPolicy::Bias`]
    ///
    /// Returns `None` when nothing needs masking.
    pub fn build<B: Backend>(
        self,
        layout: &StreamLayout,
        factor: Option<&Tensor<B, 1>>,
        device: &B::Device,
    ) -> Option<AttentionMask<B>> {
        let n = layout.total();
        let non_cond = 0..layout.non_condition_len();
        let cond = layout.non_condition_len()..n;

        match self {
            MaskPolicy::Full => None,
            MaskPolicy::Isolated => {
                let blocked = Tensor::<B, 2>::zeros([n, n], device);
                let blocked = fill_block(blocked, cond.clone(), non_cond.clone(), ones(device));
                let blocked = fill_block(blocked, non_cond, cond, ones(device));
                Some(AttentionMask::Blocked(blocked.greater_elem(0.5)))
            }
            MaskPolicy::OneWay => {
                let blocked = Tensor::<B, 2>::zeros([n, n], device);
                let blocked = fill_block(blocked, cond, non_cond, ones(device));
                Some(AttentionMask::Blocked(blocked.greater_elem(0.5)))
            }
            MaskPolicy::Bias => {
                let factor = factor?;
                let mut bias = Tensor::<B, 2>::zeros([n, n], device);

                if let Some(primary) = layout.range(StreamRole::Condition(ConditionSlot::Primary)) {
                    let value = log_factor(factor, 0);
                    bias = fill_block(bias, non_cond.clone(), primary.clone(), value.clone());
                    bias = fill_block(bias, primary, non_cond, value);
                }

                if let Some(extra) = layout.range(StreamRole::Condition(ConditionSlot::Extra)) {
                    // Context, main and the primary condition all precede the extra stream
                    let before = 0..extra.start;
                    let value = log_factor(factor, 1);
                    bias = fill_block(bias, before.clone(), extra.clone(), value.clone());
                    bias = fill_block(bias, extra, before, value);
                }

                Some(AttentionMask::Bias(bias))
            }
        }
    }
}

fn ones<B: Backend>(device: &B::Device) -> Tensor<B, 2> {
    Tensor::ones([1, 1], device)
}

/// `ln(factor[index])` as a `[1, 1]` tensor
fn log_factor<B: Backend>(factor: &Tensor<B, 1>, index: usize) -> Tensor<B, 2> {
    factor.clone().narrow(0, index, 1).log().reshape([1, 1])
}

/// Writes the `[1, 1]` `value` over the `rows x cols` block of `x`
fn fill_block<B: Backend>(
    x: Tensor<B, 2>,
    rows: Range<usize>,
    cols: Range<usize>,
    value: Tensor<B, 2>,
) -> Tensor<B, 2> {
    if rows.is_empty() || cols.is_empty() {
        return x;
    }
    let block = Tensor::ones([rows.len(), cols.len()], &x.device()) * value;
    x.slice_assign([rows, cols], block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Streams;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn mask_values(mask: AttentionMask<TestBackend>) -> Vec<f32> {
        match mask {
            AttentionMask::Blocked(blocked) => blocked.float().into_data().to_vec().unwrap(),
            AttentionMask::Bias(bias) => bias.into_data().to_vec().unwrap(),
        }
    }

    #[test]
    fn test_policy_priority() {
        let layout = StreamLayout::new(&Streams::new(2).with_condition(2));
        let all_set = BlockOptions {
            union_cond_attn: false,
            independent_condition: true,
            ..Default::default()
        };

        assert_eq!(MaskPolicy::select(&all_set, true, &layout), MaskPolicy::Bias);
        assert_eq!(MaskPolicy::select(&all_set, false, &layout), MaskPolicy::Isolated);

        let one_way = BlockOptions {
            independent_condition: true,
            ..Default::default()
        };
        assert_eq!(MaskPolicy::select(&one_way, false, &layout), MaskPolicy::OneWay);
        assert_eq!(MaskPolicy::select(&BlockOptions::default(), false, &layout), MaskPolicy::Full);
    }

    #[test]
    fn test_no_condition_is_always_full() {
        let layout = StreamLayout::new(&Streams::new(4).with_context(2));
        let isolated = BlockOptions {
            union_cond_attn: false,
            ..Default::default()
        };
        assert_eq!(MaskPolicy::select(&isolated, true, &layout), MaskPolicy::Full);
    }

    #[test]
    fn test_one_way_blocks_condition_rows_only() {
        let device = Default::default();
        // context 1, main 1, condition 1
        let layout = StreamLayout::new(&Streams::new(1).with_context(1).with_condition(1));
        let mask = MaskPolicy::OneWay
            .build::<TestBackend>(&layout, None, &device)
            .unwrap();

        #[rustfmt::skip]
        assert_eq!(mask_values(mask), vec![
            0.0, 0.0, 0.0,
            0.0, 0.0, 0.0,
            1.0, 1.0, 0.0,
        ]);
    }

    #[test]
    fn test_bias_with_both_conditions() {
        let device = Default::default();
        let layout = StreamLayout::new(
            &Streams::new(1).with_condition(1).with_extra_condition(1),
        );
        let factor = Tensor::<TestBackend, 1>::from_floats([2.0, 0.5], &device);
        let mask = MaskPolicy::Bias.build(&layout, Some(&factor), &device).unwrap();

        let p = 2.0f32.ln();
        let e = 0.5f32.ln();
        #[rustfmt::skip]
        let expected = vec![
            0.0, p,   e,
            p,   0.0, e,
            e,   e,   0.0,
        ];
        for (got, want) in mask_values(mask).iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "{} != {}", got, want);
        }
    }

    #[test]
    fn test_bias_with_extra_condition_only() {
        let device = Default::default();
        // context 1, main 2, extra condition 1
        let layout = StreamLayout::new(
            &Streams::new(2).with_context(1).with_extra_condition(1),
        );
        let factor = Tensor::<TestBackend, 1>::from_floats([2.0, 0.5], &device);
        let mask = MaskPolicy::Bias.build(&layout, Some(&factor), &device).unwrap();

        let e = 0.5f32.ln();
        #[rustfmt::skip]
        let expected = vec![
            0.0, 0.0, 0.0, e,
            0.0, 0.0, 0.0, e,
            0.0, 0.0, 0.0, e,
            e,   e,   e,   0.0,
        ];
        for (got, want) in mask_values(mask).iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "{} != {}", got, want);
        }
    }

    #[test]
    fn test_bias_requires_factor() {
        let device = Default::default();
        let layout = StreamLayout::new(&Streams::new(1).with_condition(1));
        assert!(MaskPolicy::Bias.build::<TestBackend>(&layout, None, &device).is_none());
    }
}
