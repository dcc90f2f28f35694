//! Stream-level properties of the condition blocks
//!
//! Run with: `cargo test -p burn-omini-dit --test block_properties`
//!
//! The full-resolution scenario is ignored by default (it builds an
//! 8320 x 8320 attention matrix); run it with `--ignored`.

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_ndarray::NdArray;
use burn_omini_core::attention::AttentionMask;
use burn_omini_core::lora::{AdapterScope, AdapterSet};
use burn_omini_core::rope::{FluxPosEmbed, Rotary};
use burn_omini_dit::condition::latent_image_ids;
use burn_omini_dit::{
    BlockError, BlockOptions, Condition, ConditionKind, ConditionSlot, DoubleStreamBlock, ImageEncoder,
    JointAttention, MaskPolicy, StreamLayout, StreamRole, Streams,
};

type TestBackend = NdArray<f32>;

const DIM: usize = 32;
const HEADS: usize = 2;

fn random<const D: usize>(shape: [usize; D]) -> Tensor<TestBackend, D> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
}

fn to_vec<const D: usize>(x: Tensor<TestBackend, D>) -> Vec<f32> {
    x.into_data().to_vec().unwrap()
}

fn mask_values(mask: AttentionMask<TestBackend>) -> Vec<f32> {
    match mask {
        AttentionMask::Blocked(blocked) => to_vec(blocked.float()),
        AttentionMask::Bias(bias) => to_vec(bias),
    }
}

fn assert_close(a: Tensor<TestBackend, 3>, b: Tensor<TestBackend, 3>) {
    let (a, b) = (to_vec(a), to_vec(b));
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-5, "{} != {}", x, y);
    }
}

/// Head dim 16 split over three position axes
fn pos_embed() -> FluxPosEmbed {
    FluxPosEmbed::new(10000.0, vec![4, 6, 6])
}

fn grid_rotary(side: usize, dx: f32) -> Rotary<TestBackend> {
    let device = Default::default();
    let ids = latent_image_ids::<TestBackend>(side, side, &device)
        + Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, dx], &device).unsqueeze();
    pos_embed().forward(ids)
}

fn text_rotary(len: usize) -> Rotary<TestBackend> {
    pos_embed().forward(Tensor::<TestBackend, 2>::zeros([len, 3], &Default::default()))
}

#[test]
fn test_attention_output_matches_input_layout() {
    let device = Default::default();
    let attn = JointAttention::<TestBackend>::joint(DIM, HEADS, "blocks.0.attn", &device);
    let scope = AdapterScope::new();

    let configurations = [
        Streams::new(6),
        Streams::new(6).with_context(3),
        Streams::new(6).with_condition(4),
        Streams::new(6).with_context(3).with_condition(4),
        Streams::new(6).with_context(3).with_condition(4).with_extra_condition(5),
    ];

    for lengths in configurations {
        let streams = lengths.clone().map(|_, len| random([1, len, DIM]));
        let out = attn
            .forward(streams, None, &BlockOptions::default(), &scope)
            .unwrap();

        assert_eq!(out.roles(), lengths.roles());
        let layout = StreamLayout::of(&out);
        assert_eq!(layout.lengths(), lengths);

        let joined = Tensor::cat(out.into_ordered().into_iter().map(|(_, x)| x).collect(), 1);
        assert_eq!(layout.split(joined).as_ref().map(|_, x| x.dims()[1]), lengths);
    }
}

#[test]
fn test_isolated_and_one_way_mask_blocks() {
    let device = Default::default();
    // context 2, main 3, condition 2
    let layout = StreamLayout::new(&Streams::new(3).with_context(2).with_condition(2));
    let n = layout.total();
    let split = layout.non_condition_len();

    let isolated = mask_values(
        MaskPolicy::Isolated
            .build::<TestBackend>(&layout, None, &device)
            .unwrap(),
    );
    let one_way = mask_values(
        MaskPolicy::OneWay
            .build::<TestBackend>(&layout, None, &device)
            .unwrap(),
    );

    for row in 0..n {
        for col in 0..n {
            let row_cond = row >= split;
            let col_cond = col >= split;
            let value = |mask: &[f32]| mask[row * n + col];

            assert_eq!(value(&isolated), if row_cond != col_cond { 1.0 } else { 0.0 });
            assert_eq!(value(&one_way), if row_cond && !col_cond { 1.0 } else { 0.0 });
        }
    }
}

#[test]
fn test_bias_is_log_factor_on_cross_terms_only() {
    let device = Default::default();
    let layout = StreamLayout::new(
        &Streams::new(3)
            .with_context(2)
            .with_condition(2)
            .with_extra_condition(1),
    );
    let factor = Tensor::<TestBackend, 1>::from_floats([0.5, 0.25], &device);
    let bias = mask_values(
        MaskPolicy::Bias
            .build(&layout, Some(&factor), &device)
            .unwrap(),
    );

    let n = layout.total();
    let primary = 5..7;
    let extra = 7..8;
    for row in 0..n {
        for col in 0..n {
            let expected = if extra.contains(&row) != extra.contains(&col) {
                0.25f32.ln()
            } else if (row < 5 && primary.contains(&col)) || (primary.contains(&row) && col < 5) {
                0.5f32.ln()
            } else {
                0.0
            };
            let got = bias[row * n + col];
            assert!((got - expected).abs() < 1e-6, "[{row}, {col}] {got} != {expected}");
        }
    }
}

/// 8x8 mean pooling into 4 channels: a deterministic stand-in for a VAE
struct PoolEncoder;

impl<B: Backend> ImageEncoder<B> for PoolEncoder {
    fn encode(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = image.dims();
        let pooled = image
            .reshape([b, c, h / 8, 8, w / 8, 8])
            .mean_dim(5)
            .mean_dim(3)
            .reshape([b, c, h / 8, w / 8]);
        Tensor::cat(vec![pooled.clone(), pooled.narrow(1, 0, 1)], 1)
    }
}

#[test]
fn test_unconditional_encoding_ignores_image_content() {
    let device = Default::default();
    let noisy = Condition::new(ConditionKind::Subject, random([1, 3, 32, 48])).unwrap();
    let flat = Condition::new(
        ConditionKind::Subject,
        Tensor::<TestBackend, 4>::ones([1, 3, 32, 48], &device),
    )
    .unwrap();

    let a = noisy.encode(&PoolEncoder, true).unwrap();
    let b = flat.encode(&PoolEncoder, true).unwrap();

    assert_eq!(a.tokens.dims(), b.tokens.dims());
    assert_eq!(to_vec(a.tokens), to_vec(b.tokens));
    assert_eq!(to_vec(a.position_ids), to_vec(b.position_ids));
    assert_eq!(to_vec(a.type_id), to_vec(b.type_id));
}

fn subject_adapter(device: &<TestBackend as Backend>::Device) -> AdapterSet<TestBackend> {
    let mut set = AdapterSet::new("subject");
    set.insert(
        "blocks.0.attn.to_q",
        Tensor::random([4, DIM], Distribution::Normal(0.0, 1.0), device),
        Tensor::random([DIM, 4], Distribution::Normal(0.0, 1.0), device),
        4.0,
    );
    set
}

#[test]
fn test_main_stream_skips_adapters_unless_latent_lora() {
    let device = Default::default();
    let base = DoubleStreamBlock::<TestBackend>::new(DIM, HEADS, 4 * DIM, "blocks.0", &device);
    let mut adapted = base.clone();
    subject_adapter(&device)
        .attach_to(adapted.lora_layers_mut())
        .unwrap();
    let scope = AdapterScope::new();

    let hidden = Streams::new(random([1, 6, DIM])).with_context(random([1, 3, DIM]));
    let t = random([1, DIM]);
    let temb = Streams::new(t.clone()).with_context(t);

    let options = BlockOptions::default();
    let reference = base
        .forward(hidden.clone(), &temb, None, &options, &scope)
        .unwrap();
    let out = adapted
        .forward(hidden.clone(), &temb, None, &options, &scope)
        .unwrap();
    assert_close(reference.main.clone(), out.main);

    let latent = BlockOptions {
        latent_lora: true,
        ..options
    };
    let out = adapted
        .forward(hidden, &temb, None, &latent, &scope)
        .unwrap();
    let diff: f32 = (reference.main - out.main).abs().sum().into_scalar();
    assert!(diff > 1e-3);
}

#[test]
fn test_adapter_state_restored_after_failed_block_call() {
    let device = Default::default();
    let mut block = DoubleStreamBlock::<TestBackend>::new(DIM, HEADS, 4 * DIM, "blocks.0", &device);
    subject_adapter(&device)
        .attach_to(block.lora_layers_mut())
        .unwrap();
    let scope = AdapterScope::new();

    let hidden = Streams::new(random([1, 4, DIM]))
        .with_context(random([1, 2, DIM]))
        .with_condition(random([1, 4, DIM]));
    // No embedding for the condition stream
    let t = random([1, DIM]);
    let temb = Streams::new(t.clone()).with_context(t);

    {
        let _scale = scope.set_scale(&["subject"], 2.5);
        let err = block
            .forward(hidden, &temb, None, &BlockOptions::default(), &scope)
            .unwrap_err();
        assert!(matches!(err, BlockError::MissingEmbedding(role) if role.is_condition()));
        assert_eq!(scope.scale("subject"), 2.5);
    }

    assert_eq!(scope.scale("subject"), 1.0);
    assert!(scope.is_enabled("blocks.0.attn.to_q"));
    assert!(scope.is_enabled("blocks.0.norm1.linear"));
    assert!(scope.is_enabled("blocks.0.ff.net.2"));
}

fn run_scenario(side: usize, context_len: usize, offset: f32) {
    let device = Default::default();
    let block = DoubleStreamBlock::<TestBackend>::new(DIM, HEADS, 4 * DIM, "blocks.0", &device);
    let scope = AdapterScope::new();
    let tokens = side * side;

    let hidden = Streams::new(random([1, tokens, DIM]))
        .with_context(random([1, context_len, DIM]))
        .with_condition(random([1, tokens, DIM]));
    let t = random([1, DIM]);
    let temb = Streams::new(t.clone())
        .with_context(t.clone())
        .with_condition(Tensor::zeros([1, DIM], &device));
    let rotary = Streams::new(grid_rotary(side, 0.0))
        .with_context(text_rotary(context_len))
        .with_condition(grid_rotary(side, offset));

    let out = block
        .forward(hidden, &temb, Some(&rotary), &BlockOptions::default(), &scope)
        .unwrap();
    assert_eq!(
        out.roles(),
        vec![
            StreamRole::Context,
            StreamRole::Main,
            StreamRole::Condition(ConditionSlot::Primary)
        ]
    );

    assert_eq!(out.main.dims(), [1, tokens, DIM]);
    assert_eq!(out.context.map(|x| x.dims()), Some([1, context_len, DIM]));
    assert_eq!(out.condition.map(|x| x.dims()), Some([1, tokens, DIM]));
    assert!(out.extra_condition.is_none());
}

#[test]
fn test_scenario_shifted_subject_condition() {
    run_scenario(16, 8, 16.0);
}

#[test]
#[ignore = "builds an 8320 x 8320 attention matrix"]
fn test_scenario_full_resolution() {
    run_scenario(64, 128, 64.0);
}
