//! Condition images and their encoding into token streams
//!
//! A condition image is VAE-encoded, packed into 2x2 latent patches and
//! given position ids on the packed grid. The ids can be shifted by a
//! position delta so the condition sits next to, rather than on top of, the
//! image being generated.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;

use crate::error::ConditionError;

/// Kind of condition, selecting the type id attached to its tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    /// Reference subject image
    Subject,
    /// Low-resolution image to upscale
    SuperResolution,
    /// Chain-of-thought style reference
    Cot,
}

impl ConditionKind {
    pub fn type_id(self) -> u32 {
        match self {
            ConditionKind::Subject => 4,
            ConditionKind::SuperResolution => 10,
            ConditionKind::Cot => 12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConditionKind::Subject => "subject",
            ConditionKind::SuperResolution => "sr",
            ConditionKind::Cot => "cot",
        }
    }
}

impl FromStr for ConditionKind {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subject" => Ok(ConditionKind::Subject),
            "sr" => Ok(ConditionKind::SuperResolution),
            "cot" => Ok(ConditionKind::Cot),
            other => Err(ConditionError::NotImplemented(other.to_string())),
        }
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// VAE encoder producing latents for condition images
///
/// Implementations take an RGB image `[1, 3, H, W]` with values in `[0, 1]`
/// and return scaled latents `[1, C, H / 8, W / 8]`, applying whatever
/// normalisation and shift/scaling factors their VAE needs.
pub trait ImageEncoder<B: Backend> {
    fn encode(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Token stream produced from a condition
#[derive(Debug, Clone)]
pub struct EncodedCondition<B: Backend> {
    /// Packed latent tokens `[1, seq, 4 * C]`
    pub tokens: Tensor<B, 3>,
    /// Position ids `[seq, 3]` laid out `(0, row, col)`, delta applied
    pub position_ids: Tensor<B, 2>,
    /// Type id per token `[seq, 1]`
    pub type_id: Tensor<B, 2>,
}

/// A condition image with its kind and optional position delta
#[derive(Debug, Clone)]
pub struct Condition<B: Backend> {
    pub kind: ConditionKind,
    /// RGB image `[1, 3, H, W]` in `[0, 1]`
    pub image: Tensor<B, 4>,
    /// `(dy, dx)` added to the row and column ids
    pub position_delta: Option<(i64, i64)>,
}

impl<B: Backend> Condition<B> {
    pub fn new(kind: ConditionKind, image: Tensor<B, 4>) -> Result<Self, ConditionError> {
        let dims = image.dims();
        if dims[0] != 1 || dims[1] != 3 {
            return Err(ConditionError::InvalidImage(dims));
        }
        Ok(Self {
            kind,
            image,
            position_delta: None,
        })
    }

    /// Parses the kind by name; unknown names are not implemented
    pub fn parse(kind: &str, image: Tensor<B, 4>) -> Result<Self, ConditionError> {
        Self::new(kind.parse()?, image)
    }

    pub fn with_position_delta(mut self, dy: i64, dx: i64) -> Self {
        self.position_delta = Some((dy, dx));
        self
    }

    pub fn type_id(&self) -> u32 {
        self.kind.type_id()
    }

    /// `(height, width)` of the image
    pub fn size(&self) -> (usize, usize) {
        let [_, _, height, width] = self.image.dims();
        (height, width)
    }

    /// Delta applied when encoding
    ///
    /// A subject without an explicit delta is placed one image width to the
    /// left: `(0, -W / 16)` in packed-token units.
    pub fn effective_delta(&self) -> Option<(i64, i64)> {
        match (self.position_delta, self.kind) {
            (Some(delta), _) => Some(delta),
            (None, ConditionKind::Subject) => {
                let (_, width) = self.size();
                Some((0, (-(width as i64)).div_euclid(16)))
            }
            (None, _) => None,
        }
    }

    /// Encodes the condition into tokens, position ids and type ids
    ///
    /// With `unconditional` set, an all-black image of the same size is
    /// encoded instead, so the result has the same shapes and ids as the
    /// conditioned case.
    pub fn encode<E: ImageEncoder<B>>(
        &self,
        encoder: &E,
        unconditional: bool,
    ) -> Result<EncodedCondition<B>, ConditionError> {
        let image = if unconditional {
            Tensor::zeros_like(&self.image)
        } else {
            self.image.clone()
        };

        let latents = encoder.encode(image);
        let device = latents.device();
        let [_, _, height, width] = latents.dims();

        let tokens = pack_latents(latents)?;
        let mut position_ids = latent_image_ids::<B>(height / 2, width / 2, &device);
        if let Some((dy, dx)) = self.effective_delta() {
            let delta = Tensor::<B, 1>::from_floats([0.0, dy as f32, dx as f32], &device);
            position_ids = position_ids + delta.unsqueeze();
        }

        let [seq, _] = position_ids.dims();
        let type_id = Tensor::ones([seq, 1], &device) * self.type_id() as f32;

        tracing::debug!(
            kind = self.kind.name(),
            tokens = seq,
            delta = ?self.effective_delta(),
            unconditional,
            "encoded condition"
        );

        Ok(EncodedCondition {
            tokens,
            position_ids,
            type_id,
        })
    }
}

/// Packs latents `[b, c, h, w]` into 2x2 patch tokens `[b, (h/2)(w/2), 4c]`
pub fn pack_latents<B: Backend>(latents: Tensor<B, 4>) -> Result<Tensor<B, 3>, ConditionError> {
    let [batch, channels, height, width] = latents.dims();
    if height % 2 != 0 || width % 2 != 0 {
        return Err(ConditionError::OddLatentSize { height, width });
    }
    let (h, w) = (height / 2, width / 2);

    Ok(latents
        .reshape([batch, channels, h, 2, w, 2])
        .permute([0, 2, 4, 1, 3, 5])
        .reshape([batch, h * w, channels * 4]))
}

/// Position ids `(0, row, col)` of an `h x w` packed grid, row-major, `[h * w, 3]`
pub fn latent_image_ids<B: Backend>(h: usize, w: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut ids = Vec::with_capacity(h * w * 3);
    for row in 0..h {
        for col in 0..w {
            ids.extend([0.0, row as f32, col as f32]);
        }
    }
    Tensor::<B, 1>::from_floats(ids.as_slice(), device).reshape([h * w, 3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// Averages 8x8 pixel blocks, a stand-in for a VAE
    struct PoolEncoder;

    impl<B: Backend> ImageEncoder<B> for PoolEncoder {
        fn encode(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
            let [b, c, h, w] = image.dims();
            image
                .reshape([b, c, h / 8, 8, w / 8, 8])
                .mean_dim(5)
                .mean_dim(3)
                .reshape([b, c, h / 8, w / 8])
        }
    }

    fn image(height: usize, width: usize) -> Tensor<TestBackend, 4> {
        Tensor::random([1, 3, height, width], Distribution::Uniform(0.0, 1.0), &Default::default())
    }

    fn to_vec<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("subject".parse::<ConditionKind>().unwrap().type_id(), 4);
        assert_eq!("sr".parse::<ConditionKind>().unwrap().type_id(), 10);
        assert_eq!("cot".parse::<ConditionKind>().unwrap().type_id(), 12);
        assert_eq!(
            "canny".parse::<ConditionKind>(),
            Err(ConditionError::NotImplemented("canny".to_string()))
        );
    }

    #[test]
    fn test_rejects_non_rgb_image() {
        let gray = Tensor::<TestBackend, 4>::zeros([1, 1, 16, 16], &Default::default());
        assert!(matches!(
            Condition::new(ConditionKind::Cot, gray),
            Err(ConditionError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_encode_shapes() {
        let condition = Condition::new(ConditionKind::SuperResolution, image(64, 32)).unwrap();
        let encoded = condition.encode(&PoolEncoder, false).unwrap();

        // latents 8x4 -> packed grid 4x2
        assert_eq!(encoded.tokens.dims(), [1, 8, 12]);
        assert_eq!(encoded.position_ids.dims(), [8, 3]);
        assert!(to_vec(encoded.type_id).iter().all(|&t| t == 10.0));
    }

    #[test]
    fn test_subject_default_delta() {
        let condition = Condition::new(ConditionKind::Subject, image(32, 64)).unwrap();
        assert_eq!(condition.effective_delta(), Some((0, -4)));

        let ids = to_vec(condition.encode(&PoolEncoder, false).unwrap().position_ids);
        // First token (0, 0, 0) shifted by (0, -4)
        assert_eq!(ids[..3], [0.0, 0.0, -4.0]);
        // Second token is one column to the right
        assert_eq!(ids[3..6], [0.0, 0.0, -3.0]);
    }

    #[test]
    fn test_explicit_delta_wins() {
        let condition = Condition::new(ConditionKind::Subject, image(16, 16))
            .unwrap()
            .with_position_delta(0, 64);
        let ids = to_vec(condition.encode(&PoolEncoder, false).unwrap().position_ids);
        assert_eq!(ids[..3], [0.0, 0.0, 64.0]);

        let plain = Condition::new(ConditionKind::Cot, image(16, 16)).unwrap();
        assert_eq!(plain.effective_delta(), None);
    }

    #[test]
    fn test_unconditional_encoding_ignores_content() {
        let a = Condition::new(ConditionKind::Subject, image(32, 32)).unwrap();
        let b = Condition::new(ConditionKind::Subject, image(32, 32) * 0.5).unwrap();

        let ea = a.encode(&PoolEncoder, true).unwrap();
        let eb = b.encode(&PoolEncoder, true).unwrap();
        let again = a.encode(&PoolEncoder, true).unwrap();

        assert_eq!(ea.tokens.dims(), eb.tokens.dims());
        assert_eq!(to_vec(ea.tokens.clone()), to_vec(eb.tokens));
        assert_eq!(to_vec(ea.position_ids.clone()), to_vec(eb.position_ids));
        assert_eq!(to_vec(ea.position_ids), to_vec(again.position_ids));

        let conditioned = a.encode(&PoolEncoder, false).unwrap();
        assert_eq!(conditioned.tokens.dims(), again.tokens.dims());
    }

    #[test]
    fn test_pack_groups_2x2_patches() {
        let device = Default::default();
        // One channel, rows [0, 1, 2, 3] and [4, 5, 6, 7]
        let latents = Tensor::<TestBackend, 1>::from_floats(
            [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            &device,
        )
        .reshape([1, 1, 2, 4]);
        let packed = pack_latents(latents).unwrap();

        assert_eq!(packed.dims(), [1, 2, 4]);
        assert_eq!(to_vec(packed), vec![0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]);

        let wide = Tensor::<TestBackend, 4>::zeros([1, 4, 6, 4], &device);
        assert_eq!(pack_latents(wide).unwrap().dims(), [1, 6, 16]);
    }

    #[test]
    fn test_odd_latents_rejected() {
        let latents = Tensor::<TestBackend, 4>::zeros([1, 4, 3, 4], &Default::default());
        assert_eq!(
            pack_latents(latents).unwrap_err(),
            ConditionError::OddLatentSize { height: 3, width: 4 }
        );
    }
}
