//! Half-precision overflow guard
//!
//! In Burn the float element type is fixed by the backend, e.g.
//! `NdArray<f32>` or `Wgpu<half::f16>`. Residual streams that run in f16 can
//! overflow after many blocks of accumulation, so block outputs are clamped
//! to the largest finite f16 value instead of being allowed to become `inf`.

use burn::prelude::*;
use burn::tensor::DType;

/// Largest finite value representable in IEEE half precision
pub const F16_MAX: f32 = 65504.0;

/// Precision mode for inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrecisionMode {
    /// Full 32-bit precision (default)
    #[default]
    Fp32,
    /// 16-bit half precision
    Fp16,
    /// 16-bit brain floating point
    Bf16,
}

impl PrecisionMode {
    /// Get a human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            PrecisionMode::Fp32 => "fp32",
            PrecisionMode::Fp16 => "fp16",
            PrecisionMode::Bf16 => "bf16",
        }
    }

    /// Precision mode of a float element type
    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(PrecisionMode::Fp32),
            DType::F16 => Some(PrecisionMode::Fp16),
            DType::BF16 => Some(PrecisionMode::Bf16),
            _ => None,
        }
    }

    /// Precision mode of a tensor's element type, if it is a float type
    pub fn of<B: Backend, const D: usize>(x: &Tensor<B, D>) -> Option<Self> {
        Self::from_dtype(x.dtype())
    }
}

/// Clamps `x` to the finite f16 range when its element type is f16
///
/// Other element types are returned untouched.
pub fn clamp_if_half<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let mode = PrecisionMode::of(&x);
    clamp_for(x, mode)
}

/// Clamps `x` to the finite f16 range when `mode` is [`PrecisionMode::Fp16`]
pub fn clamp_for<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    mode: Option<PrecisionMode>,
) -> Tensor<B, D> {
    match mode {
        Some(PrecisionMode::Fp16) => x.clamp(-F16_MAX, F16_MAX),
        _ => x,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_f32_is_untouched() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0e6, -1.0e6], &device);

        assert_eq!(PrecisionMode::of(&x), Some(PrecisionMode::Fp32));
        let y: Vec<f32> = clamp_if_half(x).into_data().to_vec().unwrap();
        assert_eq!(y, vec![1.0e6, -1.0e6]);
    }

    #[test]
    fn test_half_mode_clamps() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0e6, -1.0e6, 3.0], &device);

        let y: Vec<f32> = clamp_for(x, Some(PrecisionMode::Fp16))
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(y, vec![F16_MAX, -F16_MAX, 3.0]);
    }

    #[test]
    fn test_dtype_detection_drives_clamp() {
        // NdArray stores f32, so the f16 path is taken through its dtype
        assert_eq!(PrecisionMode::from_dtype(DType::F16), Some(PrecisionMode::Fp16));
        assert_eq!(PrecisionMode::from_dtype(DType::BF16), Some(PrecisionMode::Bf16));
        assert_eq!(PrecisionMode::from_dtype(DType::I64), None);

        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[7.0e4, -7.0e4]], &device);
        let y: Vec<f32> = clamp_for(x.clone(), PrecisionMode::from_dtype(DType::F16))
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(y, vec![F16_MAX, -F16_MAX]);

        let bf: Vec<f32> = clamp_for(x, PrecisionMode::from_dtype(DType::BF16))
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(bf, vec![7.0e4, -7.0e4]);
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(PrecisionMode::default().name(), "fp32");
        assert_eq!(PrecisionMode::Fp16.name(), "fp16");
    }
}
