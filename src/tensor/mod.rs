//! Element types and typed views into arena memory

mod view;

pub use view::TensorView;

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::backend::DeviceResult;
use crate::kernels::gemm::{GemmAlgorithm, GemmDesc, GemmProvider};

/// Element type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
        }
    }
}

/// Element types the engine can store
///
/// Arithmetic always happens in f32; storage may be narrower.
pub trait Scalar: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;

    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;

    /// Dispatch to the provider's kernel for this element type
    fn gemm(
        provider: &dyn GemmProvider,
        desc: &GemmDesc,
        algo: &GemmAlgorithm,
        a: &[Self],
        b: &[Self],
        c: &mut [Self],
        bias_grad: Option<&mut [Self]>,
    ) -> DeviceResult<()>;
}

impl Scalar for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }

    fn gemm(
        provider: &dyn GemmProvider,
        desc: &GemmDesc,
        algo: &GemmAlgorithm,
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        bias_grad: Option<&mut [f32]>,
    ) -> DeviceResult<()> {
        provider.gemm_f32(desc, algo, a, b, c, bias_grad)
    }
}

impl Scalar for f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    fn gemm(
        provider: &dyn GemmProvider,
        desc: &GemmDesc,
        algo: &GemmAlgorithm,
        a: &[f16],
        b: &[f16],
        c: &mut [f16],
        bias_grad: Option<&mut [f16]>,
    ) -> DeviceResult<()> {
        provider.gemm_f16(desc, algo, a, b, c, bias_grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes_match_rust_types() {
        assert_eq!(DType::F32.size_in_bytes(), std::mem::size_of::<f32>());
        assert_eq!(DType::F16.size_in_bytes(), std::mem::size_of::<f16>());
        assert_eq!(<f32 as Scalar>::DTYPE, DType::F32);
        assert_eq!(<f16 as Scalar>::DTYPE, DType::F16);
    }

    #[test]
    fn test_f16_round_trips_exact_values() {
        for v in [0.0f32, 1.0, -2.5, 0.125, 1024.0] {
            assert_eq!(<f16 as Scalar>::from_f32(v).to_f32(), v);
        }
    }
}
