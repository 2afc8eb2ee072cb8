use std::fmt;

// DType — element types a tensor can carry
//
//   F32 — default for activations and parameters
//   F64 — used by tests that compare fused and naive gradients tightly
//   U8  — comparison results and boolean masks
//   U32 — unsigned indices
//   I64 — token ids fed to embeddings

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    U8,
    U32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
            DType::U32 => 4,
            DType::I64 => 8,
        }
    }

    /// Whether this dtype is a floating-point type (only these carry gradients).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Round a host value the way storage of this dtype would.
    pub fn quantize(&self, v: f64) -> f64 {
        match self {
            DType::F32 => v as f32 as f64,
            DType::F64 => v,
            DType::U8 => v as u8 as f64,
            DType::U32 => v as u32 as f64,
            DType::I64 => v as i64 as f64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

/// Trait implemented by Rust types that can be stored in a tensor.
///
/// Bridges the concrete Rust type and the runtime [`DType`] tag.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype {
    ($ty:ty, $variant:ident) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$variant;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
        }
    };
}

with_dtype!(f32, F32);
with_dtype!(f64, F64);
with_dtype!(u8, U8);
with_dtype!(u32, U32);
with_dtype!(i64, I64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
        assert_eq!(DType::I64.size_in_bytes(), 8);
    }

    #[test]
    fn test_quantize_truncates_ints() {
        assert_eq!(DType::I64.quantize(3.7), 3.0);
        assert_eq!(DType::F32.quantize(0.1), 0.1f32 as f64);
        assert_eq!(DType::F64.quantize(0.1), 0.1);
    }

    #[test]
    fn test_with_dtype_f32() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(f32::from_f64(2.5).to_f64(), 2.5);
        assert_eq!(i64::from_f64(42.0).to_f64(), 42.0);
    }
}
