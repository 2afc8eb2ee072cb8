use std::fmt;

use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::Result;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// The static signature of an array: its shape and element type, no data.
///
/// Layers are initialized from a list of these, and shape inference returns
/// them without keeping any computed values alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeDtype {
    shape: Shape,
    dtype: DType,
}

impl ShapeDtype {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        ShapeDtype {
            shape: shape.into(),
            dtype,
        }
    }

    /// Signature of an existing tensor.
    pub fn of<B: Backend>(tensor: &Tensor<B>) -> Self {
        ShapeDtype {
            shape: tensor.shape().clone(),
            dtype: tensor.dtype(),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// A zero-filled tensor with this signature.
    pub fn zeros<B: Backend>(&self, device: &B::Device) -> Result<Tensor<B>> {
        Tensor::zeros(self.shape.clone(), self.dtype, device)
    }
}

/// Run `f` on zero-filled tensors of the given signatures and report the
/// signatures of its outputs. The computed values are dropped.
pub fn eval_on_shapes<B, F>(f: F, sigs: &[ShapeDtype], device: &B::Device) -> Result<Vec<ShapeDtype>>
where
    B: Backend,
    F: FnOnce(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
{
    let inputs = sigs
        .iter()
        .map(|s| s.zeros::<B>(device))
        .collect::<Result<Vec<_>>>()?;
    Ok(f(&inputs)?.iter().map(ShapeDtype::of).collect())
}

impl fmt::Display for ShapeDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShapeDtype{{shape:{}, dtype:{}}}", self.shape, self.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let sd = ShapeDtype::new((2, 3), DType::F32);
        assert_eq!(sd.to_string(), "ShapeDtype{shape:[2, 3], dtype:f32}");
    }

    #[test]
    fn test_equality() {
        assert_eq!(
            ShapeDtype::new(4, DType::I64),
            ShapeDtype::new(vec![4], DType::I64)
        );
        assert_ne!(
            ShapeDtype::new(4, DType::I64),
            ShapeDtype::new(4, DType::F32)
        );
    }
}
