//! # strand-core
//!
//! Tensor primitives and reverse-mode autodiff for strand.
//!
//! - [`Tensor`]: n-dimensional array that records the op that produced it
//! - [`Shape`] / [`Layout`]: shape, strides and offset
//! - [`DType`] and [`ShapeDtype`]: element types and static signatures
//! - [`Backend`]: the kernel interface a compute device implements
//! - [`backprop::vjp`] / [`GradStore`]: gradients and pullbacks
//! - [`RngKey`]: splittable random keys

pub mod backend;
pub mod backprop;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod op;
pub mod rng;
pub mod shape;
pub mod shape_dtype;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage};
pub use backprop::{vjp, GradStore, Pullback};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use op::{Op, TensorId};
pub use rng::RngKey;
pub use shape::Shape;
pub use shape_dtype::{eval_on_shapes, ShapeDtype};
pub use tensor::Tensor;
