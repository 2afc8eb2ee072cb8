//! # strand
//!
//! Transformer and Reformer models built from a reversible-layer algebra,
//! over a swappable array/gradient provider.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ```ignore
//! use strand::prelude::*;
//!
//! let cfg = ReformerLmConfig::default().with_vocab_size(32).with_n_layers(2);
//! let mut model = Model::<CpuBackend>::new(Box::new(reformer_lm(&cfg)?), BackendContext::default(), CpuDevice);
//! model.initialize_once(&[ShapeDtype::new((1, 64), DType::I64)], 0)?;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `strand-core` | Tensor, Shape, DType, ShapeDtype, Backend trait, autodiff, RngKey |
//! | `strand-cpu` | CPU backend |
//! | `strand-nn` | Layer trait, param trees, combinators, attention, reversible layers |
//!
//! ## Modules
//!
//! - [`backend`] — providers, scoped overrides, numeric ops and transforms
//! - [`config`] — serde-deserializable model and backend configs
//! - [`models`] — Transformer and Reformer builders
//! - [`model`] — `Model`, the stateful handle around a layer

/// Re-export core types.
pub use strand_core::{
    backend::{Backend, BackendDevice, BackendStorage},
    op::{Op, TensorId},
    DType, Error, GradStore, Layout, Result, RngKey, Shape, ShapeDtype, Tensor, WithDType,
};

/// Re-export CPU backend.
pub use strand_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export the layer algebra.
pub mod nn {
    pub use strand_nn::*;
}

/// Backend shim — Autograd and Plain providers and the override stack.
pub mod backend;

/// Configuration — defaults and builder setters for every builder.
pub mod config;

/// Model — params and state owned alongside a layer.
pub mod model;

/// Models — Transformer, TransformerLM, ReformerLM and friends.
pub mod models;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::backend::{current_provider, use_backend, with_backend, BackendConfig, BackendContext, Provider};
    pub use crate::config::{
        AttentionTypes, ReformerLmConfig, TransformerConfig, TransformerDecoderConfig, TransformerEncoderConfig,
        TransformerLmConfig,
    };
    pub use crate::model::Model;
    pub use crate::models::{reformer_lm, transformer, transformer_decoder, transformer_encoder, transformer_lm};
    pub use crate::nn::{AttentionType, Layer, Mode, ReversibleLayer, Serial, Tree};
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, RngKey, Shape, ShapeDtype, Tensor};
}
