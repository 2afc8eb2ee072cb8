//! # strand-nn
//!
//! The layer algebra of strand: layers as pure functions of
//! `(inputs, params, state, rng)`, combinators that compose them on a data
//! stack, and reversible layers that rebuild their inputs during backprop.
//!
//! 1. **Layer traits**: [`Layer`], [`ReversibleLayer`], [`FusedAttention`]
//! 2. **Trees**: [`Tree`] holds nested params and state
//! 3. **Combinators**: [`Serial`], [`Parallel`], [`Branch`], [`Residual`], [`Map`]
//! 4. **Stack primitives**: [`NoOp`], [`Dup`], [`Swap`], [`Add`], [`SubtractTop`], ...
//! 5. **Core layers**: [`Dense`], [`Embedding`], [`LayerNorm`], dropout,
//!    positional encodings, masks, chunking
//! 6. **Attention**: multi-head attention and causal kernels
//! 7. **Reversible layers**: [`ReversibleHalfResidual`],
//!    [`ReversibleAttentionHalfResidual`], [`ReversibleSerial`]
//!
//! Layers are generic over `Backend`, like `Tensor<B>`.

pub mod activation;
pub mod attention;
pub mod chunk;
pub mod combinators;
pub mod dense;
pub mod dropout;
pub mod embedding;
pub mod init;
pub mod layer;
pub mod layernorm;
pub mod mask;
pub mod positional;
pub mod primitives;
pub mod reversible;
pub mod tree;

pub use activation::{LogSoftmax, Mean, Relu};
pub use attention::{
    attention, attention_qkv, causal_attention, qkv_heads, AttentionType, ComputeAttentionHeads,
    ComputeAttentionOutput, DotProductCausalAttention, MemoryEfficientCausalAttention, PureAttention,
};
pub use chunk::{Chunk, Unchunk};
pub use combinators::{Branch, Map, Parallel, Residual, Serial};
pub use dense::Dense;
pub use dropout::{BroadcastedDropout, Dropout};
pub use embedding::Embedding;
pub use layer::{
    check_arity, naive_reverse_and_grad, require_rng, split_rng, tape_backprop, Backprop, FusedAttention, Layer,
    LayerInit, Mode, ReverseGrad, ReversibleLayer,
};
pub use layernorm::LayerNorm;
pub use mask::{EncoderDecoderMask, PaddingMask};
pub use positional::{PositionalEncoding, ShiftRight};
pub use primitives::{Add, Concatenate, Drop, Dup, NoOp, Split, SubtractTop, Swap};
pub use reversible::{
    ApplyAttentionWrapper, ReversibleAttentionHalfResidual, ReversibleHalfResidual, ReversibleSerial, ReversibleSwap,
    SplitForOutput,
};
pub use tree::Tree;
