// Op — graph node recorded by every tensor
//
// A tensor remembers the operation that produced it together with clones of
// its input tensors. Clones are Arc bumps, so the graph keeps exactly the
// activations that backward() will read and nothing more. Dropping the root
// of a graph releases the whole chain.
//
//   c = a.add(&b)   →   c.op = Op::Binary { lhs: a, rhs: b, op: Add }
//
// Detaching (`Tensor::detach`) produces a tensor with Op::None that shares
// storage. The reversible layers rely on this to cut the graph between
// blocks so that only one block's activations are alive at a time.

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Unique identifier for a tensor. Keys the gradient store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Next id from a global atomic counter.
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The operation that produced a tensor.
pub enum Op<B: Backend> {
    /// Leaf: an input, a parameter or a detached value.
    None,

    Binary {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
        op: BinaryOp,
    },

    Unary {
        input: Tensor<B>,
        op: UnaryOp,
    },

    /// `dims` are the reduced dimensions; `keep_dim` records whether they
    /// were kept as size 1.
    Reduce {
        input: Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    Matmul {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
    },

    Reshape {
        input: Tensor<B>,
        src_shape: Shape,
    },

    Permute {
        input: Tensor<B>,
        perm: Vec<usize>,
    },

    Narrow {
        input: Tensor<B>,
        dim: usize,
        start: usize,
        len: usize,
    },

    /// Stride-0 expansion of `input` (whose shape was `src_shape`).
    Broadcast {
        input: Tensor<B>,
        src_shape: Shape,
    },

    Affine {
        input: Tensor<B>,
        mul: f64,
        add: f64,
    },

    Powf {
        input: Tensor<B>,
        exponent: f64,
    },

    Cat {
        inputs: Vec<Tensor<B>>,
        dim: usize,
        sizes: Vec<usize>,
    },

    /// The mask is not differentiable.
    WhereCond {
        mask: Tensor<B>,
        on_true: Tensor<B>,
        on_false: Tensor<B>,
    },

    /// The indices are not differentiable.
    IndexSelect {
        input: Tensor<B>,
        indices: Tensor<B>,
        dim: usize,
    },

    Contiguous {
        input: Tensor<B>,
    },

    ToDtype {
        input: Tensor<B>,
        src_dtype: DType,
    },
}

impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dims: dims.clone(),
                keep_dim: *keep_dim,
            },
            Op::Matmul { lhs, rhs } => Op::Matmul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Permute { input, perm } => Op::Permute {
                input: input.clone(),
                perm: perm.clone(),
            },
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => Op::Narrow {
                input: input.clone(),
                dim: *dim,
                start: *start,
                len: *len,
            },
            Op::Broadcast { input, src_shape } => Op::Broadcast {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Affine { input, mul, add } => Op::Affine {
                input: input.clone(),
                mul: *mul,
                add: *add,
            },
            Op::Powf { input, exponent } => Op::Powf {
                input: input.clone(),
                exponent: *exponent,
            },
            Op::Cat { inputs, dim, sizes } => Op::Cat {
                inputs: inputs.clone(),
                dim: *dim,
                sizes: sizes.clone(),
            },
            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => Op::WhereCond {
                mask: mask.clone(),
                on_true: on_true.clone(),
                on_false: on_false.clone(),
            },
            Op::IndexSelect {
                input,
                indices,
                dim,
            } => Op::IndexSelect {
                input: input.clone(),
                indices: indices.clone(),
                dim: *dim,
            },
            Op::Contiguous { input } => Op::Contiguous {
                input: input.clone(),
            },
            Op::ToDtype { input, src_dtype } => Op::ToDtype {
                input: input.clone(),
                src_dtype: *src_dtype,
            },
        }
    }
}

impl<B: Backend> Op<B> {
    /// The tensors this op reads, in a fixed order. The topological sort in
    /// backprop walks these edges.
    pub fn inputs(&self) -> Vec<&Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Permute { input, .. }
            | Op::Narrow { input, .. }
            | Op::Broadcast { input, .. }
            | Op::Affine { input, .. }
            | Op::Powf { input, .. }
            | Op::Contiguous { input }
            | Op::ToDtype { input, .. } => vec![input],
            Op::Cat { inputs, .. } => inputs.iter().collect(),
            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => vec![mask, on_true, on_false],
            Op::IndexSelect { input, indices, .. } => vec![input, indices],
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Op::None)
    }
}
