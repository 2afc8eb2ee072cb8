// Dense — fully-connected layer
//
//   y = x @ W + b
//
// PARAMETER SHAPES:
//
//   W: [d_in, n_units]   glorot-uniform
//   b: [n_units]         N(0, 1e-6), broadcast over the leading dims
//
// The input may have any number of leading dimensions: [batch, len, d_in]
// maps to [batch, len, n_units] because matmul broadcasts W over the batch.

use strand_core::backend::Backend;
use strand_core::{DType, Error, Result, RngKey, ShapeDtype, Tensor};

use crate::init;
use crate::layer::{single, Layer};
use crate::tree::Tree;

/// Dtype for fresh parameters: the input's when it is a float, else f32.
pub(crate) fn param_dtype(sig: &ShapeDtype) -> DType {
    if sig.dtype().is_float() {
        sig.dtype()
    } else {
        DType::F32
    }
}

/// Size of the last axis of the first input signature.
pub(crate) fn last_dim(layer: &str, input_sig: &[ShapeDtype]) -> Result<usize> {
    input_sig
        .first()
        .and_then(|s| s.shape().dims().last().copied())
        .ok_or_else(|| Error::msg(format!("{}: input must have at least one dimension", layer)))
}

/// A fully-connected layer: `y = x @ W + b`.
///
/// # Example
/// ```ignore
/// let dense = Dense::new(128);
/// let init = dense.init(&[ShapeDtype::new((2, 10, 64), DType::F32)], RngKey::new(0), &CpuDevice)?;
/// let (y, _) = dense.forward(&[x], &init.params, &init.state, None)?; // [2, 10, 128]
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Dense {
    n_units: usize,
}

impl Dense {
    pub fn new(n_units: usize) -> Self {
        Dense { n_units }
    }

    pub fn n_units(&self) -> usize {
        self.n_units
    }
}

impl<B: Backend> Layer<B> for Dense {
    fn name(&self) -> &str {
        "Dense"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let wb = params.leaf_children(Layer::<B>::name(self), 2)?;
        let y = x.matmul(wb[0])?.add(wb[1])?;
        Ok((vec![y], state.clone()))
    }

    fn new_params_and_state(
        &self,
        input_sig: &[ShapeDtype],
        rng: RngKey,
        device: &B::Device,
    ) -> Result<(Tree<B>, Tree<B>)> {
        let d_in = last_dim(Layer::<B>::name(self), input_sig)?;
        let dtype = param_dtype(&input_sig[0]);
        let keys = rng.split(2);
        let w = init::glorot_uniform::<B>(keys[0], (d_in, self.n_units), dtype, device)?;
        let b = init::normal::<B>(keys[1], self.n_units, 0.0, 1e-6, dtype, device)?;
        Ok((Tree::from_leaves(vec![w, b]), Tree::empty()))
    }
}
