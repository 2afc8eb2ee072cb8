// Embedding — lookup table for discrete tokens
//
// The table is a [vocab_size, d_feature] matrix drawn from N(0, 1). Input ids
// of any shape [...] (int64) map to [..., d_feature]: the ids are flattened,
// rows are gathered with index_select, and the result is reshaped back.
// Gradients scatter-add into the gathered rows.

use strand_core::backend::Backend;
use strand_core::{DType, Result, RngKey, ShapeDtype, Tensor};

use crate::init;
use crate::layer::{single, Layer};
use crate::tree::Tree;

/// A learnable lookup table mapping integer ids to dense vectors.
#[derive(Debug, Clone, Copy)]
pub struct Embedding {
    d_feature: usize,
    vocab_size: usize,
    dtype: DType,
}

impl Embedding {
    pub fn new(d_feature: usize, vocab_size: usize) -> Self {
        Embedding {
            d_feature,
            vocab_size,
            dtype: DType::F32,
        }
    }

    /// Dtype of the table (f32 by default).
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn d_feature(&self) -> usize {
        self.d_feature
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

impl<B: Backend> Layer<B> for Embedding {
    fn name(&self) -> &str {
        "Embedding"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let ids = single(Layer::<B>::name(self), inputs)?;
        let table = params.leaf_children(Layer::<B>::name(self), 1)?[0];
        let flat = ids.reshape(ids.elem_count())?;
        let mut out_dims = ids.dims().to_vec();
        out_dims.push(self.d_feature);
        let rows = table.index_select(0, &flat)?.reshape(out_dims)?;
        Ok((vec![rows], state.clone()))
    }

    fn new_params_and_state(
        &self,
        _input_sig: &[ShapeDtype],
        rng: RngKey,
        device: &B::Device,
    ) -> Result<(Tree<B>, Tree<B>)> {
        let table = init::normal::<B>(rng, (self.vocab_size, self.d_feature), 0.0, 1.0, self.dtype, device)?;
        Ok((Tree::from_leaves(vec![table]), Tree::empty()))
    }
}
