// LayerNorm — normalization over the feature (last) axis
//
//   y = (x - mean(x)) / sqrt(var(x) + eps) * scale + bias
//
// mean and var are taken over the last axis of each position. scale starts
// at ones and bias at zeros, both shaped [d_feature] and broadcast over the
// leading dimensions.

use strand_core::backend::Backend;
use strand_core::{Error, Result, RngKey, ShapeDtype, Tensor};

use crate::dense::{last_dim, param_dtype};
use crate::layer::{single, Layer};
use crate::tree::Tree;

/// Layer normalization with learnable scale and bias.
#[derive(Debug, Clone, Copy)]
pub struct LayerNorm {
    epsilon: f64,
}

impl LayerNorm {
    pub fn new() -> Self {
        LayerNorm { epsilon: 1e-6 }
    }

    pub fn with_epsilon(epsilon: f64) -> Self {
        LayerNorm { epsilon }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

impl Default for LayerNorm {
    fn default() -> Self {
        LayerNorm::new()
    }
}

impl<B: Backend> Layer<B> for LayerNorm {
    fn name(&self) -> &str {
        "LayerNorm"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        if x.rank() == 0 {
            return Err(Error::msg("LayerNorm: input must have at least 1 dimension"));
        }
        let sb = params.leaf_children(Layer::<B>::name(self), 2)?;
        let last = x.rank() - 1;

        let mean = x.mean(last, true)?;
        let centered = x.sub(&mean)?;
        let variance = centered.square()?.mean(last, true)?;
        let normed = centered.div(&variance.add_scalar(self.epsilon)?.sqrt()?)?;
        let y = normed.mul(sb[0])?.add(sb[1])?;
        Ok((vec![y], state.clone()))
    }

    fn new_params_and_state(
        &self,
        input_sig: &[ShapeDtype],
        _rng: RngKey,
        device: &B::Device,
    ) -> Result<(Tree<B>, Tree<B>)> {
        let d = last_dim(Layer::<B>::name(self), input_sig)?;
        let dtype = param_dtype(&input_sig[0]);
        let scale = Tensor::ones(d, dtype, device)?;
        let bias = Tensor::zeros(d, dtype, device)?;
        Ok((Tree::from_leaves(vec![scale, bias]), Tree::empty()))
    }
}
