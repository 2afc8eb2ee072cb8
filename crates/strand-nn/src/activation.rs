// Activation and reduction layers — thin wrappers over tensor ops so they
// compose in combinators.

use strand_core::backend::Backend;
use strand_core::{Result, RngKey, Tensor};

use crate::layer::{single, Layer};
use crate::tree::Tree;

/// ReLU activation: max(0, x)
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl<B: Backend> Layer<B> for Relu {
    fn name(&self) -> &str {
        "Relu"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        Ok((vec![single(Layer::<B>::name(self), inputs)?.relu()?], state.clone()))
    }
}

/// Log-probabilities along `axis`: `x - logsumexp(x)`.
#[derive(Debug, Clone, Copy)]
pub struct LogSoftmax {
    axis: i64,
}

impl LogSoftmax {
    pub fn new(axis: i64) -> Self {
        LogSoftmax { axis }
    }
}

impl Default for LogSoftmax {
    fn default() -> Self {
        LogSoftmax::new(-1)
    }
}

impl<B: Backend> Layer<B> for LogSoftmax {
    fn name(&self) -> &str {
        "LogSoftmax"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let axis = x.shape().normalize_axis(self.axis)?;
        Ok((vec![x.log_softmax(axis)?], state.clone()))
    }
}

/// Mean along `axis`.
#[derive(Debug, Clone, Copy)]
pub struct Mean {
    axis: i64,
    keep_dims: bool,
}

impl Mean {
    pub fn new(axis: i64) -> Self {
        Mean {
            axis,
            keep_dims: false,
        }
    }

    pub fn keep_dims(mut self, keep: bool) -> Self {
        self.keep_dims = keep;
        self
    }
}

impl<B: Backend> Layer<B> for Mean {
    fn name(&self) -> &str {
        "Mean"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let axis = x.shape().normalize_axis(self.axis)?;
        Ok((vec![x.mean(axis, self.keep_dims)?], state.clone()))
    }
}
