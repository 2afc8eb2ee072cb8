// Chunk / Unchunk — fold the length axis into the batch axis and back
//
//   Chunk(n)    [B, L, ..]   -> [B * n, L / n, ..]
//   Unchunk(n)  [B', L', ..] -> [B' / n, L' * n, ..]
//
// Chunking lets position-wise layers (feed-forward blocks) run on a long
// sequence piece by piece. Both are plain reshapes, so Unchunk(n) undoes
// Chunk(n) exactly.

use strand_core::backend::Backend;
use strand_core::{Error, Result, RngKey, Tensor};

use crate::layer::{single, Layer};
use crate::tree::Tree;

fn reshape_leading<B: Backend>(x: &Tensor<B>, d0: usize, d1: usize) -> Result<Tensor<B>> {
    let mut dims = vec![d0, d1];
    dims.extend_from_slice(&x.dims()[2..]);
    x.reshape(dims)
}

#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    n_sections: usize,
}

impl Chunk {
    pub fn new(n_sections: usize) -> Self {
        Chunk { n_sections }
    }
}

impl<B: Backend> Layer<B> for Chunk {
    fn name(&self) -> &str {
        "Chunk"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let (batch, len) = (x.dim(0)?, x.dim(1)?);
        if self.n_sections == 0 || len % self.n_sections != 0 {
            return Err(Error::not_divisible("Chunk: length", len, self.n_sections));
        }
        let y = reshape_leading(x, batch * self.n_sections, len / self.n_sections)?;
        Ok((vec![y], state.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Unchunk {
    n_sections: usize,
}

impl Unchunk {
    pub fn new(n_sections: usize) -> Self {
        Unchunk { n_sections }
    }
}

impl<B: Backend> Layer<B> for Unchunk {
    fn name(&self) -> &str {
        "Unchunk"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let (batch, len) = (x.dim(0)?, x.dim(1)?);
        if self.n_sections == 0 || batch % self.n_sections != 0 {
            return Err(Error::not_divisible("Unchunk: batch", batch, self.n_sections));
        }
        let y = reshape_leading(x, batch / self.n_sections, len * self.n_sections)?;
        Ok((vec![y], state.clone()))
    }
}
