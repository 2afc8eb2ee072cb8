// Attention masks
//
//   PaddingMask          ids [B, L]             -> [B, 1, 1, L]
//   EncoderDecoderMask   dec [B, Ld, ..],
//                        mask [B, 1, 1, Le]     -> [B, 1, Ld, Le]
//
// Masks are U8: 1 where attention is allowed, 0 at padding. The singleton
// axes broadcast over heads and query positions.

use strand_core::backend::Backend;
use strand_core::{Result, RngKey, Tensor};

use crate::layer::{check_arity, single, Layer};
use crate::tree::Tree;

/// Marks the positions of `ids` that are not `pad`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaddingMask {
    pad: i64,
}

impl PaddingMask {
    pub fn new(pad: i64) -> Self {
        PaddingMask { pad }
    }
}

impl<B: Backend> Layer<B> for PaddingMask {
    fn name(&self) -> &str {
        "PaddingMask"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let ids = single(Layer::<B>::name(self), inputs)?;
        let batch = ids.dim(0)?;
        let len = ids.dim(-1)?;
        let pad = Tensor::full_like(ids, self.pad as f64)?;
        let mask = ids.ne(&pad)?.reshape((batch, 1, 1, len))?;
        Ok((vec![mask], state.clone()))
    }
}

/// Broadcasts an encoder padding mask over the decoder's positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderDecoderMask;

impl<B: Backend> Layer<B> for EncoderDecoderMask {
    fn name(&self) -> &str {
        "EncoderDecoderMask"
    }

    fn n_in(&self) -> usize {
        2
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(Layer::<B>::name(self), 2, inputs.len())?;
        let (dec, mask) = (&inputs[0], &inputs[1]);
        let target = (mask.dim(0)?, 1, dec.dim(1)?, mask.dim(-1)?);
        let out = mask.broadcast_as(target)?.contiguous()?;
        Ok((vec![out], state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::DType;
    use strand_cpu::{CpuBackend, CpuDevice, CpuTensor};

    #[test]
    fn test_padding_then_encoder_decoder_mask() -> Result<()> {
        let ids = CpuTensor::from_f64_slice(&[3.0, 7.0, 0.0, 5.0, 0.0, 0.0], (2, 3), DType::I64, &CpuDevice)?;
        let (m, _) = Layer::<CpuBackend>::forward(&PaddingMask::default(), &[ids], &Tree::empty(), &Tree::empty(), None)?;
        assert_eq!(m[0].dims(), &[2, 1, 1, 3]);
        assert_eq!(m[0].dtype(), DType::U8);
        assert_eq!(m[0].to_f64_vec()?, vec![1.0, 1.0, 0.0, 1.0, 0.0, 0.0]);

        let dec = CpuTensor::zeros((2, 4, 8), DType::F32, &CpuDevice)?;
        let (out, _) = EncoderDecoderMask.forward(&[dec, m[0].clone()], &Tree::empty(), &Tree::empty(), None)?;
        assert_eq!(out[0].dims(), &[2, 1, 4, 3]);
        let v = out[0].to_f64_vec()?;
        assert_eq!(&v[9..12], &[1.0, 1.0, 0.0]);
        assert_eq!(&v[12..15], &[1.0, 0.0, 0.0]);
        Ok(())
    }
}
