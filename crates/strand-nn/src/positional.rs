// Positional layers — sinusoidal encodings and right shifts
//
// PositionalEncoding adds a [1, max_len, d_feature] table to its input:
//
//   pe[p, 2i]   = sin(p / 10000^(2i / d))
//   pe[p, 2i+1] = cos(p / 10000^(2i / d))
//
// The table is a trainable parameter initialized to those values. In Train
// and Eval mode the first L rows are added to an input of length L. In
// Predict mode the model decodes one position per call; the state is then a
// scalar position counter that selects the row and is incremented.
//
// ShiftRight pads n zeros at the start of the length axis and drops the last
// n positions, so position t only sees tokens before t. It is the identity in
// Predict mode, where inputs arrive already shifted.

use strand_core::backend::Backend;
use strand_core::{DType, Error, Result, RngKey, ShapeDtype, Tensor};

use crate::dense::{last_dim, param_dtype};
use crate::dropout::{apply_keep_mask, check_rate};
use crate::layer::{require_rng, single, Layer, Mode};
use crate::tree::Tree;

/// Adds sinusoidal position encodings, with optional broadcast dropout on
/// the encodings.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    max_len: usize,
    dropout: f64,
    dropout_broadcast_dims: Vec<i64>,
    mode: Mode,
}

impl PositionalEncoding {
    pub fn new(max_len: usize, dropout: f64, mode: Mode) -> Self {
        PositionalEncoding {
            max_len,
            dropout,
            dropout_broadcast_dims: vec![-2],
            mode,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    fn table(&self, d_feature: usize) -> Vec<f64> {
        let mut pe = vec![0.0; self.max_len * d_feature];
        for pos in 0..self.max_len {
            for i in (0..d_feature).step_by(2) {
                let div = (i as f64 * -(10000f64.ln() / d_feature as f64)).exp();
                let angle = pos as f64 * div;
                pe[pos * d_feature + i] = angle.sin();
                if i + 1 < d_feature {
                    pe[pos * d_feature + i + 1] = angle.cos();
                }
            }
        }
        pe
    }
}

impl<B: Backend> Layer<B> for PositionalEncoding {
    fn name(&self) -> &str {
        "PositionalEncoding"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let pe = params.leaf_children(Layer::<B>::name(self), 1)?[0];

        if self.mode == Mode::Predict {
            let counter = state.as_leaf().ok_or_else(|| Error::Uninitialized {
                layer: Layer::<B>::name(self).to_string(),
            })?;
            let pos = counter.to_scalar_f64()? as usize;
            if pos >= self.max_len {
                return Err(Error::msg(format!(
                    "PositionalEncoding: position {} exceeds max_len {}",
                    pos, self.max_len
                )));
            }
            let y = x.add(&pe.narrow(1, pos, 1)?)?;
            return Ok((vec![y], Tree::Leaf(counter.add_scalar(1.0)?)));
        }

        let len = x.dim(1)?;
        let px = pe.narrow(1, 0, len)?;
        if self.dropout == 0.0 || self.mode != Mode::Train {
            return Ok((vec![x.add(&px)?], state.clone()));
        }
        let key = require_rng(Layer::<B>::name(self), rng)?;
        check_rate(self.dropout)?;
        let mut noise_shape = px.dims().to_vec();
        for &d in &self.dropout_broadcast_dims {
            noise_shape[px.shape().normalize_axis(d)?] = 1;
        }
        let y = x.add(&apply_keep_mask(&px, self.dropout, noise_shape, key)?)?;
        Ok((vec![y], state.clone()))
    }

    fn new_params_and_state(
        &self,
        input_sig: &[ShapeDtype],
        _rng: RngKey,
        device: &B::Device,
    ) -> Result<(Tree<B>, Tree<B>)> {
        let d_feature = last_dim(Layer::<B>::name(self), input_sig)?;
        let pe = Tensor::from_f64_slice(
            &self.table(d_feature),
            (1, self.max_len, d_feature),
            param_dtype(&input_sig[0]),
            device,
        )?;
        let state = match self.mode {
            Mode::Predict => Tree::Leaf(Tensor::zeros((), DType::I64, device)?),
            _ => Tree::empty(),
        };
        Ok((Tree::from_leaves(vec![pe]), state))
    }
}

/// Shifts the length axis (axis 1) right by `n_shifts`, padding with zeros.
#[derive(Debug, Clone, Copy)]
pub struct ShiftRight {
    n_shifts: usize,
    mode: Mode,
}

impl ShiftRight {
    pub fn new(mode: Mode) -> Self {
        ShiftRight { n_shifts: 1, mode }
    }

    pub fn with_shifts(mut self, n_shifts: usize) -> Self {
        self.n_shifts = n_shifts;
        self
    }
}

impl<B: Backend> Layer<B> for ShiftRight {
    fn name(&self) -> &str {
        "ShiftRight"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        if self.mode == Mode::Predict || self.n_shifts == 0 {
            return Ok((vec![x.clone()], state.clone()));
        }
        let len = x.dim(1)?;
        let n = self.n_shifts.min(len);
        let pad = Tensor::zeros(x.shape().with_dim(1, n), x.dtype(), x.device())?;
        let y = if n == len {
            pad
        } else {
            Tensor::cat(&[pad, x.narrow(1, 0, len - n)?], 1)?
        };
        Ok((vec![y], state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_cpu::{CpuBackend, CpuDevice, CpuTensor};

    #[test]
    fn test_shift_right() -> Result<()> {
        let x = CpuTensor::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::I64, &CpuDevice)?;
        let layer = ShiftRight::new(Mode::Train);
        let (y, _) = Layer::<CpuBackend>::forward(&layer, &[x.clone()], &Tree::empty(), &Tree::empty(), None)?;
        assert_eq!(y[0].to_f64_vec()?, vec![0.0, 1.0, 2.0, 0.0, 4.0, 5.0]);
        assert_eq!(y[0].dtype(), DType::I64);

        let predict = ShiftRight::new(Mode::Predict);
        let (y, _) = Layer::<CpuBackend>::forward(&predict, &[x.clone()], &Tree::empty(), &Tree::empty(), None)?;
        assert_eq!(y[0].to_f64_vec()?, x.to_f64_vec()?);
        Ok(())
    }

    #[test]
    fn test_table_values() {
        let pe = PositionalEncoding::new(4, 0.0, Mode::Train).table(4);
        // position 0: sin(0) = 0, cos(0) = 1
        assert_eq!(&pe[..4], &[0.0, 1.0, 0.0, 1.0]);
        assert!((pe[4] - 1f64.sin()).abs() < 1e-12);
        assert!((pe[6] - (0.01f64).sin()).abs() < 1e-12);
    }

    #[test]
    fn test_predict_mode_counts_positions() -> Result<()> {
        let layer = PositionalEncoding::new(8, 0.0, Mode::Predict);
        let sig = [ShapeDtype::new((1, 1, 4), DType::F64)];
        let init = Layer::<CpuBackend>::init(&layer, &sig, RngKey::new(0), &CpuDevice)?;
        let x = CpuTensor::zeros((1, 1, 4), DType::F64, &CpuDevice)?;
        let (y0, s1) = layer.forward(&[x.clone()], &init.params, &init.state, None)?;
        let (y1, s2) = layer.forward(&[x], &init.params, &s1, None)?;
        assert_eq!(y0[0].to_f64_vec()?, vec![0.0, 1.0, 0.0, 1.0]);
        assert!((y1[0].to_f64_vec()?[0] - 1f64.sin()).abs() < 1e-12);
        assert_eq!(s2.as_leaf().map(|t| t.to_scalar_f64()).transpose()?, Some(2.0));
        Ok(())
    }
}
