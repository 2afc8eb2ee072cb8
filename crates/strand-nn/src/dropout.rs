// Dropout — regularization via random zeroing
//
// In Train mode each element is kept with probability 1 - rate and scaled
// by 1 / (1 - rate), which preserves the expected value. In Eval and
// Predict modes dropout is the identity.
//
// The mask comes from the rng key the layer is called with, so replaying a
// call with the same key reproduces the mask exactly. The reversible layers
// rely on that: they recompute forward passes during backprop.
//
// BroadcastedDropout draws one mask value per slice along `broadcast_dims`
// (by default the length axis, -2) and broadcasts it, which keeps the mask
// small for long sequences.

use strand_core::backend::Backend;
use strand_core::{Error, Result, RngKey, Tensor};

use crate::layer::{require_rng, single, Layer, Mode};
use crate::tree::Tree;

pub(crate) fn check_rate(rate: f64) -> Result<()> {
    if !(0.0..1.0).contains(&rate) {
        return Err(Error::InvalidDropoutRate { rate });
    }
    Ok(())
}

/// Scale `x` by a keep mask of `noise_shape` (broadcast to `x`).
pub(crate) fn apply_keep_mask<B: Backend>(
    x: &Tensor<B>,
    rate: f64,
    noise_shape: Vec<usize>,
    key: RngKey,
) -> Result<Tensor<B>> {
    let keep_prob = 1.0 - rate;
    let keep = key.bernoulli::<B>(noise_shape, keep_prob, x.dtype(), x.device())?;
    x.mul(&keep.mul_scalar(1.0 / keep_prob)?)
}

/// Elementwise dropout.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    rate: f64,
    mode: Mode,
}

impl Dropout {
    pub fn new(rate: f64, mode: Mode) -> Self {
        Dropout { rate, mode }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl<B: Backend> Layer<B> for Dropout {
    fn name(&self) -> &str {
        "Dropout"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        if self.mode != Mode::Train {
            return Ok((vec![x.clone()], state.clone()));
        }
        let key = require_rng(Layer::<B>::name(self), rng)?;
        check_rate(self.rate)?;
        let y = apply_keep_mask(x, self.rate, x.dims().to_vec(), key)?;
        Ok((vec![y], state.clone()))
    }
}

/// Dropout whose mask is shared along `broadcast_dims`.
///
/// Always requires an rng key, even when it ends up being the identity.
#[derive(Debug, Clone)]
pub struct BroadcastedDropout {
    rate: f64,
    mode: Mode,
    broadcast_dims: Vec<i64>,
}

impl BroadcastedDropout {
    /// Dropout at `rate` over the length axis.
    ///
    /// `rate` must lie in `[0, 1)`. A negative rate is not clamped to zero:
    /// like a rate of 1 or more, it makes every call fail with
    /// `InvalidDropoutRate`, in all modes.
    pub fn new(rate: f64, mode: Mode) -> Self {
        BroadcastedDropout {
            rate,
            mode,
            broadcast_dims: vec![-2],
        }
    }

    pub fn with_broadcast_dims(mut self, dims: Vec<i64>) -> Self {
        self.broadcast_dims = dims;
        self
    }
}

impl<B: Backend> Layer<B> for BroadcastedDropout {
    fn name(&self) -> &str {
        "BroadcastedDropout"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let key = require_rng(Layer::<B>::name(self), rng)?;
        check_rate(self.rate)?;
        if self.mode != Mode::Train || self.rate == 0.0 {
            return Ok((vec![x.clone()], state.clone()));
        }
        let mut noise_shape = x.dims().to_vec();
        for &d in &self.broadcast_dims {
            noise_shape[x.shape().normalize_axis(d)?] = 1;
        }
        let y = apply_keep_mask(x, self.rate, noise_shape, key)?;
        Ok((vec![y], state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::DType;
    use strand_cpu::{CpuBackend, CpuDevice, CpuTensor};

    fn x() -> Result<CpuTensor> {
        RngKey::new(5).normal::<CpuBackend>((2, 6, 4), 0.0, 1.0, DType::F64, &CpuDevice)
    }

    fn call<L: Layer<CpuBackend>>(layer: &L, x: &CpuTensor, rng: Option<RngKey>) -> Result<CpuTensor> {
        let (out, _) = layer.forward(std::slice::from_ref(x), &Tree::empty(), &Tree::empty(), rng)?;
        Ok(out[0].clone())
    }

    #[test]
    fn test_dropout_eval_is_identity() -> Result<()> {
        let x = x()?;
        let y = call(&Dropout::new(0.5, Mode::Eval), &x, None)?;
        assert_eq!(y.to_f64_vec()?, x.to_f64_vec()?);
        Ok(())
    }

    #[test]
    fn test_dropout_train_zeroes_or_scales() -> Result<()> {
        let x = x()?;
        let y = call(&Dropout::new(0.5, Mode::Train), &x, Some(RngKey::new(1)))?;
        for (a, b) in x.to_f64_vec()?.iter().zip(y.to_f64_vec()?) {
            assert!(b == 0.0 || (b - 2.0 * a).abs() < 1e-12);
        }
        assert!(matches!(
            call(&Dropout::new(0.5, Mode::Train), &x, None),
            Err(Error::MissingRng { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_broadcasted_mask_is_shared_along_length() -> Result<()> {
        let x = CpuTensor::ones((2, 6, 4), DType::F64, &CpuDevice)?;
        let y = call(&BroadcastedDropout::new(0.5, Mode::Train), &x, Some(RngKey::new(3)))?;
        let v = y.to_f64_vec()?;
        // Same value at every position of a (batch, feature) column.
        for b in 0..2 {
            for f in 0..4 {
                let first = v[b * 24 + f];
                assert!((0..6).all(|l| v[b * 24 + l * 4 + f] == first));
            }
        }
        Ok(())
    }

    #[test]
    fn test_broadcasted_dropout_errors() -> Result<()> {
        let x = x()?;
        assert!(matches!(
            call(&BroadcastedDropout::new(0.0, Mode::Eval), &x, None),
            Err(Error::MissingRng { .. })
        ));
        assert!(matches!(
            call(&BroadcastedDropout::new(1.0, Mode::Train), &x, Some(RngKey::new(0))),
            Err(Error::InvalidDropoutRate { .. })
        ));
        for mode in [Mode::Train, Mode::Eval, Mode::Predict] {
            assert!(matches!(
                call(&BroadcastedDropout::new(-0.1, mode), &x, Some(RngKey::new(0))),
                Err(Error::InvalidDropoutRate { rate }) if rate == -0.1
            ));
        }
        Ok(())
    }
}
