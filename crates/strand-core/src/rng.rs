// RngKey — splittable, stateless random keys
//
// Randomness is never drawn from a global generator. A key is a value: the
// same key always produces the same sample, and `split(n)` derives n child
// keys deterministically. Combinators split their key once per sublayer, so
// a whole model's randomness is fixed by one seed.
//
// Sampling and splitting draw from separately salted StdRng streams, so a
// key's samples are unrelated to its children's samples.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

const SPLIT_SALT: u64 = 0x9E37_79B9_7F4A_7C15;
const SAMPLE_SALT: u64 = 0xD1B5_4A32_D192_ED03;

/// A deterministic, splittable random key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RngKey(u64);

impl RngKey {
    pub fn new(seed: u64) -> Self {
        RngKey(seed)
    }

    pub fn seed(&self) -> u64 {
        self.0
    }

    /// `n` child keys, identical for identical parents.
    pub fn split(&self, n: usize) -> Vec<RngKey> {
        let mut rng = StdRng::seed_from_u64(self.0 ^ SPLIT_SALT);
        (0..n).map(|_| RngKey(rng.gen())).collect()
    }

    /// A child key derived from `data`, e.g. a step counter.
    pub fn fold_in(&self, data: u64) -> RngKey {
        let mut rng = StdRng::seed_from_u64(self.0 ^ data.wrapping_mul(SPLIT_SALT));
        RngKey(rng.gen())
    }

    fn sampler(&self) -> StdRng {
        StdRng::seed_from_u64(self.0 ^ SAMPLE_SALT)
    }

    /// Uniform samples in `[low, high)`.
    pub fn uniform<B: Backend>(
        &self,
        shape: impl Into<Shape>,
        low: f64,
        high: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        if high < low {
            return Err(Error::msg(format!(
                "uniform: low ({}) must not exceed high ({})",
                low, high
            )));
        }
        let shape = shape.into();
        let mut rng = self.sampler();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| low + (high - low) * rng.gen::<f64>())
            .collect();
        Tensor::from_f64_slice(&data, shape, dtype, device)
    }

    /// Normal samples with the given mean and standard deviation.
    pub fn normal<B: Backend>(
        &self,
        shape: impl Into<Shape>,
        mean: f64,
        std: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        let shape = shape.into();
        let dist = Normal::new(mean, std)
            .map_err(|e| Error::msg(format!("normal(mean={}, std={}): {}", mean, std, e)))?;
        let mut rng = self.sampler();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| dist.sample(&mut rng))
            .collect();
        Tensor::from_f64_slice(&data, shape, dtype, device)
    }

    /// 1 with probability `p`, else 0.
    pub fn bernoulli<B: Backend>(
        &self,
        shape: impl Into<Shape>,
        p: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        if !(0.0..=1.0).contains(&p) {
            return Err(Error::msg(format!("bernoulli: p ({}) must lie in [0, 1]", p)));
        }
        let shape = shape.into();
        let mut rng = self.sampler();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| if rng.gen::<f64>() < p { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_f64_slice(&data, shape, dtype, device)
    }

    /// Integers in `[low, high)`.
    pub fn randint<B: Backend>(
        &self,
        shape: impl Into<Shape>,
        low: i64,
        high: i64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        if high <= low {
            return Err(Error::msg(format!(
                "randint: empty range [{}, {})",
                low, high
            )));
        }
        let shape = shape.into();
        let mut rng = self.sampler();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| rng.gen_range(low..high) as f64)
            .collect();
        Tensor::from_f64_slice(&data, shape, dtype, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_is_deterministic() {
        let key = RngKey::new(7);
        assert_eq!(key.split(3), key.split(3));
        assert_eq!(key.split(3)[..2], key.split(2)[..]);
    }

    #[test]
    fn test_children_differ() {
        let children = RngKey::new(0).split(4);
        for i in 0..children.len() {
            for j in (i + 1)..children.len() {
                assert_ne!(children[i], children[j]);
            }
        }
        assert_ne!(children[0], RngKey::new(0));
    }

    #[test]
    fn test_fold_in() {
        let key = RngKey::new(3);
        assert_eq!(key.fold_in(1), key.fold_in(1));
        assert_ne!(key.fold_in(1), key.fold_in(2));
    }
}
