// Random keys through the provider.
//
// Autograd hands out splittable RngKeys. Plain has no key type: get_prng is
// None and split yields Nones, so stochastic layers run under Plain report
// MissingRng. The samplers take an explicit key under either provider.

use strand_core::backend::Backend;
use strand_core::{DType, Result, RngKey, Shape, Tensor};

use super::{current_provider, Provider};

impl Provider {
    pub fn get_prng(&self, seed: u64) -> Option<RngKey> {
        match self {
            Provider::Autograd => Some(RngKey::new(seed)),
            Provider::Plain => None,
        }
    }

    pub fn split(&self, key: Option<RngKey>, n: usize) -> Vec<Option<RngKey>> {
        match (self, key) {
            (Provider::Autograd, Some(key)) => key.split(n).into_iter().map(Some).collect(),
            _ => vec![None; n],
        }
    }

    pub fn uniform<B: Backend>(
        &self,
        key: RngKey,
        shape: impl Into<Shape>,
        low: f64,
        high: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        key.uniform(shape, low, high, dtype, device)
    }

    pub fn normal<B: Backend>(
        &self,
        key: RngKey,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        key.normal(shape, 0.0, 1.0, dtype, device)
    }

    pub fn bernoulli<B: Backend>(
        &self,
        key: RngKey,
        shape: impl Into<Shape>,
        p: f64,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        key.bernoulli(shape, p, DType::U8, device)
    }

    /// Integers in `[low, high)`, int64 unless told otherwise.
    pub fn randint<B: Backend>(
        &self,
        key: RngKey,
        shape: impl Into<Shape>,
        low: i64,
        high: i64,
        dtype: Option<DType>,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        key.randint(shape, low, high, dtype.unwrap_or(DType::I64), device)
    }
}

/// [`Provider::get_prng`] on the current provider.
pub fn get_prng(seed: u64) -> Option<RngKey> {
    current_provider().get_prng(seed)
}

/// [`Provider::split`] on the current provider.
pub fn split(key: Option<RngKey>, n: usize) -> Vec<Option<RngKey>> {
    current_provider().split(key, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn test_plain_has_no_keys() {
        assert_eq!(Provider::Plain.get_prng(3), None);
        assert_eq!(Provider::Plain.split(Some(RngKey::new(3)), 2), vec![None, None]);
    }

    #[test]
    fn test_autograd_split_is_deterministic() {
        let key = Provider::Autograd.get_prng(3);
        assert!(key.is_some());
        let a = Provider::Autograd.split(key, 3);
        let b = Provider::Autograd.split(key, 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_ne!(a[0], a[1]);
    }

    #[test]
    fn test_samplers() -> Result<()> {
        let p = Provider::Autograd;
        let key = RngKey::new(9);
        let ints = p.randint::<CpuBackend>(key, (4, 5), 2, 6, None, &CpuDevice)?;
        assert_eq!(ints.dtype(), DType::I64);
        assert!(ints.to_f64_vec()?.iter().all(|v| (2.0..6.0).contains(v)));

        let coin = p.bernoulli::<CpuBackend>(key, 50, 1.0, &CpuDevice)?;
        assert!(coin.to_f64_vec()?.iter().all(|v| *v == 1.0));

        let a = p.normal::<CpuBackend>(key, 8, DType::F32, &CpuDevice)?;
        let b = Provider::Plain.normal::<CpuBackend>(key, 8, DType::F32, &CpuDevice)?;
        assert_eq!(a.to_f64_vec()?, b.to_f64_vec()?);

        let u = p.uniform::<CpuBackend>(key, 100, -1.0, 1.0, DType::F64, &CpuDevice)?;
        assert!(u.to_f64_vec()?.iter().all(|v| (-1.0..1.0).contains(v)));
        Ok(())
    }
}
