// Backend selection from the outside: scoped overrides, panics, threads,
// and the numeric entry points under each provider.

use std::panic;

use proptest::prelude::*;
use strand::backend::{
    self, current_provider, use_backend, with_backend, BackendConfig, BackendContext, Padding, Provider,
};
use strand::{CpuBackend, CpuDevice, CpuTensor, DType, Error, Result, RngKey, Tensor};

type B = CpuBackend;

fn t(data: &[f64], shape: &[usize]) -> Result<CpuTensor> {
    Tensor::from_f64_slice(data, shape.to_vec(), DType::F64, &CpuDevice)
}

#[test]
fn test_override_reverts_after_panic() -> Result<()> {
    let result = panic::catch_unwind(|| {
        let _guard = use_backend("plain").map_err(|e| e.to_string());
        assert_eq!(current_provider(), Provider::Plain);
        panic!("boom");
    });
    assert!(result.is_err());
    assert_eq!(current_provider(), Provider::Autograd);
    Ok(())
}

#[test]
fn test_with_backend_scopes_the_closure() -> Result<()> {
    let inside = with_backend("plain", current_provider)?;
    assert_eq!(inside, Provider::Plain);
    assert_eq!(current_provider(), Provider::Autograd);
    assert!(matches!(with_backend("numpy", || ()), Err(Error::UnknownBackend { .. })));
    Ok(())
}

#[test]
fn test_override_is_per_thread() -> Result<()> {
    let _guard = use_backend("plain")?;
    let other = std::thread::spawn(current_provider)
        .join()
        .map_err(|_| Error::msg("thread panicked"))?;
    assert_eq!(other, Provider::Autograd);
    assert_eq!(current_provider(), Provider::Plain);
    Ok(())
}

#[test]
fn test_context_from_json() -> Result<()> {
    let cfg: BackendConfig = serde_json::from_str(r#"{"backend": "plain"}"#).map_err(|e| Error::msg(e.to_string()))?;
    let ctx = cfg.build()?;
    assert_eq!(ctx.provider(), Provider::Plain);
    {
        let _guard = ctx.enter();
        assert_eq!(current_provider(), Provider::Plain);
    }
    assert_eq!(current_provider(), Provider::Autograd);

    let defaulted: BackendConfig = serde_json::from_str("{}").map_err(|e| Error::msg(e.to_string()))?;
    assert_eq!(defaulted.build()?, BackendContext::default());
    Ok(())
}

#[test]
fn test_grad_through_provider() -> Result<()> {
    // d/dx sum(x^2) = 2x
    let x = t(&[1.0, -2.0, 3.0], &[3])?;
    let g = backend::grad(|xs: &[CpuTensor]| xs[0].mul(&xs[0])?.sum_all(), std::slice::from_ref(&x))?;
    assert_eq!(g[0].to_f64_vec()?, vec![2.0, -4.0, 6.0]);

    let _guard = use_backend("plain")?;
    let refused = backend::grad(|xs: &[CpuTensor]| xs[0].sum_all(), &[x]);
    assert!(matches!(refused, Err(Error::Unsupported { .. })));
    Ok(())
}

#[test]
fn test_prng_follows_provider() -> Result<()> {
    assert!(backend::get_prng(0).is_some());
    let keys = with_backend("plain", || backend::split(backend::get_prng(0), 3))?;
    assert_eq!(keys.len(), 3);
    assert!(keys.iter().all(Option::is_none));
    Ok(())
}

#[test]
fn test_pooling_matches_under_both_providers() -> Result<()> {
    let x = RngKey::new(2).normal::<B>((1, 4, 4, 2), 0.0, 1.0, DType::F64, &CpuDevice)?;
    let run = || -> Result<Vec<Vec<f64>>> {
        Ok(vec![
            backend::max_pool(&x, [2, 2], [2, 2], Padding::Valid)?.to_f64_vec()?,
            backend::avg_pool(&x, [3, 3], [1, 1], Padding::Same)?.to_f64_vec()?,
            backend::expit(&x)?.to_f64_vec()?,
        ])
    };
    let autograd = run()?;
    let plain = with_backend("plain", run)??;
    for (a, p) in autograd.iter().zip(&plain) {
        for (u, v) in a.iter().zip(p) {
            assert!((u - v).abs() < 1e-9);
        }
    }
    Ok(())
}

#[test]
fn test_erf_values_and_symmetry() -> Result<()> {
    let xs = [0.0, 0.5, 1.0, 2.0, 3.5];
    let expected = [0.0, 0.520_499_877_8, 0.842_700_792_9, 0.995_322_265_0, 0.999_999_256_9];
    for provider in ["autograd", "plain"] {
        let (pos, neg) = with_backend(provider, || -> Result<(Vec<f64>, Vec<f64>)> {
            let x = t(&xs, &[xs.len()])?;
            Ok((backend::erf(&x)?.to_f64_vec()?, backend::erf(&x.neg()?)?.to_f64_vec()?))
        })??;
        assert!(pos[0].abs() < 1e-8);
        for ((p, n), e) in pos.iter().zip(&neg).zip(expected) {
            assert!((p - e).abs() < 1e-6, "{}: erf gave {}, want {}", provider, p, e);
            assert!((p + n).abs() < 1e-8);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_override_stack_unwinds(depth in 1usize..6, plain_mask in any::<u8>()) {
        let mut guards = Vec::new();
        for i in 0..depth {
            let name = if plain_mask & (1 << i) != 0 { "plain" } else { "autograd" };
            guards.push(use_backend(name).map_err(|e| TestCaseError::fail(e.to_string()))?);
            prop_assert_eq!(current_provider(), guards[i].provider());
        }
        while let Some(guard) = guards.pop() {
            drop(guard);
            let expected = guards.last().map_or(Provider::Autograd, |g| g.provider());
            prop_assert_eq!(current_provider(), expected);
        }
    }
}
