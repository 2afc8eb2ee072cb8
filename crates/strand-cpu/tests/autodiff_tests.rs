// Reverse-mode autodiff checks: analytic rules, finite differences and vjp.

use proptest::prelude::*;
use strand_core::{vjp, DType, Result, Shape, Tensor};
use strand_cpu::{CpuDevice, CpuTensor};

fn t(data: &[f64], shape: impl Into<Shape>) -> Result<CpuTensor> {
    CpuTensor::from_f64_slice(data, shape, DType::F64, &CpuDevice)
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            (g - e).abs() < tol,
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

/// Central finite differences of a scalar function of one tensor.
fn numeric_grad(
    f: impl Fn(&CpuTensor) -> Result<CpuTensor>,
    x: &[f64],
    shape: &Shape,
) -> Result<Vec<f64>> {
    let eps = 1e-6;
    let mut grad = Vec::with_capacity(x.len());
    for i in 0..x.len() {
        let mut plus = x.to_vec();
        plus[i] += eps;
        let mut minus = x.to_vec();
        minus[i] -= eps;
        let fp = f(&t(&plus, shape.clone())?)?.to_scalar_f64()?;
        let fm = f(&t(&minus, shape.clone())?)?.to_scalar_f64()?;
        grad.push((fp - fm) / (2.0 * eps));
    }
    Ok(grad)
}

#[test]
fn test_mul_add_grad() -> Result<()> {
    let a = t(&[2.0], 1)?;
    let b = t(&[3.0], 1)?;
    let c = a.mul(&b)?.add(&a)?.sum_all()?;
    let grads = c.backward()?;
    // dc/da = b + 1, dc/db = a
    assert_eq!(grads.get(&a).map(|g| g.to_f64_vec()).transpose()?, Some(vec![4.0]));
    assert_eq!(grads.get(&b).map(|g| g.to_f64_vec()).transpose()?, Some(vec![2.0]));
    Ok(())
}

#[test]
fn test_backward_requires_scalar() -> Result<()> {
    let a = t(&[1.0, 2.0], 2)?;
    assert!(a.backward().is_err());
    Ok(())
}

#[test]
fn test_broadcast_grad_sums() -> Result<()> {
    let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    let b = t(&[1.0, 1.0, 1.0], 3)?;
    let grads = x.add(&b)?.sum_all()?.backward()?;
    let gb = grads.get(&b).map(|g| g.to_f64_vec()).transpose()?;
    assert_eq!(gb, Some(vec![2.0, 2.0, 2.0]));
    Ok(())
}

#[test]
fn test_matmul_grad_matches_finite_differences() -> Result<()> {
    let w_data = [0.5, -1.0, 2.0, 0.25, 1.5, -0.75];
    let w = t(&w_data, (3, 2))?;
    let x_data = [1.0, -2.0, 0.5, 3.0, 0.0, -1.0];
    let x_shape = Shape::from((2, 3));
    let f = |x: &CpuTensor| x.matmul(&w)?.tanh()?.sum_all();

    let x = t(&x_data, x_shape.clone())?;
    let grads = f(&x)?.backward()?;
    let analytic = grads
        .get(&x)
        .map(|g| g.to_f64_vec())
        .transpose()?
        .unwrap_or_default();
    let numeric = numeric_grad(f, &x_data, &x_shape)?;
    assert_vec_approx(&analytic, &numeric, 1e-6);
    Ok(())
}

#[test]
fn test_softmax_and_max_grads() -> Result<()> {
    let data = [0.3, -1.2, 2.0, 0.7, 0.1, -0.4];
    let shape = Shape::from((2, 3));
    let weights = t(&[1.0, 2.0, 3.0, -1.0, 0.5, 2.5], (2, 3))?;
    let f = |x: &CpuTensor| x.log_softmax(1)?.mul(&weights)?.sum_all();

    let x = t(&data, shape.clone())?;
    let grads = f(&x)?.backward()?;
    let analytic = grads
        .get(&x)
        .map(|g| g.to_f64_vec())
        .transpose()?
        .unwrap_or_default();
    assert_vec_approx(&analytic, &numeric_grad(f, &data, &shape)?, 1e-6);

    let m = |x: &CpuTensor| x.max(1, false)?.sum_all();
    let x = t(&data, shape.clone())?;
    let grads = m(&x)?.backward()?;
    let gm = grads
        .get(&x)
        .map(|g| g.to_f64_vec())
        .transpose()?
        .unwrap_or_default();
    assert_eq!(gm, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    Ok(())
}

#[test]
fn test_view_grads() -> Result<()> {
    // narrow + permute + cat, then a weighted sum.
    let data: Vec<f64> = (0..12).map(|i| i as f64 * 0.1).collect();
    let shape = Shape::from((3, 4));
    let f = |x: &CpuTensor| {
        let left = x.narrow(1, 0, 2)?.t()?;
        let right = x.narrow(1, 2, 2)?.t()?;
        let joined = Tensor::cat(&[right, left], 1)?;
        joined.square()?.sum_all()
    };
    let x = t(&data, shape.clone())?;
    let grads = f(&x)?.backward()?;
    let analytic = grads
        .get(&x)
        .map(|g| g.to_f64_vec())
        .transpose()?
        .unwrap_or_default();
    assert_vec_approx(&analytic, &numeric_grad(f, &data, &shape)?, 1e-5);
    Ok(())
}

#[test]
fn test_index_select_grad_scatters() -> Result<()> {
    let table = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2))?;
    let ids = CpuTensor::from_f64_slice(&[2.0, 2.0, 0.0], 3, DType::I64, &CpuDevice)?;
    let grads = table.index_select(0, &ids)?.sum_all()?.backward()?;
    let g = grads
        .get(&table)
        .map(|g| g.to_f64_vec())
        .transpose()?
        .unwrap_or_default();
    assert_eq!(g, vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    Ok(())
}

#[test]
fn test_vjp_pullback() -> Result<()> {
    let x = t(&[1.0, 2.0], 2)?;
    let y = t(&[3.0, -1.0], 2)?;
    let (outs, pullback) = vjp(
        |p: &[CpuTensor]| Ok(vec![p[0].mul(&p[1])?, p[0].exp()?]),
        &[x.clone(), y.clone()],
    )?;
    assert_eq!(outs.len(), 2);
    assert_eq!(outs[0].to_f64_vec()?, vec![3.0, -2.0]);

    let ct0 = t(&[1.0, 1.0], 2)?;
    let ct1 = t(&[0.0, 2.0], 2)?;
    let cts = pullback.apply(&[ct0, ct1])?;
    // d/dx = y * ct0 + exp(x) * ct1, d/dy = x * ct0
    assert_vec_approx(
        &cts[0].to_f64_vec()?,
        &[3.0, -1.0 + 2.0 * 2.0f64.exp()],
        1e-12,
    );
    assert_vec_approx(&cts[1].to_f64_vec()?, &[1.0, 2.0], 1e-12);

    // The pullback is reusable and rejects wrong arity.
    assert_eq!(pullback.apply(&outs)?.len(), 2);
    assert!(pullback.apply(&outs[..1]).is_err());
    Ok(())
}

#[test]
fn test_vjp_unused_and_integer_primals_get_zeros() -> Result<()> {
    let x = t(&[1.0, 2.0], 2)?;
    let ids = CpuTensor::from_f64_slice(&[1.0], 1, DType::I64, &CpuDevice)?;
    let unused = t(&[5.0], 1)?;
    let (_, pullback) = vjp(
        |p: &[CpuTensor]| Ok(vec![p[0].index_select(0, &p[1])?]),
        &[x, ids, unused],
    )?;
    let cts = pullback.apply(&[t(&[4.0], 1)?])?;
    assert_eq!(cts[0].to_f64_vec()?, vec![0.0, 4.0]);
    assert_eq!(cts[1].dtype(), DType::I64);
    assert_eq!(cts[1].to_f64_vec()?, vec![0.0]);
    assert_eq!(cts[2].to_f64_vec()?, vec![0.0]);
    Ok(())
}

proptest! {
    #[test]
    fn prop_layer_norm_style_grad(data in proptest::collection::vec(-2.0f64..2.0, 8)) {
        let shape = Shape::from((2, 4));
        let f = |x: &CpuTensor| -> Result<CpuTensor> {
            let mu = x.mean(1, true)?;
            let centered = x.sub(&mu)?;
            let var = centered.square()?.mean(1, true)?;
            let normed = centered.div(&var.add_scalar(1e-3)?.sqrt()?)?;
            normed.sigmoid()?.sum_all()
        };
        let x = t(&data, shape.clone()).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let analytic = f(&x)
            .and_then(|y| y.backward())
            .and_then(|g| g.get(&x).map(|g| g.to_f64_vec()).transpose())
            .map_err(|e| TestCaseError::fail(e.to_string()))?
            .unwrap_or_default();
        let numeric = numeric_grad(f, &data, &shape).map_err(|e| TestCaseError::fail(e.to_string()))?;
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            prop_assert!((a - n).abs() < 1e-4, "analytic {} vs numeric {}", a, n);
        }
    }
}
