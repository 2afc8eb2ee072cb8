// Kernel and tensor-op tests on the CPU backend.

use strand_core::{DType, Result, Shape, Tensor};
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

#[test]
fn test_broadcast_add() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    let b = t(&[10.0, 20.0, 30.0], 3)?;
    let c = a.add(&b)?;
    assert_eq!(c.dims(), &[2, 3]);
    assert_eq!(c.to_f64_vec()?, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    Ok(())
}

#[test]
fn test_incompatible_broadcast_fails() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0], 3)?;
    let b = t(&[1.0, 2.0], 2)?;
    assert!(a.add(&b).is_err());
    Ok(())
}

#[test]
fn test_matmul_2d() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let b = t(&[5.0, 6.0, 7.0, 8.0], (2, 2))?;
    assert_eq!(a.matmul(&b)?.to_f64_vec()?, vec![19.0, 22.0, 43.0, 50.0]);
    Ok(())
}

#[test]
fn test_matmul_batched_with_shared_rhs() -> Result<()> {
    // [2, 1, 2] @ [2, 2]: the weight is shared across the batch.
    let a = t(&[1.0, 0.0, 0.0, 1.0], (2, 1, 2))?;
    let w = t(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let y = a.matmul(&w)?;
    assert_eq!(y.dims(), &[2, 1, 2]);
    assert_eq!(y.to_f64_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn test_matmul_of_transposed_view() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    let at = a.t()?;
    assert!(!at.is_contiguous());
    let gram = at.matmul(&a)?;
    assert_eq!(gram.dims(), &[3, 3]);
    assert_eq!(
        gram.to_f64_vec()?,
        vec![17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]
    );
    Ok(())
}

#[test]
fn test_reductions() -> Result<()> {
    let a = t(&[1.0, 5.0, 3.0, 4.0, 2.0, 6.0], (2, 3))?;
    assert_eq!(a.sum(1, false)?.to_f64_vec()?, vec![9.0, 12.0]);
    assert_eq!(a.sum(0, true)?.dims(), &[1, 3]);
    assert_eq!(a.max(1, false)?.to_f64_vec()?, vec![5.0, 6.0]);
    assert_eq!(a.min(0, false)?.to_f64_vec()?, vec![1.0, 2.0, 3.0]);
    assert_eq!(a.mean_all()?.to_scalar_f64()?, 3.5);
    Ok(())
}

#[test]
fn test_softmax_rows_sum_to_one() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0], (2, 3))?;
    let s = a.softmax(1)?.sum(1, false)?.to_f64_vec()?;
    assert_vec_approx(&s, &[1.0, 1.0], 1e-12);
    let lse = a.logsumexp(1, false)?.to_f64_vec()?;
    assert_vec_approx(
        &lse,
        &[3.0 + (1.0 + (-1.0f64).exp() + (-2.0f64).exp()).ln(), 1000.0 + 3.0f64.ln()],
        1e-9,
    );
    Ok(())
}

#[test]
fn test_cat_and_chunk() -> Result<()> {
    let a = t(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let b = t(&[5.0, 6.0], (2, 1))?;
    let c = Tensor::cat(&[a, b], 1)?;
    assert_eq!(c.dims(), &[2, 3]);
    assert_eq!(c.to_f64_vec()?, vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);

    let parts = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 6)?.chunk(3, 0)?;
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[2].to_f64_vec()?, vec![5.0, 6.0]);
    assert!(t(&[1.0, 2.0, 3.0], 3)?.chunk(2, 0).is_err());
    Ok(())
}

#[test]
fn test_index_select_rows() -> Result<()> {
    let table = t(&[0.0, 1.0, 10.0, 11.0, 20.0, 21.0], (3, 2))?;
    let ids = CpuTensor::from_f64_slice(&[2.0, 0.0, 2.0], 3, DType::I64, &CpuDevice)?;
    let rows = table.index_select(0, &ids)?;
    assert_eq!(rows.dims(), &[3, 2]);
    assert_eq!(rows.to_f64_vec()?, vec![20.0, 21.0, 0.0, 1.0, 20.0, 21.0]);

    let bad = CpuTensor::from_f64_slice(&[3.0], 1, DType::I64, &CpuDevice)?;
    assert!(table.index_select(0, &bad).is_err());
    Ok(())
}

#[test]
fn test_where_cond_broadcasts_mask() -> Result<()> {
    let mask = CpuTensor::from_f64_slice(&[1.0, 0.0], (1, 2), DType::U8, &CpuDevice)?;
    let x = t(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
    let fill = CpuTensor::full((), -9.0, DType::F64, &CpuDevice)?;
    let y = Tensor::where_cond(&mask, &x, &fill)?;
    assert_eq!(y.to_f64_vec()?, vec![1.0, -9.0, 3.0, -9.0]);
    Ok(())
}

#[test]
fn test_permute_then_reshape_copies() -> Result<()> {
    let a = t(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], (1, 2, 3))?;
    let p = a.permute(&[0, 2, 1])?;
    assert_eq!(p.dims(), &[1, 3, 2]);
    let r = p.reshape(6)?;
    assert_eq!(r.to_f64_vec()?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    Ok(())
}

#[test]
fn test_narrow_view_offsets() -> Result<()> {
    let a = t(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], (2, 4))?;
    let n = a.narrow(1, 1, 2)?;
    assert_eq!(n.to_f64_vec()?, vec![1.0, 2.0, 5.0, 6.0]);
    assert!(a.narrow(1, 3, 2).is_err());
    Ok(())
}

#[test]
fn test_dtype_round_trip() -> Result<()> {
    let a = t(&[1.25, -2.5], 2)?;
    let f = a.to_dtype(DType::F32)?;
    assert_eq!(f.dtype(), DType::F32);
    let i = a.to_dtype(DType::I64)?;
    assert_eq!(i.to_f64_vec()?, vec![1.0, -2.0]);
    Ok(())
}

#[test]
fn test_dtype_mismatch_is_error() -> Result<()> {
    let a = t(&[1.0], 1)?;
    let b = CpuTensor::ones(1, DType::F32, &CpuDevice)?;
    assert!(a.add(&b).is_err());
    Ok(())
}

#[test]
fn test_backend_name() {
    use strand_core::BackendDevice;
    assert_eq!(CpuDevice.name(), "cpu");
}
