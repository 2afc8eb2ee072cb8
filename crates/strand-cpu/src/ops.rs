use rayon::prelude::*;

use strand_core::backend::{Backend, BackendStorage, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use strand_core::{DType, Error, Layout, Result, Shape};

use crate::{CpuDevice, CpuStorage};

// CPU kernels
//
// Each kernel gathers its operands into logical-order f64 buffers, computes,
// and converts back to the input dtype. Integer arithmetic therefore follows
// f64 semantics and truncates on store, which is all the layer code needs
// (index tensors are only ever selected, compared or cast).

/// CPU implementation of [`Backend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn apply_unary(op: UnaryOp, x: f64) -> f64 {
    match op {
        UnaryOp::Neg => -x,
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Relu => x.max(0.0),
        UnaryOp::Sigmoid => sigmoid(x),
        UnaryOp::Tanh => x.tanh(),
        UnaryOp::Square => x * x,
    }
}

fn apply_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
    }
}

fn apply_cmp(op: CmpOp, a: f64, b: f64) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
    }
}

fn check_same_shape(lhs: &Layout, rhs: &Layout) -> Result<()> {
    if lhs.shape() != rhs.shape() {
        return Err(Error::ShapeMismatch {
            expected: lhs.shape().clone(),
            got: rhs.shape().clone(),
        });
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 0.0, dtype, device)
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(&vec![val; shape.elem_count()], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(data, dtype))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        check_same_shape(lhs_layout, rhs_layout)?;
        let a = lhs.gather(lhs_layout)?;
        let b = rhs.gather(rhs_layout)?;
        let out: Vec<f64> = a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| apply_binary(op, x, y))
            .collect();
        Ok(CpuStorage::from_f64(&out, lhs.dtype()))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let out: Vec<f64> = input
            .gather(layout)?
            .into_iter()
            .map(|x| apply_unary(op, x))
            .collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        let out: Vec<f64> = input
            .gather(layout)?
            .into_iter()
            .map(|x| x * mul + add)
            .collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn powf(input: &CpuStorage, layout: &Layout, exponent: f64) -> Result<CpuStorage> {
        let out: Vec<f64> = input
            .gather(layout)?
            .into_iter()
            .map(|x| x.powf(exponent))
            .collect();
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn cmp_op(
        op: CmpOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        check_same_shape(lhs_layout, rhs_layout)?;
        let a = lhs.gather(lhs_layout)?;
        let b = rhs.gather(rhs_layout)?;
        let out: Vec<u8> = a
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| apply_cmp(op, x, y) as u8)
            .collect();
        Ok(CpuStorage::U8(out))
    }

    fn where_cond(
        mask: &CpuStorage,
        mask_layout: &Layout,
        on_true: &CpuStorage,
        on_true_layout: &Layout,
        on_false: &CpuStorage,
        on_false_layout: &Layout,
    ) -> Result<CpuStorage> {
        check_same_shape(mask_layout, on_true_layout)?;
        check_same_shape(mask_layout, on_false_layout)?;
        let m = mask.gather(mask_layout)?;
        let t = on_true.gather(on_true_layout)?;
        let f = on_false.gather(on_false_layout)?;
        let out: Vec<f64> = m
            .iter()
            .zip(t.iter().zip(f.iter()))
            .map(|(&c, (&x, &y))| if c != 0.0 { x } else { y })
            .collect();
        Ok(CpuStorage::from_f64(&out, on_true.dtype()))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
    ) -> Result<CpuStorage> {
        let data = input.gather(layout)?;
        let in_dims = layout.dims();
        let in_strides = layout.shape().stride_contiguous();

        // Contiguous strides of the output, indexed by input dimension
        // (reduced dimensions contribute nothing).
        let mut out_strides = vec![0usize; in_dims.len()];
        let mut out_len = 1usize;
        for d in (0..in_dims.len()).rev() {
            if !dims.contains(&d) {
                out_strides[d] = out_len;
                out_len *= in_dims[d];
            }
        }
        let group: usize = dims.iter().map(|&d| in_dims[d]).product();

        let init = match op {
            ReduceOp::Sum | ReduceOp::Mean => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        };
        let mut acc = vec![init; out_len];
        for (flat, &v) in data.iter().enumerate() {
            let mut rem = flat;
            let mut target = 0usize;
            for d in 0..in_dims.len() {
                let coord = rem / in_strides[d];
                rem %= in_strides[d];
                target += coord * out_strides[d];
            }
            let slot = &mut acc[target];
            *slot = match op {
                ReduceOp::Sum | ReduceOp::Mean => *slot + v,
                ReduceOp::Max => slot.max(v),
                ReduceOp::Min => slot.min(v),
            };
        }
        if op == ReduceOp::Mean && group > 0 {
            for v in acc.iter_mut() {
                *v /= group as f64;
            }
        }
        Ok(CpuStorage::from_f64(&acc, input.dtype()))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let ld = lhs_layout.dims();
        let rd = rhs_layout.dims();
        let rank = ld.len();
        if rank < 2
            || rd.len() != rank
            || ld[..rank - 2] != rd[..rank - 2]
            || ld[rank - 1] != rd[rank - 2]
        {
            return Err(Error::MatmulShapeMismatch {
                lhs: lhs_layout.shape().clone(),
                rhs: rhs_layout.shape().clone(),
            });
        }
        let (m, k, n) = (ld[rank - 2], ld[rank - 1], rd[rank - 1]);
        let batch: usize = ld[..rank - 2].iter().product();

        let a = lhs.gather(lhs_layout)?;
        let b = rhs.gather(rhs_layout)?;
        let mut c = vec![0.0f64; batch * m * n];
        if m * n > 0 {
            c.par_chunks_mut(m * n).enumerate().for_each(|(bi, out)| {
                let a = &a[bi * m * k..(bi + 1) * m * k];
                let b = &b[bi * k * n..(bi + 1) * k * n];
                for i in 0..m {
                    for p in 0..k {
                        let aip = a[i * k + p];
                        let row = &b[p * n..(p + 1) * n];
                        for (o, &bv) in out[i * n..(i + 1) * n].iter_mut().zip(row) {
                            *o += aip * bv;
                        }
                    }
                }
            });
        }
        Ok(CpuStorage::from_f64(&c, lhs.dtype()))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(&input.gather(layout)?, input.dtype()))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        input.gather(layout)
    }

    fn index_select(
        input: &CpuStorage,
        input_layout: &Layout,
        indices: &CpuStorage,
        indices_layout: &Layout,
        dim: usize,
    ) -> Result<CpuStorage> {
        let data = input.gather(input_layout)?;
        let idx = indices.gather(indices_layout)?;
        let in_dims = input_layout.dims();
        let size = in_dims[dim];
        let outer: usize = in_dims[..dim].iter().product();
        let inner: usize = in_dims[dim + 1..].iter().product();

        let mut out = Vec::with_capacity(outer * idx.len() * inner);
        for o in 0..outer {
            for &i in &idx {
                if i < 0.0 || i as usize >= size {
                    return Err(Error::msg(format!(
                        "index_select: index {} out of range for dim {} of size {}",
                        i, dim, size
                    )));
                }
                let start = (o * size + i as usize) * inner;
                out.extend_from_slice(&data[start..start + inner]);
            }
        }
        Ok(CpuStorage::from_f64(&out, input.dtype()))
    }

    fn cat(inputs: &[(&CpuStorage, &Layout)], out_shape: &Shape, dim: usize) -> Result<CpuStorage> {
        let dtype = match inputs.first() {
            Some((s, _)) => s.dtype(),
            None => return Err(Error::msg("cat: empty input list")),
        };
        let out_dims = out_shape.dims();
        let outer: usize = out_dims[..dim].iter().product();
        let inner: usize = out_dims[dim + 1..].iter().product();

        let parts = inputs
            .iter()
            .map(|(s, l)| Ok((s.gather(l)?, l.dims()[dim] * inner)))
            .collect::<Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(out_shape.elem_count());
        for o in 0..outer {
            for (data, block) in &parts {
                out.extend_from_slice(&data[o * block..(o + 1) * block]);
            }
        }
        Ok(CpuStorage::from_f64(&out, dtype))
    }

    fn cast(
        input: &CpuStorage,
        layout: &Layout,
        dtype: DType,
        _device: &CpuDevice,
    ) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(&input.gather(layout)?, dtype))
    }
}
