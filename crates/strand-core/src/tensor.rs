use std::sync::{Arc, RwLock, RwLockReadGuard};

use crate::backend::{Backend, BinaryOp, CmpOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;

// Tensor — n-dimensional array with a recorded history
//
// Tensor<B> is a cheap handle (an Arc) over an inner record holding the
// backend storage, the layout, the dtype, the device and the op that made it.
//
//   - Views (permute, narrow, broadcast_as, reshape of contiguous data) share
//     storage through Arc<RwLock<Storage>> and only change the layout.
//   - Every other op allocates fresh contiguous storage through the backend.
//   - Every op records an `Op` with clones of its inputs, so any tensor can be
//     differentiated after the fact. `detach()` cuts that history.
//
// Dimension arguments are plain `usize` here. The layer crates accept
// negative axes and resolve them with `Shape::normalize_axis`.

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    op: Op<B>,
}

/// An n-dimensional array on a backend.
///
/// ```ignore
/// use strand_core::{DType, Tensor};
/// use strand_cpu::{CpuBackend, CpuDevice};
///
/// let a = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32, &CpuDevice)?;
/// let b = Tensor::<CpuBackend>::ones((2, 2), DType::F32, &CpuDevice)?;
/// let c = a.matmul(&b)?;
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
            }),
        }
    }

    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
            }),
        }
    }

    fn contiguous_result(&self, storage: B::Storage, shape: Shape, dtype: DType, op: Op<B>) -> Self {
        Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            self.inner.device.clone(),
            op,
        )
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    /// Size of a possibly negative axis.
    pub fn dim(&self, axis: i64) -> Result<usize> {
        let d = self.shape().normalize_axis(axis)?;
        Ok(self.dims()[d])
    }

    // Creation

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Build a tensor from host values laid out row-major.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// `[0, 1, ..., n-1]`.
    pub fn arange(n: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let data: Vec<f64> = (0..n).map(|i| i as f64).collect();
        Self::from_f64_slice(&data, n, dtype, device)
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone(), other.dtype(), other.device())
    }

    pub fn full_like(other: &Self, val: f64) -> Result<Self> {
        Self::full(other.shape().clone(), val, other.dtype(), other.device())
    }

    // Views

    pub fn permute(&self, perm: &[usize]) -> Result<Self> {
        let layout = self.inner.layout.permute(perm)?;
        let op = Op::Permute {
            input: self.clone(),
            perm: perm.to_vec(),
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// Swap two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let rank = self.rank();
        for d in [dim0, dim1] {
            if d >= rank {
                return Err(Error::DimOutOfRange { dim: d as i64, rank });
            }
        }
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(dim0, dim1);
        self.permute(&perm)
    }

    /// Swap the two trailing dimensions (matrix transpose per batch).
    pub fn t(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        self.transpose(rank - 2, rank - 1)
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let layout = self.inner.layout.narrow(dim, start, len)?;
        let op = Op::Narrow {
            input: self.clone(),
            dim,
            start,
            len,
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// Expand to `shape` with NumPy broadcasting rules, without copying.
    pub fn broadcast_as(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if &shape == self.shape() {
            return Ok(self.clone());
        }
        let layout = self.inner.layout.broadcast_as(&shape)?;
        let op = Op::Broadcast {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// Reshape to a shape with the same element count. Non-contiguous
    /// tensors are copied first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if self.elem_count() != new_shape.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: new_shape.elem_count(),
                dst_shape: new_shape,
            });
        }
        let tensor = self.contiguous()?;
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape: tensor.shape().clone(),
        };
        Ok(tensor.view_with_layout(Layout::contiguous(new_shape), op))
    }

    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = {
            let guard = self.read_storage()?;
            B::to_contiguous(&guard, &self.inner.layout)?
        };
        Ok(self.contiguous_result(
            storage,
            self.shape().clone(),
            self.dtype(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    /// Insert a size-1 dimension at `dim`.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank,
            });
        }
        let mut dims = self.dims().to_vec();
        dims.insert(dim, 1);
        self.reshape(dims)
    }

    /// Remove a size-1 dimension.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let size = self.shape().dim(dim)?;
        if size != 1 {
            return Err(Error::msg(format!(
                "squeeze: dim {} has size {}, expected 1",
                dim, size
            )));
        }
        let mut dims = self.dims().to_vec();
        dims.remove(dim);
        self.reshape(dims)
    }

    // Elementwise arithmetic

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn check_same_dtype(&self, rhs: &Self) -> Result<()> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        Ok(())
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        self.check_same_dtype(rhs)?;
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs = self.broadcast_as(&out_shape)?;
        let rhs = rhs.broadcast_as(&out_shape)?;
        let storage = {
            let l = lhs.read_storage()?;
            let r = rhs.read_storage()?;
            B::binary_op(op, &l, lhs.layout(), &r, rhs.layout())?
        };
        Ok(self.contiguous_result(
            storage,
            out_shape,
            self.dtype(),
            Op::Binary { lhs, rhs, op },
        ))
    }

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Tanh)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let storage = {
            let guard = self.read_storage()?;
            B::unary_op(op, &guard, self.layout())?
        };
        Ok(self.contiguous_result(
            storage,
            self.shape().clone(),
            self.dtype(),
            Op::Unary {
                input: self.clone(),
                op,
            },
        ))
    }

    /// `self * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = {
            let guard = self.read_storage()?;
            B::affine(&guard, self.layout(), mul, add)?
        };
        Ok(self.contiguous_result(
            storage,
            self.shape().clone(),
            self.dtype(),
            Op::Affine {
                input: self.clone(),
                mul,
                add,
            },
        ))
    }

    pub fn add_scalar(&self, v: f64) -> Result<Self> {
        self.affine(1.0, v)
    }

    pub fn mul_scalar(&self, v: f64) -> Result<Self> {
        self.affine(v, 0.0)
    }

    pub fn powf(&self, exponent: f64) -> Result<Self> {
        let storage = {
            let guard = self.read_storage()?;
            B::powf(&guard, self.layout(), exponent)?
        };
        Ok(self.contiguous_result(
            storage,
            self.shape().clone(),
            self.dtype(),
            Op::Powf {
                input: self.clone(),
                exponent,
            },
        ))
    }

    // Comparisons (U8 results, not differentiable)

    pub fn eq(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Eq)
    }

    pub fn ne(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Ne)
    }

    pub fn gt(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Gt)
    }

    pub fn ge(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Ge)
    }

    pub fn lt(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Lt)
    }

    pub fn le(&self, rhs: &Self) -> Result<Self> {
        self.cmp_op(rhs, CmpOp::Le)
    }

    fn cmp_op(&self, rhs: &Self, op: CmpOp) -> Result<Self> {
        self.check_same_dtype(rhs)?;
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let l_layout = self.layout().broadcast_as(&out_shape)?;
        let r_layout = rhs.layout().broadcast_as(&out_shape)?;
        let storage = {
            let l = self.read_storage()?;
            let r = rhs.read_storage()?;
            B::cmp_op(op, &l, &l_layout, &r, &r_layout)?
        };
        Ok(self.contiguous_result(storage, out_shape, DType::U8, Op::None))
    }

    /// Pick from `on_true` where `mask` is nonzero, else from `on_false`.
    /// All three broadcast to a common shape.
    pub fn where_cond(mask: &Self, on_true: &Self, on_false: &Self) -> Result<Self> {
        on_true.check_same_dtype(on_false)?;
        let shape = Shape::broadcast_shape(
            &Shape::broadcast_shape(mask.shape(), on_true.shape())?,
            on_false.shape(),
        )?;
        let mask = mask.broadcast_as(&shape)?;
        let on_true = on_true.broadcast_as(&shape)?;
        let on_false = on_false.broadcast_as(&shape)?;
        let storage = {
            let m = mask.read_storage()?;
            let t = on_true.read_storage()?;
            let f = on_false.read_storage()?;
            B::where_cond(
                &m,
                mask.layout(),
                &t,
                on_true.layout(),
                &f,
                on_false.layout(),
            )?
        };
        let dtype = on_true.dtype();
        Ok(on_true.contiguous_result(
            storage,
            shape,
            dtype,
            Op::WhereCond {
                mask,
                on_true: on_true.clone(),
                on_false,
            },
        ))
    }

    // Reductions

    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    /// Sum over every element, giving a scalar.
    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[dim], keep_dim)
    }

    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, &[dim], keep_dim)
    }

    pub fn min(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Min, &[dim], keep_dim)
    }

    /// Reduce over `dims`; an empty slice reduces over all dimensions.
    pub fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        let rank = self.rank();
        for &d in dims {
            if d >= rank {
                return Err(Error::DimOutOfRange {
                    dim: d as i64,
                    rank,
                });
            }
        }
        let mut dims: Vec<usize> = if dims.is_empty() {
            (0..rank).collect()
        } else {
            dims.to_vec()
        };
        dims.sort_unstable();
        dims.dedup();

        let storage = {
            let guard = self.read_storage()?;
            B::reduce_op(op, &guard, self.layout(), &dims)?
        };
        let out_dims: Vec<usize> = self
            .dims()
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| {
                if !dims.contains(&i) {
                    Some(d)
                } else if keep_dim {
                    Some(1)
                } else {
                    None
                }
            })
            .collect();
        Ok(self.contiguous_result(
            storage,
            Shape::new(out_dims),
            self.dtype(),
            Op::Reduce {
                input: self.clone(),
                op,
                dims,
                keep_dim,
            },
        ))
    }

    // Composites built from differentiable primitives

    /// Numerically stable softmax along `dim`.
    pub fn softmax(&self, dim: usize) -> Result<Self> {
        let shifted = self.sub(&self.max(dim, true)?.detach())?;
        let e = shifted.exp()?;
        e.div(&e.sum(dim, true)?)
    }

    pub fn log_softmax(&self, dim: usize) -> Result<Self> {
        let shifted = self.sub(&self.max(dim, true)?.detach())?;
        shifted.sub(&shifted.exp()?.sum(dim, true)?.log()?)
    }

    /// `log(sum(exp(x)))` along `dim`, stabilized by the running max.
    pub fn logsumexp(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        let m = self.max(dim, true)?.detach();
        let out = self.sub(&m)?.exp()?.sum(dim, true)?.log()?.add(&m)?;
        if keep_dim {
            Ok(out)
        } else {
            out.squeeze(dim)
        }
    }

    // Linear algebra

    /// Batched matrix multiply `[..., m, k] @ [..., k, n]`. Batch dimensions
    /// broadcast, so a rank-2 right operand is shared across the batch.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        self.check_same_dtype(rhs)?;
        let (lr, rr) = (self.rank(), rhs.rank());
        if lr < 2 || rr < 2 {
            return Err(Error::MatmulShapeMismatch {
                lhs: self.shape().clone(),
                rhs: rhs.shape().clone(),
            });
        }
        let (m, k) = (self.dims()[lr - 2], self.dims()[lr - 1]);
        let (k2, n) = (rhs.dims()[rr - 2], rhs.dims()[rr - 1]);
        if k != k2 {
            return Err(Error::MatmulShapeMismatch {
                lhs: self.shape().clone(),
                rhs: rhs.shape().clone(),
            });
        }
        let batch = Shape::broadcast_shape(
            &Shape::from(&self.dims()[..lr - 2]),
            &Shape::from(&rhs.dims()[..rr - 2]),
        )?;
        let with_tail = |a: usize, b: usize| {
            let mut dims = batch.dims().to_vec();
            dims.extend([a, b]);
            Shape::new(dims)
        };
        let lhs = self.broadcast_as(with_tail(m, k))?;
        let rhs = rhs.broadcast_as(with_tail(k, n))?;
        let storage = {
            let l = lhs.read_storage()?;
            let r = rhs.read_storage()?;
            B::matmul(&l, lhs.layout(), &r, rhs.layout())?
        };
        Ok(self.contiguous_result(
            storage,
            with_tail(m, n),
            self.dtype(),
            Op::Matmul { lhs, rhs },
        ))
    }

    // Joining and splitting

    /// Concatenate along `dim`. All other dimensions must agree.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = match tensors.first() {
            Some(t) => t,
            None => return Err(Error::msg("cat: empty tensor list")),
        };
        if tensors.len() == 1 {
            return Ok(first.clone());
        }
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank,
            });
        }
        for t in tensors.iter().skip(1) {
            first.check_same_dtype(t)?;
            let same_rest = t.rank() == rank
                && (0..rank).all(|d| d == dim || t.dims()[d] == first.dims()[d]);
            if !same_rest {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().clone(),
                    got: t.shape().clone(),
                });
            }
        }
        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[dim]).collect();
        let out_shape = first.shape().with_dim(dim, sizes.iter().sum());

        let guards = tensors
            .iter()
            .map(|t| t.read_storage())
            .collect::<Result<Vec<_>>>()?;
        let pairs: Vec<(&B::Storage, &Layout)> = guards
            .iter()
            .zip(tensors.iter())
            .map(|(g, t)| (&**g, t.layout()))
            .collect();
        let storage = B::cat(&pairs, &out_shape, dim)?;
        drop(pairs);
        drop(guards);

        Ok(first.contiguous_result(
            storage,
            out_shape,
            first.dtype(),
            Op::Cat {
                inputs: tensors.to_vec(),
                dim,
                sizes,
            },
        ))
    }

    /// Split into `n` equal views along `dim`. Fails unless `n` divides the
    /// dimension.
    pub fn chunk(&self, n: usize, dim: usize) -> Result<Vec<Self>> {
        let size = self.shape().dim(dim)?;
        if n == 0 || size % n != 0 {
            return Err(Error::not_divisible(
                format!("chunk along dim {}", dim),
                size,
                n,
            ));
        }
        let len = size / n;
        (0..n).map(|i| self.narrow(dim, i * len, len)).collect()
    }

    /// Stack equally shaped tensors along a new dimension.
    pub fn stack(tensors: &[Self], dim: usize) -> Result<Self> {
        let expanded = tensors
            .iter()
            .map(|t| t.unsqueeze(dim))
            .collect::<Result<Vec<_>>>()?;
        Self::cat(&expanded, dim)
    }

    /// Gather entries of `dim` by a 1-D integer index tensor.
    pub fn index_select(&self, dim: usize, indices: &Self) -> Result<Self> {
        if indices.rank() != 1 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: indices.rank(),
            });
        }
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank,
            });
        }
        let storage = {
            let s = self.read_storage()?;
            let i = indices.read_storage()?;
            B::index_select(&s, self.layout(), &i, indices.layout(), dim)?
        };
        Ok(self.contiguous_result(
            storage,
            self.shape().with_dim(dim, indices.elem_count()),
            self.dtype(),
            Op::IndexSelect {
                input: self.clone(),
                indices: indices.clone(),
                dim,
            },
        ))
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let storage = {
            let guard = self.read_storage()?;
            B::cast(&guard, self.layout(), dtype, self.device())?
        };
        Ok(self.contiguous_result(
            storage,
            self.shape().clone(),
            dtype,
            Op::ToDtype {
                input: self.clone(),
                src_dtype: self.dtype(),
            },
        ))
    }

    // Host access

    /// All elements in logical row-major order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let guard = self.read_storage()?;
        B::to_f64_vec(&guard, self.layout())
    }

    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        let data = self.to_f64_vec()?;
        data.first().copied().ok_or(Error::NotAScalar {
            shape: self.shape().clone(),
        })
    }

    // Autograd

    /// Gradients of this scalar with respect to every tensor in its history.
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }

    /// Same data, fresh id, no history.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }
}
