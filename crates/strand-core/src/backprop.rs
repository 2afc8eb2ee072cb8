// Backpropagation — reverse-mode automatic differentiation
//
//   1. Every op records its inputs, so a computed tensor carries a DAG.
//   2. backward() sorts that DAG topologically from a scalar root.
//   3. Starting from d(root)/d(root) = 1, each node hands gradients to its
//      inputs by the chain rule. A tensor used twice receives the sum.
//
// GRADIENT RULES:
//
//   Add / Sub:       grad_a += g,        grad_b += ±g
//   Mul:             grad_a += g * b,    grad_b += g * a
//   Div:             grad_a += g / b,    grad_b += -g * a / b²
//   Matmul:          grad_A += G @ Bᵀ,   grad_B += Aᵀ @ G
//   Broadcast:       sum g over the expanded dimensions
//   Reduce Sum/Mean: broadcast g back over the reduced dimensions
//   Reduce Max/Min:  route g to the elements that attained the extremum,
//                    shared equally between ties
//   Permute:         apply the inverse permutation
//   Narrow:          pad g with zeros back to the input size
//   Cat:             narrow g into per-input pieces
//   WhereCond:       route g by the mask; the mask gets nothing
//   IndexSelect:     scatter-add g into the selected rows
//
// VJP:
//
//   `vjp(f, primals)` is the functional form used by the layer crates: it
//   evaluates `f` on fresh leaf copies of the primals and returns a
//   `Pullback` that maps output cotangents to input cotangents. Pulling back
//   cotangents c through outputs y is the gradient of Σ sum(y_i ⊙ c_i) with
//   the cotangents held constant.

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Gradients for every tensor reached by a backward pass, keyed by id.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Add `grad` to whatever is already stored for `id`.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        let grad = match self.grads.remove(&id) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.grads.insert(id, grad);
        Ok(())
    }
}

/// Leaves first, root last.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    fn visit<B: Backend>(
        t: &Tensor<B>,
        visited: &mut HashSet<TensorId>,
        order: &mut Vec<Tensor<B>>,
    ) {
        if !visited.insert(t.id()) {
            return;
        }
        for input in t.op().inputs() {
            visit(input, visited, order);
        }
        order.push(t.clone());
    }

    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(root, &mut visited, &mut order);
    order
}

/// Gradients of a scalar `root` with respect to everything in its history.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(Error::msg(
            "backward() requires a scalar tensor (single element); reduce with sum_all() first",
        ));
    }
    if !root.dtype().is_float() {
        return Err(Error::msg(format!(
            "backward() requires a float tensor, got {}",
            root.dtype()
        )));
    }

    let topo = build_topo(root);
    let mut grads = GradStore::new();
    grads.grads.insert(root.id(), Tensor::ones_like(root)?);

    for tensor in topo.iter().rev() {
        let g = match grads.grads.get(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => grads.accumulate(input.id(), g)?,

            Op::Binary { lhs, rhs, op } => binary_grad(*op, &g, lhs, rhs, &mut grads)?,

            Op::Unary { input, op } => {
                let grad = unary_grad(*op, &g, input)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => {
                let grad = reduce_grad(*op, &g, tensor, input, dims, *keep_dim)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Matmul { lhs, rhs } => {
                grads.accumulate(lhs.id(), g.matmul(&rhs.t()?)?)?;
                grads.accumulate(rhs.id(), lhs.t()?.matmul(&g)?)?;
            }

            Op::Reshape { input, src_shape } => {
                grads.accumulate(input.id(), g.reshape(src_shape.clone())?)?;
            }

            Op::Permute { input, perm } => {
                let mut inverse = vec![0usize; perm.len()];
                for (i, &p) in perm.iter().enumerate() {
                    inverse[p] = i;
                }
                grads.accumulate(input.id(), g.permute(&inverse)?)?;
            }

            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => {
                let grad = narrow_grad(&g, input, *dim, *start, *len)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Broadcast { input, src_shape } => {
                grads.accumulate(input.id(), sum_to_shape(&g, src_shape)?)?;
            }

            Op::Affine { input, mul, .. } => {
                grads.accumulate(input.id(), g.affine(*mul, 0.0)?)?;
            }

            Op::Powf { input, exponent } => {
                let n = *exponent;
                let grad = g.mul(&input.powf(n - 1.0)?.affine(n, 0.0)?)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Cat { inputs, dim, sizes } => {
                let mut offset = 0usize;
                for (inp, &sz) in inputs.iter().zip(sizes.iter()) {
                    grads.accumulate(inp.id(), g.narrow(*dim, offset, sz)?)?;
                    offset += sz;
                }
            }

            Op::WhereCond {
                mask,
                on_true,
                on_false,
            } => {
                let zeros = Tensor::zeros_like(&g)?;
                grads.accumulate(on_true.id(), Tensor::where_cond(mask, &g, &zeros)?)?;
                grads.accumulate(on_false.id(), Tensor::where_cond(mask, &zeros, &g)?)?;
            }

            Op::IndexSelect {
                input,
                indices,
                dim,
            } => {
                let grad = index_select_grad(&g, input, indices, *dim)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::ToDtype { input, src_dtype } => {
                if src_dtype.is_float() {
                    grads.accumulate(input.id(), g.to_dtype(*src_dtype)?)?;
                }
            }
        }
    }

    Ok(grads)
}

fn binary_grad<B: Backend>(
    op: BinaryOp,
    g: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    // Operands were broadcast to the output shape before the op ran, so no
    // reduction is needed here; Op::Broadcast handles it further down.
    match op {
        BinaryOp::Add => {
            grads.accumulate(lhs.id(), g.clone())?;
            grads.accumulate(rhs.id(), g.clone())?;
        }
        BinaryOp::Sub => {
            grads.accumulate(lhs.id(), g.clone())?;
            grads.accumulate(rhs.id(), g.neg()?)?;
        }
        BinaryOp::Mul => {
            grads.accumulate(lhs.id(), g.mul(rhs)?)?;
            grads.accumulate(rhs.id(), g.mul(lhs)?)?;
        }
        BinaryOp::Div => {
            grads.accumulate(lhs.id(), g.div(rhs)?)?;
            let grad_rhs = g.neg()?.mul(lhs)?.div(&rhs.square()?)?;
            grads.accumulate(rhs.id(), grad_rhs)?;
        }
    }
    Ok(())
}

fn unary_grad<B: Backend>(op: UnaryOp, g: &Tensor<B>, input: &Tensor<B>) -> Result<Tensor<B>> {
    match op {
        UnaryOp::Neg => g.neg(),
        UnaryOp::Exp => g.mul(&input.exp()?),
        UnaryOp::Log => g.div(input),
        // d√x = 1 / (2√x)
        UnaryOp::Sqrt => g.div(&input.sqrt()?.affine(2.0, 0.0)?),
        UnaryOp::Square => g.mul(&input.affine(2.0, 0.0)?),
        UnaryOp::Relu => {
            let zero = Tensor::zeros((), input.dtype(), input.device())?;
            let positive = input.gt(&zero)?.to_dtype(input.dtype())?;
            g.mul(&positive)
        }
        // σ' = σ(1 - σ)
        UnaryOp::Sigmoid => {
            let s = input.sigmoid()?;
            g.mul(&s.mul(&s.affine(-1.0, 1.0)?)?)
        }
        // tanh' = 1 - tanh²
        UnaryOp::Tanh => {
            let t = input.tanh()?;
            g.mul(&t.square()?.affine(-1.0, 1.0)?)
        }
    }
}

fn reduce_grad<B: Backend>(
    op: ReduceOp,
    g: &Tensor<B>,
    output: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    keep_dim: bool,
) -> Result<Tensor<B>> {
    // Shape of the reduction with every reduced dim kept as size 1.
    let kept: Vec<usize> = input
        .dims()
        .iter()
        .enumerate()
        .map(|(i, &d)| if dims.contains(&i) { 1 } else { d })
        .collect();
    let kept = Shape::new(kept);
    let g_kept = if keep_dim {
        g.clone()
    } else {
        g.reshape(kept.clone())?
    };

    match op {
        ReduceOp::Sum => g_kept.broadcast_as(input.shape()),
        ReduceOp::Mean => {
            let n: usize = dims.iter().map(|&d| input.dims()[d]).product();
            g_kept
                .affine(1.0 / n.max(1) as f64, 0.0)?
                .broadcast_as(input.shape())
        }
        ReduceOp::Max | ReduceOp::Min => {
            let extremum = if keep_dim {
                output.detach()
            } else {
                output.detach().reshape(kept)?
            };
            let hits = input
                .detach()
                .eq(&extremum)?
                .to_dtype(input.dtype())?;
            let mut count = hits.clone();
            for &d in dims.iter().rev() {
                count = count.sum(d, true)?;
            }
            hits.div(&count)?.mul(&g_kept)
        }
    }
}

/// Sum `g` down to `shape`, undoing a NumPy-style broadcast.
fn sum_to_shape<B: Backend>(g: &Tensor<B>, shape: &Shape) -> Result<Tensor<B>> {
    let g_dims = g.dims().to_vec();
    let lead = g_dims.len() - shape.rank();
    let mut out = g.clone();
    for d in (0..g_dims.len()).rev() {
        let expanded = d < lead || (shape.dims()[d - lead] == 1 && g_dims[d] != 1);
        if expanded {
            out = out.sum(d, true)?;
        }
    }
    out.reshape(shape.clone())
}

fn narrow_grad<B: Backend>(
    g: &Tensor<B>,
    input: &Tensor<B>,
    dim: usize,
    start: usize,
    len: usize,
) -> Result<Tensor<B>> {
    let full = input.dims()[dim];
    let mut pieces = Vec::with_capacity(3);
    if start > 0 {
        pieces.push(Tensor::zeros(
            g.shape().with_dim(dim, start),
            g.dtype(),
            g.device(),
        )?);
    }
    pieces.push(g.clone());
    let after = full - start - len;
    if after > 0 {
        pieces.push(Tensor::zeros(
            g.shape().with_dim(dim, after),
            g.dtype(),
            g.device(),
        )?);
    }
    Tensor::cat(&pieces, dim)
}

fn index_select_grad<B: Backend>(
    g: &Tensor<B>,
    input: &Tensor<B>,
    indices: &Tensor<B>,
    dim: usize,
) -> Result<Tensor<B>> {
    let grad_data = g.to_f64_vec()?;
    let index_data = indices.to_f64_vec()?;
    let in_strides = input.shape().stride_contiguous();
    let out_strides = g.shape().stride_contiguous();
    let rank = input.rank();

    let mut acc = vec![0.0f64; input.elem_count()];
    for (flat, &v) in grad_data.iter().enumerate() {
        let mut rem = flat;
        let mut target = 0usize;
        for d in 0..rank {
            let coord = rem / out_strides[d];
            rem %= out_strides[d];
            let coord = if d == dim {
                index_data[coord] as usize
            } else {
                coord
            };
            target += coord * in_strides[d];
        }
        acc[target] += v;
    }
    Tensor::from_f64_slice(&acc, input.shape().clone(), g.dtype(), g.device())
}

// VJP

/// Evaluate `f` at `primals` and return its outputs plus a pullback.
///
/// The primals are detached first, so the recorded graph starts at them and
/// nothing upstream of the caller is retained.
pub fn vjp<B, F>(f: F, primals: &[Tensor<B>]) -> Result<(Vec<Tensor<B>>, Pullback<B>)>
where
    B: Backend,
    F: FnOnce(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
{
    let leaves: Vec<Tensor<B>> = primals.iter().map(|p| p.detach()).collect();
    let outputs = f(&leaves)?;
    let pullback = Pullback {
        primals: leaves,
        outputs: outputs.clone(),
    };
    Ok((outputs, pullback))
}

/// Maps output cotangents to cotangents of the primals handed to [`vjp`].
pub struct Pullback<B: Backend> {
    primals: Vec<Tensor<B>>,
    outputs: Vec<Tensor<B>>,
}

impl<B: Backend> Pullback<B> {
    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// One cotangent per output, each shaped like its output. Returns one
    /// cotangent per primal; primals the outputs do not depend on (and
    /// integer primals) get zeros. Results are detached.
    pub fn apply(&self, cotangents: &[Tensor<B>]) -> Result<Vec<Tensor<B>>> {
        if cotangents.len() != self.outputs.len() {
            return Err(Error::ArityMismatch {
                layer: "pullback".to_string(),
                expected: self.outputs.len(),
                got: cotangents.len(),
            });
        }

        let mut objective: Option<Tensor<B>> = None;
        for (out, ct) in self.outputs.iter().zip(cotangents.iter()) {
            if !out.dtype().is_float() {
                continue;
            }
            if out.shape() != ct.shape() {
                return Err(Error::ShapeMismatch {
                    expected: out.shape().clone(),
                    got: ct.shape().clone(),
                });
            }
            let ct = ct.detach().to_dtype(out.dtype())?;
            let term = out.mul(&ct)?.sum_all()?.to_dtype(DType::F64)?;
            objective = Some(match objective {
                Some(acc) => acc.add(&term)?,
                None => term,
            });
        }

        let grads = match objective {
            Some(obj) => Some(obj.backward()?),
            None => None,
        };
        self.primals
            .iter()
            .map(|p| match grads.as_ref().and_then(|g| g.get(p)) {
                Some(g) if p.dtype().is_float() => Ok(g.detach()),
                _ => Tensor::zeros_like(p),
            })
            .collect()
    }
}
