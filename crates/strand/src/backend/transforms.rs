// Function transforms and device helpers.
//
//   jit              identity: there is no compiler to hand `f` to
//   grad / vjp       tape autodiff; Unsupported under Plain
//   vmap             run `f` per slice of the leading axis, stack the results
//   pmap             like vmap, slices on the rayon pool; Unsupported under Plain
//   psum             sum of per-shard values
//   eval_on_shapes   output signatures of `f` for given input signatures
//
// There is one CPU device. reshape_by_device / combine_devices move between
// a flat batch and [n_devices, batch / n_devices, ...].

use rayon::prelude::*;
use strand_core::backend::Backend;
use strand_core::{Error, Pullback, Result, ShapeDtype, Tensor};

use super::{current_provider, Provider};

/// A transformed function over a list of tensors.
pub type TensorFn<'a, B> = Box<dyn Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>> + Send + Sync + 'a>;

/// The shared leading-axis size of `inputs`.
fn leading_dim<B: Backend>(what: &str, inputs: &[Tensor<B>]) -> Result<usize> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::msg(format!("{}: no inputs to map over", what)))?;
    let n = first.dim(0)?;
    for x in inputs {
        if x.dim(0)? != n {
            return Err(Error::msg(format!(
                "{}: inputs disagree on the leading axis ({} vs {})",
                what,
                n,
                x.dim(0)?
            )));
        }
    }
    Ok(n)
}

fn slices<B: Backend>(inputs: &[Tensor<B>], i: usize) -> Result<Vec<Tensor<B>>> {
    inputs.iter().map(|x| x.narrow(0, i, 1)?.squeeze(0)).collect()
}

/// Stack per-slice outputs back along a new leading axis.
fn stack_outputs<B: Backend>(what: &str, per_slice: Vec<Vec<Tensor<B>>>) -> Result<Vec<Tensor<B>>> {
    let n_out = per_slice.first().map_or(0, Vec::len);
    let mut columns: Vec<Vec<Tensor<B>>> = vec![Vec::with_capacity(per_slice.len()); n_out];
    for outs in per_slice {
        if outs.len() != n_out {
            return Err(Error::msg(format!(
                "{}: slices returned {} and {} outputs",
                what,
                n_out,
                outs.len()
            )));
        }
        for (column, out) in columns.iter_mut().zip(outs) {
            column.push(out);
        }
    }
    columns.iter().map(|c| Tensor::stack(c, 0)).collect()
}

impl Provider {
    pub fn jit<F>(&self, f: F) -> F {
        f
    }

    /// Gradient of a scalar-valued `f` with respect to each primal.
    pub fn grad<B, F>(&self, f: F, primals: &[Tensor<B>]) -> Result<Vec<Tensor<B>>>
    where
        B: Backend,
        F: FnOnce(&[Tensor<B>]) -> Result<Tensor<B>>,
    {
        if !self.supports_grad() {
            return Err(self.unsupported("grad"));
        }
        let (outs, pullback) = strand_core::vjp(|xs: &[Tensor<B>]| Ok(vec![f(xs)?]), primals)?;
        let out = outs.first().ok_or_else(|| Error::msg("grad: function returned nothing"))?;
        if out.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: out.shape().clone(),
            });
        }
        pullback.apply(&[Tensor::ones_like(out)?])
    }

    pub fn vjp<B, F>(&self, f: F, primals: &[Tensor<B>]) -> Result<(Vec<Tensor<B>>, Pullback<B>)>
    where
        B: Backend,
        F: FnOnce(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
    {
        if !self.supports_grad() {
            return Err(self.unsupported("vjp"));
        }
        strand_core::vjp(f, primals)
    }

    /// Apply `f` to each slice along the leading axis of every input.
    pub fn vmap<B, F>(&self, f: F, inputs: &[Tensor<B>]) -> Result<Vec<Tensor<B>>>
    where
        B: Backend,
        F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
    {
        let n = leading_dim("vmap", inputs)?;
        let per_slice = (0..n)
            .map(|i| f(&slices(inputs, i)?))
            .collect::<Result<Vec<_>>>()?;
        let outs = stack_outputs("vmap", per_slice)?;
        Ok(outs.into_iter().map(|t| self.finish(t)).collect())
    }

    /// [`Provider::vmap`] with the slices run in parallel.
    ///
    /// Each worker runs with this provider active.
    pub fn pmap<B, F>(&self, f: F, inputs: &[Tensor<B>]) -> Result<Vec<Tensor<B>>>
    where
        B: Backend,
        F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>> + Sync,
    {
        if !self.supports_grad() {
            return Err(self.unsupported("pmap"));
        }
        let n = leading_dim("pmap", inputs)?;
        let shards = (0..n).map(|i| slices(inputs, i)).collect::<Result<Vec<_>>>()?;
        let provider = *self;
        let per_shard = shards
            .par_iter()
            .map(|shard| {
                let _guard = provider.enter();
                f(shard)
            })
            .collect::<Result<Vec<_>>>()?;
        stack_outputs("pmap", per_shard)
    }

    /// Sum of per-shard values.
    pub fn psum<B: Backend>(&self, shards: &[Tensor<B>]) -> Result<Tensor<B>> {
        let (first, rest) = shards
            .split_first()
            .ok_or_else(|| Error::msg("psum: no shards"))?;
        let total = rest.iter().try_fold(first.clone(), |acc, x| acc.add(x))?;
        Ok(self.finish(total))
    }

    pub fn eval_on_shapes<B, F>(&self, f: F, sigs: &[ShapeDtype], device: &B::Device) -> Result<Vec<ShapeDtype>>
    where
        B: Backend,
        F: FnOnce(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
    {
        strand_core::eval_on_shapes(f, sigs, device)
    }

    pub fn device_count(&self) -> usize {
        1
    }

    /// `f` itself on one device, `pmap(f)` over the leading axis otherwise.
    pub fn accelerate<'a, B, F>(&self, f: F, n_devices: usize) -> TensorFn<'a, B>
    where
        B: Backend,
        F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>> + Send + Sync + 'a,
    {
        if n_devices <= 1 {
            return Box::new(self.jit(f));
        }
        let provider = *self;
        Box::new(move |xs: &[Tensor<B>]| provider.pmap(&f, xs))
    }
}

/// [`Provider::jit`] on the current provider.
pub fn jit<F>(f: F) -> F {
    current_provider().jit(f)
}

/// [`Provider::grad`] on the current provider.
pub fn grad<B, F>(f: F, primals: &[Tensor<B>]) -> Result<Vec<Tensor<B>>>
where
    B: Backend,
    F: FnOnce(&[Tensor<B>]) -> Result<Tensor<B>>,
{
    current_provider().grad(f, primals)
}

/// [`Provider::vjp`] on the current provider.
pub fn vjp<B, F>(f: F, primals: &[Tensor<B>]) -> Result<(Vec<Tensor<B>>, Pullback<B>)>
where
    B: Backend,
    F: FnOnce(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
{
    current_provider().vjp(f, primals)
}

/// [`Provider::vmap`] on the current provider.
pub fn vmap<B, F>(f: F, inputs: &[Tensor<B>]) -> Result<Vec<Tensor<B>>>
where
    B: Backend,
    F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
{
    current_provider().vmap(f, inputs)
}

/// [`Provider::pmap`] on the current provider.
pub fn pmap<B, F>(f: F, inputs: &[Tensor<B>]) -> Result<Vec<Tensor<B>>>
where
    B: Backend,
    F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>> + Sync,
{
    current_provider().pmap(f, inputs)
}

/// [`Provider::psum`] on the current provider.
pub fn psum<B: Backend>(shards: &[Tensor<B>]) -> Result<Tensor<B>> {
    current_provider().psum(shards)
}

/// [`Provider::eval_on_shapes`] on the current provider.
pub fn eval_on_shapes<B, F>(f: F, sigs: &[ShapeDtype], device: &B::Device) -> Result<Vec<ShapeDtype>>
where
    B: Backend,
    F: FnOnce(&[Tensor<B>]) -> Result<Vec<Tensor<B>>>,
{
    current_provider().eval_on_shapes(f, sigs, device)
}

/// [`Provider::device_count`] on the current provider.
pub fn device_count() -> usize {
    current_provider().device_count()
}

/// [`Provider::accelerate`] on the current provider.
pub fn accelerate<'a, B, F>(f: F, n_devices: usize) -> TensorFn<'a, B>
where
    B: Backend,
    F: Fn(&[Tensor<B>]) -> Result<Vec<Tensor<B>>> + Send + Sync + 'a,
{
    current_provider().accelerate(f, n_devices)
}

/// `[batch, ...] -> [n_devices, batch / n_devices, ...]`.
pub fn reshape_by_device<B: Backend>(x: &Tensor<B>, n_devices: usize) -> Result<Tensor<B>> {
    let dims = x.dims();
    let batch = x.dim(0)?;
    if n_devices == 0 || batch % n_devices != 0 {
        return Err(Error::not_divisible("reshape_by_device: batch size", batch, n_devices));
    }
    let mut new_dims = vec![n_devices, batch / n_devices];
    new_dims.extend_from_slice(&dims[1..]);
    x.reshape(new_dims)
}

/// Undo [`reshape_by_device`]: fold the first two axes into one batch axis.
/// Tensors of rank below 2 are returned unchanged.
pub fn combine_devices<B: Backend>(xs: &[Tensor<B>]) -> Result<Vec<Tensor<B>>> {
    xs.iter()
        .map(|x| {
            if x.rank() < 2 {
                return Ok(x.clone());
            }
            let dims = x.dims();
            let mut new_dims = vec![dims[0] * dims[1]];
            new_dims.extend_from_slice(&dims[2..]);
            x.reshape(new_dims)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::DType;
    use strand_cpu::{CpuDevice, CpuTensor};

    fn t(data: &[f64], shape: (usize, usize)) -> Result<CpuTensor> {
        CpuTensor::from_f64_slice(data, shape, DType::F64, &CpuDevice)
    }

    #[test]
    fn test_grad_of_sum_of_squares() -> Result<()> {
        let x = t(&[1.0, -2.0, 3.0, 0.5], (2, 2))?;
        let g = Provider::Autograd.grad(|xs: &[CpuTensor]| xs[0].square()?.sum_all(), &[x])?;
        assert_eq!(g[0].to_f64_vec()?, vec![2.0, -4.0, 6.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_grad_requires_scalar() -> Result<()> {
        let x = t(&[1.0, 2.0], (1, 2))?;
        let err = Provider::Autograd.grad(|xs: &[CpuTensor]| Ok(xs[0].clone()), &[x]);
        assert!(matches!(err, Err(Error::NotAScalar { .. })));
        Ok(())
    }

    #[test]
    fn test_plain_refuses_gradients() -> Result<()> {
        let x = t(&[1.0, 2.0], (1, 2))?;
        let grad = Provider::Plain.grad(|xs: &[CpuTensor]| xs[0].sum_all(), std::slice::from_ref(&x));
        assert!(matches!(grad, Err(Error::Unsupported { .. })));
        let vjp = Provider::Plain.vjp(|xs: &[CpuTensor]| Ok(xs.to_vec()), std::slice::from_ref(&x));
        assert!(matches!(vjp, Err(Error::Unsupported { .. })));
        let pmap = Provider::Plain.pmap(|xs: &[CpuTensor]| Ok(xs.to_vec()), &[x]);
        assert!(matches!(pmap, Err(Error::Unsupported { .. })));
        Ok(())
    }

    #[test]
    fn test_vmap_and_pmap_agree() -> Result<()> {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2))?;
        let row_sum = |xs: &[CpuTensor]| -> Result<Vec<CpuTensor>> { Ok(vec![xs[0].sum_all()?]) };
        let a = Provider::Autograd.vmap(row_sum, std::slice::from_ref(&x))?;
        let b = Provider::Autograd.pmap(row_sum, std::slice::from_ref(&x))?;
        assert_eq!(a[0].to_f64_vec()?, vec![3.0, 7.0, 11.0]);
        assert_eq!(a[0].to_f64_vec()?, b[0].to_f64_vec()?);
        Ok(())
    }

    #[test]
    fn test_pmap_workers_see_the_provider() -> Result<()> {
        let x = t(&[1.0, 2.0, 3.0, 4.0], (4, 1))?;
        let out = Provider::Autograd.pmap(
            |xs: &[CpuTensor]| {
                assert_eq!(current_provider(), Provider::Autograd);
                Ok(xs.to_vec())
            },
            &[x],
        )?;
        assert_eq!(out[0].dims(), &[4, 1]);
        Ok(())
    }

    #[test]
    fn test_psum() -> Result<()> {
        let shards = [t(&[1.0, 2.0], (1, 2))?, t(&[3.0, 4.0], (1, 2))?];
        assert_eq!(Provider::Plain.psum(&shards)?.to_f64_vec()?, vec![4.0, 6.0]);
        assert!(Provider::Plain.psum::<strand_cpu::CpuBackend>(&[]).is_err());
        Ok(())
    }

    #[test]
    fn test_device_reshapes() -> Result<()> {
        let x = CpuTensor::zeros((6, 5, 2), DType::F32, &CpuDevice)?;
        let by_device = reshape_by_device(&x, 3)?;
        assert_eq!(by_device.dims(), &[3, 2, 5, 2]);
        let back = combine_devices(&[by_device])?;
        assert_eq!(back[0].dims(), &[6, 5, 2]);
        assert!(matches!(reshape_by_device(&x, 4), Err(Error::NotDivisible { .. })));
        Ok(())
    }

    #[test]
    fn test_accelerate() -> Result<()> {
        let x = t(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
        let double = |xs: &[CpuTensor]| -> Result<Vec<CpuTensor>> { Ok(vec![xs[0].mul_scalar(2.0)?]) };
        let one = Provider::Autograd.accelerate(double, 1);
        let two = Provider::Autograd.accelerate(double, 2);
        let a = one(std::slice::from_ref(&x))?;
        let b = two(std::slice::from_ref(&x))?;
        assert_eq!(a[0].to_f64_vec()?, vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(a[0].to_f64_vec()?, b[0].to_f64_vec()?);
        assert_eq!(device_count(), 1);
        Ok(())
    }
}
