// Stack primitives — parameter-free layers that rearrange the data stack
//
//   NoOp         x       -> x
//   Dup          x       -> x, x
//   Swap         a, b    -> b, a
//   Drop         x       -> (nothing)
//   Add          a, b    -> a + b
//   SubtractTop  a, b    -> b - a
//   Concatenate  x1..xn  -> cat(x1..xn, axis)
//   Split        x       -> x1..xn along axis

use strand_core::backend::Backend;
use strand_core::{Result, RngKey, Tensor};

use crate::layer::{check_arity, single, Layer};
use crate::tree::Tree;

type Forward<B> = Result<(Vec<Tensor<B>>, Tree<B>)>;

/// Identity on one input.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOp;

impl<B: Backend> Layer<B> for NoOp {
    fn name(&self) -> &str {
        "NoOp"
    }

    fn forward(&self, inputs: &[Tensor<B>], _: &Tree<B>, state: &Tree<B>, _: Option<RngKey>) -> Forward<B> {
        Ok((vec![single(Layer::<B>::name(self), inputs)?.clone()], state.clone()))
    }
}

/// Duplicates the top of the stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dup;

impl<B: Backend> Layer<B> for Dup {
    fn name(&self) -> &str {
        "Dup"
    }

    fn n_out(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Tensor<B>], _: &Tree<B>, state: &Tree<B>, _: Option<RngKey>) -> Forward<B> {
        let x = single(Layer::<B>::name(self), inputs)?;
        Ok((vec![x.clone(), x.clone()], state.clone()))
    }
}

/// Swaps the top two stack entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct Swap;

impl<B: Backend> Layer<B> for Swap {
    fn name(&self) -> &str {
        "Swap"
    }

    fn n_in(&self) -> usize {
        2
    }

    fn n_out(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Tensor<B>], _: &Tree<B>, state: &Tree<B>, _: Option<RngKey>) -> Forward<B> {
        check_arity(Layer::<B>::name(self), 2, inputs.len())?;
        Ok((vec![inputs[1].clone(), inputs[0].clone()], state.clone()))
    }
}

/// Discards the top of the stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct Drop;

impl<B: Backend> Layer<B> for Drop {
    fn name(&self) -> &str {
        "Drop"
    }

    fn n_out(&self) -> usize {
        0
    }

    fn forward(&self, inputs: &[Tensor<B>], _: &Tree<B>, state: &Tree<B>, _: Option<RngKey>) -> Forward<B> {
        single(Layer::<B>::name(self), inputs)?;
        Ok((Vec::new(), state.clone()))
    }
}

/// `(a, b) -> a + b`, broadcasting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Add;

impl<B: Backend> Layer<B> for Add {
    fn name(&self) -> &str {
        "Add"
    }

    fn n_in(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Tensor<B>], _: &Tree<B>, state: &Tree<B>, _: Option<RngKey>) -> Forward<B> {
        check_arity(Layer::<B>::name(self), 2, inputs.len())?;
        Ok((vec![inputs[0].add(&inputs[1])?], state.clone()))
    }
}

/// `(a, b) -> b - a`. Undoes `Add` when `a` is recomputed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubtractTop;

impl<B: Backend> Layer<B> for SubtractTop {
    fn name(&self) -> &str {
        "SubtractTop"
    }

    fn n_in(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[Tensor<B>], _: &Tree<B>, state: &Tree<B>, _: Option<RngKey>) -> Forward<B> {
        check_arity(Layer::<B>::name(self), 2, inputs.len())?;
        Ok((vec![inputs[1].sub(&inputs[0])?], state.clone()))
    }
}

/// Concatenates `n_items` inputs along `axis` (negative axes count from the
/// end).
#[derive(Debug, Clone, Copy)]
pub struct Concatenate {
    n_items: usize,
    axis: i64,
}

impl Concatenate {
    pub fn new(n_items: usize, axis: i64) -> Self {
        Concatenate { n_items, axis }
    }
}

impl Default for Concatenate {
    fn default() -> Self {
        Concatenate::new(2, -1)
    }
}

impl<B: Backend> Layer<B> for Concatenate {
    fn name(&self) -> &str {
        "Concatenate"
    }

    fn n_in(&self) -> usize {
        self.n_items
    }

    fn forward(&self, inputs: &[Tensor<B>], _: &Tree<B>, state: &Tree<B>, _: Option<RngKey>) -> Forward<B> {
        check_arity(Layer::<B>::name(self), self.n_items, inputs.len())?;
        let axis = inputs[0].shape().normalize_axis(self.axis)?;
        Ok((vec![Tensor::cat(inputs, axis)?], state.clone()))
    }
}

/// Splits one input into `n_sections` equal parts along `axis`.
#[derive(Debug, Clone, Copy)]
pub struct Split {
    n_sections: usize,
    axis: i64,
}

impl Split {
    pub fn new(n_sections: usize, axis: i64) -> Self {
        Split { n_sections, axis }
    }
}

impl Default for Split {
    fn default() -> Self {
        Split::new(2, -1)
    }
}

impl<B: Backend> Layer<B> for Split {
    fn name(&self) -> &str {
        "Split"
    }

    fn n_out(&self) -> usize {
        self.n_sections
    }

    fn forward(&self, inputs: &[Tensor<B>], _: &Tree<B>, state: &Tree<B>, _: Option<RngKey>) -> Forward<B> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let axis = x.shape().normalize_axis(self.axis)?;
        Ok((x.chunk(self.n_sections, axis)?, state.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::DType;
    use strand_cpu::{CpuDevice, CpuTensor};

    fn t(data: &[f64], shape: &[usize]) -> Result<CpuTensor> {
        CpuTensor::from_f64_slice(data, shape.to_vec(), DType::F64, &CpuDevice)
    }

    fn run<L: Layer<strand_cpu::CpuBackend>>(layer: &L, xs: &[CpuTensor]) -> Result<Vec<CpuTensor>> {
        Ok(layer.forward(xs, &Tree::empty(), &Tree::empty(), None)?.0)
    }

    #[test]
    fn test_stack_shuffles() -> Result<()> {
        let a = t(&[1.0], &[1])?;
        let b = t(&[2.0], &[1])?;
        assert_eq!(run(&Dup, &[a.clone()])?.len(), 2);
        let swapped = run(&Swap, &[a.clone(), b.clone()])?;
        assert_eq!(swapped[0].to_f64_vec()?, vec![2.0]);
        assert!(run(&Drop, &[a.clone()])?.is_empty());
        assert!(run(&Swap, &[a]).is_err());
        Ok(())
    }

    #[test]
    fn test_subtract_top_undoes_add() -> Result<()> {
        let a = t(&[1.5, -2.0], &[2])?;
        let b = t(&[4.0, 0.5], &[2])?;
        let sum = run(&Add, &[a.clone(), b.clone()])?;
        let back = run(&SubtractTop, &[b, sum[0].clone()])?;
        assert_eq!(back[0].to_f64_vec()?, a.to_f64_vec()?);
        Ok(())
    }

    #[test]
    fn test_concatenate_then_split() -> Result<()> {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2])?;
        let b = t(&[5.0, 6.0, 7.0, 8.0], &[2, 2])?;
        let joined = run(&Concatenate::default(), &[a, b])?;
        assert_eq!(joined[0].dims(), &[2, 4]);
        let parts = run(&Split::new(2, -1), &joined)?;
        assert_eq!(parts[1].to_f64_vec()?, vec![5.0, 6.0, 7.0, 8.0]);
        assert!(run(&Split::new(3, -1), &joined).is_err());
        Ok(())
    }
}
