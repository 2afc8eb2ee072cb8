// Reversible layers — recompute activations instead of storing them
//
// A reversible layer maps (x1, x2) to (y1, y2) such that the inputs can be
// rebuilt from the outputs and params alone. The building block is the half
// residual:
//
//   y1 = x1 + f(x2)          x1 = y1 - f(y2)
//   y2 = x2                  x2 = y2
//
// Stacking half residuals with swaps in between gives a RevNet, whose
// backward pass needs only the final outputs: each layer reconstructs its
// inputs from its outputs on the way down.
//
// FUSED RECONSTRUCTION AND GRADIENT:
//
// Both the reconstruction and the gradient need f(x2). `reverse_and_grad`
// computes it once, inside a vjp of
//
//   compute_residual: (y1, x2) -> (f(x2), y1, x2)
//
// evaluated at the outputs. The cotangent of Add on (f(x2), x1) is
// (ct_y1, ct_y1), so pulling (ct_y1, ct_y1, ct_y2) back through that vjp
// gives the input cotangents and the params' cotangents in one pass. The
// same stack then yields x1 = y1 - f(x2) through SubtractTop.
//
// The attention variant splits f into pre_attention, a causal attention
// kernel and post_attention:
//
//   1. vjp of pre_attention at the outputs: (y1, x2) -> (q, k, v, y1, x2)
//   2. input cotangent of post_attention, evaluated at stand-in inputs
//   3. attention.forward_and_backward: recompute the attention output and
//      pull its cotangent back to q, k, v
//   4. pull that back through pre_attention
//   5. forward post_attention on the real stack and take its param vjp
//   6. SubtractTop
//
// Step 2 runs before the attention output exists, so it uses the wrong
// inputs. The result is exact only when post_attention is affine in its
// input. This is not checked at runtime; callers must guarantee it.
//
// The add/subtract and attention sublayers have no params. That is asserted:
// a violation is a construction bug, not a recoverable error.

use strand_core::backend::Backend;
use strand_core::{vjp, Result, RngKey, ShapeDtype, Tensor};

use crate::combinators::{
    push_onto, serial_arity, serial_backprop, serial_backward, serial_forward, serial_init, split_stack, Parallel,
    Serial,
};
use crate::layer::{check_arity, split_rng, Backprop, FusedAttention, Layer, LayerInit, ReverseGrad, ReversibleLayer};
use crate::primitives::{Add, Dup, NoOp, SubtractTop, Swap};
use crate::tree::Tree;

fn detach_all<B: Backend>(xs: &[Tensor<B>]) -> Vec<Tensor<B>> {
    xs.iter().map(Tensor::detach).collect()
}

/// `(x1, x2) -> (x2, x1, x2)`, then `layers` applied to the top.
fn residual_stack<B: Backend>(layers: Box<dyn Layer<B>>) -> Serial<B> {
    Serial::new(vec![
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(Dup)])),
        Box::new(Swap),
        Box::new(Parallel::new(vec![layers, Box::new(NoOp), Box::new(NoOp)])),
    ])
}

// ReversibleSwap

/// Swaps the two streams. Its own inverse.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReversibleSwap;

impl<B: Backend> Layer<B> for ReversibleSwap {
    fn name(&self) -> &str {
        "ReversibleSwap"
    }

    fn n_in(&self) -> usize {
        2
    }

    fn n_out(&self) -> usize {
        2
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        Swap.forward(inputs, params, state, rng)
    }

    fn as_reversible(&self) -> Option<&dyn ReversibleLayer<B>> {
        Some(self)
    }
}

impl<B: Backend> ReversibleLayer<B> for ReversibleSwap {
    fn reverse(
        &self,
        outputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<Vec<Tensor<B>>> {
        Ok(Swap.forward(outputs, params, state, rng)?.0)
    }

    fn reverse_and_grad(
        &self,
        outputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<ReverseGrad<B>> {
        Ok(ReverseGrad {
            inputs: self.reverse(outputs, params, state, rng)?,
            input_cts: self.reverse(output_cts, params, state, rng)?,
            param_cts: Tree::empty(),
        })
    }
}

// ReversibleHalfResidual

/// `(x1, x2) -> (x1 + f(x2), x2)` where f is `Serial(residual_layers)`, a
/// 1 -> 1 function.
pub struct ReversibleHalfResidual<B: Backend> {
    compute_residual: Serial<B>,
    add_top: Parallel<B>,
    subtract_top: Parallel<B>,
}

impl<B: Backend> ReversibleHalfResidual<B> {
    pub fn new(residual_layers: Vec<Box<dyn Layer<B>>>) -> Self {
        ReversibleHalfResidual {
            compute_residual: residual_stack(Box::new(Serial::new(residual_layers))),
            add_top: Parallel::new(vec![Box::new(Add), Box::new(NoOp)]),
            subtract_top: Parallel::new(vec![Box::new(SubtractTop), Box::new(NoOp)]),
        }
    }

    fn layers(&self) -> [&dyn Layer<B>; 2] {
        [&self.compute_residual, &self.add_top]
    }

    fn reverse_layers(&self) -> [&dyn Layer<B>; 2] {
        [&self.compute_residual, &self.subtract_top]
    }
}

impl<B: Backend> Layer<B> for ReversibleHalfResidual<B> {
    fn name(&self) -> &str {
        "ReversibleHalfResidual"
    }

    fn n_in(&self) -> usize {
        2
    }

    fn n_out(&self) -> usize {
        2
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(self.name(), 2, inputs.len())?;
        serial_forward(self.name(), &self.layers(), inputs, params, state, rng)
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), 2, input_sig.len())?;
        serial_init(self.name(), &self.layers(), input_sig, rng, device)
    }

    fn as_reversible(&self) -> Option<&dyn ReversibleLayer<B>> {
        Some(self)
    }
}

impl<B: Backend> ReversibleLayer<B> for ReversibleHalfResidual<B> {
    fn reverse(
        &self,
        outputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<Vec<Tensor<B>>> {
        check_arity(self.name(), 2, outputs.len())?;
        Ok(serial_forward(self.name(), &self.reverse_layers(), outputs, params, state, rng)?.0)
    }

    fn reverse_and_grad(
        &self,
        outputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<ReverseGrad<B>> {
        check_arity(self.name(), 2, outputs.len())?;
        check_arity(self.name(), 2, output_cts.len())?;
        let p = params.children(self.name(), 2)?;
        let s = state.children(self.name(), 2)?;
        let rngs = split_rng(rng, 2);

        let n = outputs.len();
        let mut primals = outputs.to_vec();
        primals.extend(p[0].leaves());
        let (stack, pullback) = vjp(
            |xs: &[Tensor<B>]| {
                let p0 = p[0].unflatten_like(&xs[n..])?;
                Ok(self.compute_residual.forward(&xs[..n], &p0, &s[0], rngs[0])?.0)
            },
            &primals,
        )?;

        // Add hands ct_y1 to both the residual and x1.
        let stack_cts = [output_cts[0].clone(), output_cts[0].clone(), output_cts[1].clone()];
        let mut input_cts = pullback.apply(&stack_cts)?;
        let residual_cts = p[0].unflatten_like(&input_cts.split_off(n))?;

        let (inputs, _) = self.subtract_top.forward(&detach_all(&stack), &p[1], &s[1], rngs[1])?;
        assert!(
            p[1].leaves().is_empty(),
            "ReversibleHalfResidual: add/subtract sublayer must have no params"
        );

        Ok(ReverseGrad {
            inputs,
            input_cts,
            param_cts: Tree::Node(vec![residual_cts, p[1].clone()]),
        })
    }
}

// Attention

/// `Parallel(attention, NoOp, NoOp)` over `(q, k, v, y1, x2)`, with the
/// attention kernel's fused forward-and-backward exposed.
pub struct ApplyAttentionWrapper<B: Backend> {
    attention: Box<dyn FusedAttention<B>>,
}

impl<B: Backend> ApplyAttentionWrapper<B> {
    pub fn new(attention: Box<dyn FusedAttention<B>>) -> Self {
        ApplyAttentionWrapper { attention }
    }

    fn n_attention_in(&self) -> usize {
        self.attention.n_in()
    }

    /// Recompute the outputs and pull `output_cts` back to the inputs.
    pub fn forward_and_backward(
        &self,
        inputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Vec<Tensor<B>>)> {
        check_arity(self.name(), self.n_in(), inputs.len())?;
        check_arity(self.name(), self.n_out(), output_cts.len())?;
        let rngs = split_rng(rng, 3);
        let k = self.n_attention_in();
        let (out, qkv_cts) = self.attention.forward_and_backward(&inputs[..k], &output_cts[0], rngs[0])?;
        Ok((push_onto(vec![out], &inputs[k..]), push_onto(qkv_cts, &output_cts[1..])))
    }
}

impl<B: Backend> Layer<B> for ApplyAttentionWrapper<B> {
    fn name(&self) -> &str {
        "ApplyAttentionWrapper"
    }

    fn n_in(&self) -> usize {
        self.n_attention_in() + 2
    }

    fn n_out(&self) -> usize {
        3
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(self.name(), self.n_in(), inputs.len())?;
        let p = params.children(self.name(), 3)?;
        let s = state.children(self.name(), 3)?;
        let rngs = split_rng(rng, 3);
        let k = self.n_attention_in();
        let (out, st) = self.attention.forward(&inputs[..k], &p[0], &s[0], rngs[0])?;
        let state = Tree::Node(vec![st, s[1].clone(), s[2].clone()]);
        Ok((push_onto(out, &inputs[k..]), state))
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), self.n_in(), input_sig.len())?;
        let keys = rng.split(3);
        let k = self.n_attention_in();
        let init = self.attention.init(&input_sig[..k], keys[0], device)?;
        Ok(LayerInit {
            params: Tree::Node(vec![init.params, Tree::empty(), Tree::empty()]),
            state: Tree::Node(vec![init.state, Tree::empty(), Tree::empty()]),
            output_sig: push_onto(init.output_sig, &input_sig[k..]),
        })
    }
}

/// `(x1, x2) -> (x1 + post(attention(pre(x2))), x2)`.
///
/// `pre_attention` maps x2 to `(q, k, v)`; `post_attention` must be affine
/// in its input.
pub struct ReversibleAttentionHalfResidual<B: Backend> {
    pre_attention: Serial<B>,
    attention: ApplyAttentionWrapper<B>,
    post_attention: Parallel<B>,
    add_top: Parallel<B>,
    subtract_top: Parallel<B>,
}

impl<B: Backend> ReversibleAttentionHalfResidual<B> {
    pub fn new(
        pre_attention: Vec<Box<dyn Layer<B>>>,
        attention: Box<dyn FusedAttention<B>>,
        post_attention: Vec<Box<dyn Layer<B>>>,
    ) -> Self {
        ReversibleAttentionHalfResidual {
            pre_attention: residual_stack(Box::new(Serial::new(pre_attention))),
            attention: ApplyAttentionWrapper::new(attention),
            post_attention: Parallel::new(vec![
                Box::new(Serial::new(post_attention)),
                Box::new(NoOp),
                Box::new(NoOp),
            ]),
            add_top: Parallel::new(vec![Box::new(Add), Box::new(NoOp)]),
            subtract_top: Parallel::new(vec![Box::new(SubtractTop), Box::new(NoOp)]),
        }
    }

    fn layers(&self) -> [&dyn Layer<B>; 4] {
        [&self.pre_attention, &self.attention, &self.post_attention, &self.add_top]
    }

    fn reverse_layers(&self) -> [&dyn Layer<B>; 4] {
        [&self.pre_attention, &self.attention, &self.post_attention, &self.subtract_top]
    }
}

impl<B: Backend> Layer<B> for ReversibleAttentionHalfResidual<B> {
    fn name(&self) -> &str {
        "ReversibleAttentionHalfResidual"
    }

    fn n_in(&self) -> usize {
        2
    }

    fn n_out(&self) -> usize {
        2
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(self.name(), 2, inputs.len())?;
        serial_forward(self.name(), &self.layers(), inputs, params, state, rng)
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), 2, input_sig.len())?;
        serial_init(self.name(), &self.layers(), input_sig, rng, device)
    }

    fn as_reversible(&self) -> Option<&dyn ReversibleLayer<B>> {
        Some(self)
    }
}

impl<B: Backend> ReversibleLayer<B> for ReversibleAttentionHalfResidual<B> {
    fn reverse(
        &self,
        outputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<Vec<Tensor<B>>> {
        check_arity(self.name(), 2, outputs.len())?;
        Ok(serial_forward(self.name(), &self.reverse_layers(), outputs, params, state, rng)?.0)
    }

    fn reverse_and_grad(
        &self,
        outputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<ReverseGrad<B>> {
        check_arity(self.name(), 2, outputs.len())?;
        check_arity(self.name(), 2, output_cts.len())?;
        let p = params.children(self.name(), 4)?;
        let s = state.children(self.name(), 4)?;
        let rngs = split_rng(rng, 4);

        // (y1, x2) -> (q, k, v, y1, x2)
        let n = outputs.len();
        let mut primals = outputs.to_vec();
        primals.extend(p[0].leaves());
        let (stack, pre_pullback) = vjp(
            |xs: &[Tensor<B>]| {
                let p0 = p[0].unflatten_like(&xs[n..])?;
                Ok(self.pre_attention.forward(&xs[..n], &p0, &s[0], rngs[0])?.0)
            },
            &primals,
        )?;
        let stack = detach_all(&stack);
        let saved_cts = [output_cts[0].clone(), output_cts[0].clone(), output_cts[1].clone()];

        // Stand-in inputs: only the shapes are right.
        let dummy_inputs = stack[stack.len() - 3..].to_vec();
        let (_, post_input_pullback) = vjp(
            |xs: &[Tensor<B>]| Ok(self.post_attention.forward(xs, &p[2], &s[2], rngs[2])?.0),
            &dummy_inputs,
        )?;
        let attended_cts = post_input_pullback.apply(&saved_cts)?;

        let (attended, stack_cts) = self.attention.forward_and_backward(&stack, &attended_cts, rngs[1])?;
        assert!(
            p[1].leaves().is_empty(),
            "ReversibleAttentionHalfResidual: attention must have no params"
        );

        let mut input_cts = pre_pullback.apply(&stack_cts)?;
        let pre_cts = p[0].unflatten_like(&input_cts.split_off(n))?;

        let (post_outputs, post_param_pullback) = vjp(
            |ps: &[Tensor<B>]| {
                let p2 = p[2].unflatten_like(ps)?;
                Ok(self.post_attention.forward(&attended, &p2, &s[2], rngs[2])?.0)
            },
            &p[2].leaves(),
        )?;
        let post_cts = p[2].unflatten_like(&post_param_pullback.apply(&saved_cts)?)?;

        let (inputs, _) = self.subtract_top.forward(&detach_all(&post_outputs), &p[3], &s[3], rngs[3])?;
        assert!(
            p[3].leaves().is_empty(),
            "ReversibleAttentionHalfResidual: add/subtract sublayer must have no params"
        );

        Ok(ReverseGrad {
            inputs,
            input_cts,
            param_cts: Tree::Node(vec![pre_cts, p[1].clone(), post_cts, p[3].clone()]),
        })
    }
}

// ReversibleSerial

/// A Serial of reversible layers, itself reversible.
pub struct ReversibleSerial<B: Backend> {
    layers: Vec<Box<dyn ReversibleLayer<B>>>,
    n_in: usize,
    n_out: usize,
}

impl<B: Backend> ReversibleSerial<B> {
    pub fn new(layers: Vec<Box<dyn ReversibleLayer<B>>>) -> Self {
        let refs: Vec<&dyn ReversibleLayer<B>> = layers.iter().map(|l| l.as_ref()).collect();
        let (n_in, n_out) = serial_arity(&refs);
        ReversibleSerial { layers, n_in, n_out }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn refs(&self) -> Vec<&dyn ReversibleLayer<B>> {
        self.layers.iter().map(|l| l.as_ref()).collect()
    }
}

impl<B: Backend> Layer<B> for ReversibleSerial<B> {
    fn name(&self) -> &str {
        "ReversibleSerial"
    }

    fn n_in(&self) -> usize {
        self.n_in
    }

    fn n_out(&self) -> usize {
        self.n_out
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(self.name(), self.n_in, inputs.len())?;
        serial_forward(self.name(), &self.refs(), inputs, params, state, rng)
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), self.n_in, input_sig.len())?;
        serial_init(self.name(), &self.refs(), input_sig, rng, device)
    }

    fn as_reversible(&self) -> Option<&dyn ReversibleLayer<B>> {
        Some(self)
    }

    fn backprop(
        &self,
        inputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<Backprop<B>> {
        check_arity(self.name(), self.n_in, inputs.len())?;
        serial_backprop(self.name(), &self.refs(), inputs, output_cts, params, state, rng)
    }
}

impl<B: Backend> ReversibleLayer<B> for ReversibleSerial<B> {
    /// Detaches between sublayers, so no block's graph outlives its own
    /// forward pass.
    fn forward_detached(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(self.name(), self.n_in, inputs.len())?;
        let n = self.layers.len();
        let p = params.children(self.name(), n)?;
        let s = state.children(self.name(), n)?;
        let rngs = split_rng(rng, n);

        let mut stack = inputs.to_vec();
        let mut new_state = Vec::with_capacity(n);
        for (i, layer) in self.layers.iter().enumerate() {
            let (args, rest) = split_stack(self.name(), &stack, layer.n_in())?;
            let (outputs, st) = layer.forward_detached(args, &p[i], &s[i], rngs[i])?;
            stack = push_onto(outputs, rest);
            new_state.push(st);
        }
        Ok((stack, Tree::Node(new_state)))
    }

    fn reverse(
        &self,
        outputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<Vec<Tensor<B>>> {
        check_arity(self.name(), self.n_out, outputs.len())?;
        let n = self.layers.len();
        let p = params.children(self.name(), n)?;
        let s = state.children(self.name(), n)?;
        let rngs = split_rng(rng, n);

        let mut stack = outputs.to_vec();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let (top, rest) = split_stack(self.name(), &stack, layer.n_out())?;
            let inputs = layer.reverse(top, &p[i], &s[i], rngs[i])?;
            stack = push_onto(inputs, rest);
        }
        Ok(stack)
    }

    fn reverse_and_grad(
        &self,
        outputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<ReverseGrad<B>> {
        check_arity(self.name(), self.n_out, outputs.len())?;
        let n = self.layers.len();
        let rngs = split_rng(rng, n);
        let (inputs, input_cts, param_cts) = serial_backward(
            self.name(),
            &self.refs(),
            outputs,
            output_cts,
            params,
            state,
            &rngs,
            &vec![None; n],
        )?;
        Ok(ReverseGrad {
            inputs,
            input_cts,
            param_cts,
        })
    }
}

// SplitForOutput

/// `(x1, x2) -> n_sections` outputs: both streams are split along `axis`
/// and each pair of pieces is concatenated on the feature axis.
#[derive(Debug, Clone, Copy)]
pub struct SplitForOutput {
    n_sections: usize,
    axis: i64,
}

impl SplitForOutput {
    pub fn new(n_sections: usize) -> Self {
        SplitForOutput { n_sections, axis: -2 }
    }

    pub fn with_axis(mut self, axis: i64) -> Self {
        self.axis = axis;
        self
    }

    fn join<B: Backend>(&self, pieces: &[Tensor<B>]) -> Result<Vec<Tensor<B>>> {
        check_arity("SplitForOutput", self.n_sections, pieces.len())?;
        let rank = pieces[0].rank();
        let axis = pieces[0].shape().normalize_axis(self.axis)?;
        let mut firsts = Vec::with_capacity(pieces.len());
        let mut seconds = Vec::with_capacity(pieces.len());
        for y in pieces {
            let halves = y.chunk(2, rank - 1)?;
            firsts.push(halves[0].clone());
            seconds.push(halves[1].clone());
        }
        Ok(vec![Tensor::cat(&firsts, axis)?, Tensor::cat(&seconds, axis)?])
    }
}

impl<B: Backend> Layer<B> for SplitForOutput {
    fn name(&self) -> &str {
        "SplitForOutput"
    }

    fn n_in(&self) -> usize {
        2
    }

    fn n_out(&self) -> usize {
        self.n_sections
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(Layer::<B>::name(self), 2, inputs.len())?;
        let (x1, x2) = (&inputs[0], &inputs[1]);
        let axis = x1.shape().normalize_axis(self.axis)?;
        let last = x1.rank() - 1;
        let outputs = x1
            .chunk(self.n_sections, axis)?
            .into_iter()
            .zip(x2.chunk(self.n_sections, axis)?)
            .map(|(a, b)| Tensor::cat(&[a, b], last))
            .collect::<Result<Vec<_>>>()?;
        Ok((outputs, state.clone()))
    }

    fn as_reversible(&self) -> Option<&dyn ReversibleLayer<B>> {
        Some(self)
    }
}

impl<B: Backend> ReversibleLayer<B> for SplitForOutput {
    fn reverse(
        &self,
        outputs: &[Tensor<B>],
        _params: &Tree<B>,
        _state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<Vec<Tensor<B>>> {
        self.join(outputs)
    }

    fn reverse_and_grad(
        &self,
        outputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        _params: &Tree<B>,
        _state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<ReverseGrad<B>> {
        Ok(ReverseGrad {
            inputs: self.join(outputs)?,
            input_cts: self.join(output_cts)?,
            param_cts: Tree::empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::Dense;
    use strand_core::{DType, Op, TensorId};
    use strand_cpu::{CpuBackend, CpuDevice, CpuTensor};

    #[test]
    fn test_split_for_output_round_trip() -> Result<()> {
        let key = RngKey::new(4);
        let x1: CpuTensor = key.fold_in(1).normal((2, 6, 3), 0.0, 1.0, DType::F64, &CpuDevice)?;
        let x2: CpuTensor = key.fold_in(2).normal((2, 6, 3), 0.0, 1.0, DType::F64, &CpuDevice)?;
        let layer = SplitForOutput::new(3);
        let (ys, _) = layer.forward(&[x1.clone(), x2.clone()], &Tree::empty(), &Tree::empty(), None)?;
        assert_eq!(ys.len(), 3);
        assert_eq!(ys[0].dims(), &[2, 2, 6]);
        let back = layer.reverse(&ys, &Tree::empty(), &Tree::empty(), None)?;
        assert_eq!(back[0].to_f64_vec()?, x1.to_f64_vec()?);
        assert_eq!(back[1].to_f64_vec()?, x2.to_f64_vec()?);
        Ok(())
    }

    #[test]
    fn test_swap_reverse_and_grad() -> Result<()> {
        let a = CpuTensor::from_f64_slice(&[1.0], 1, DType::F64, &CpuDevice)?;
        let b = CpuTensor::from_f64_slice(&[2.0], 1, DType::F64, &CpuDevice)?;
        let rg = ReversibleSwap.reverse_and_grad(
            &[a.clone(), b.clone()],
            &[b.clone(), a.clone()],
            &Tree::empty(),
            &Tree::empty(),
            None,
        )?;
        assert_eq!(rg.inputs[0].to_f64_vec()?, vec![2.0]);
        assert_eq!(rg.input_cts[0].to_f64_vec()?, vec![1.0]);
        Ok(())
    }

    #[test]
    fn test_reversible_serial_arity() {
        let layers: Vec<Box<dyn ReversibleLayer<CpuBackend>>> = vec![
            Box::new(ReversibleSwap),
            Box::new(ReversibleHalfResidual::new(vec![])),
            Box::new(SplitForOutput::new(4)),
        ];
        let serial = ReversibleSerial::new(layers);
        assert_eq!((serial.n_in(), serial.n_out()), (2, 4));
    }

    fn reaches(t: &CpuTensor, target: TensorId) -> bool {
        let mut pending = vec![t.clone()];
        while let Some(node) = pending.pop() {
            if node.id() == target {
                return true;
            }
            pending.extend(node.op().inputs().into_iter().cloned());
        }
        false
    }

    #[test]
    fn test_forward_detached_cuts_graph_between_blocks() -> Result<()> {
        let key = RngKey::new(7);
        let x1: CpuTensor = key.fold_in(1).normal((2, 4), 0.0, 1.0, DType::F64, &CpuDevice)?;
        let x2: CpuTensor = key.fold_in(2).normal((2, 4), 0.0, 1.0, DType::F64, &CpuDevice)?;
        let block = || -> Box<dyn ReversibleLayer<CpuBackend>> {
            Box::new(ReversibleHalfResidual::new(vec![Box::new(Dense::new(4))]))
        };
        let serial = ReversibleSerial::new(vec![block(), Box::new(ReversibleSwap), block()]);
        let init = serial.init(&[ShapeDtype::of(&x1), ShapeDtype::of(&x2)], key.fold_in(3), &CpuDevice)?;
        let inputs = [x1.clone(), x2.clone()];

        let (kept, _) = serial.forward(&inputs, &init.params, &init.state, None)?;
        assert!(kept.iter().any(|y| reaches(y, x1.id()) || reaches(y, x2.id())));

        let (cut, _) = serial.forward_detached(&inputs, &init.params, &init.state, None)?;
        for (c, k) in cut.iter().zip(&kept) {
            assert!(matches!(c.op(), Op::None));
            assert_eq!(c.to_f64_vec()?, k.to_f64_vec()?);
        }
        Ok(())
    }
}
