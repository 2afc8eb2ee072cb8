// Layer — the interface every layer and combinator implements
//
// A layer is a pure function of (inputs, params, state, rng). It holds only
// its configuration; weights live in a `Tree` that `init` creates and the
// caller passes back on every call. That keeps layers shareable (`Map`
// applies one layer to n inputs with one set of params) and lets gradient
// code treat params as ordinary function arguments.
//
// ARITY:
//
// Every layer declares how many tensors it consumes (`n_in`) and produces
// (`n_out`). Combinators run layers on a data stack, so a layer never sees
// more inputs than it declared.
//
// THREE FLAVOURS OF LAYER:
//
//   Layer            forward + init; backprop defaults to a tape vjp
//   ReversibleLayer  can recompute its inputs from its outputs, and fuse
//                    that recomputation with the backward pass
//   FusedAttention   an attention kernel (q, k, v) -> out that can recompute
//                    its output and cotangents in one pass
//
// RANDOMNESS:
//
// The rng is an explicit, optional key. Combinators split it once per
// sublayer, so the same key reproduces the same dropout masks. Stochastic
// layers fail with `MissingRng` when called without one.

use serde::{Deserialize, Serialize};
use strand_core::backend::Backend;
use strand_core::{eval_on_shapes, vjp, Error, Result, RngKey, ShapeDtype, Tensor};

use crate::tree::Tree;

/// Whether a model is training, evaluating, or decoding one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Train,
    Eval,
    Predict,
}

/// What `init` returns: fresh params and state, and the signatures of the
/// layer's outputs.
#[derive(Debug, Clone)]
pub struct LayerInit<B: Backend> {
    pub params: Tree<B>,
    pub state: Tree<B>,
    pub output_sig: Vec<ShapeDtype>,
}

/// Result of [`Layer::backprop`].
#[derive(Debug, Clone)]
pub struct Backprop<B: Backend> {
    pub outputs: Vec<Tensor<B>>,
    pub input_cts: Vec<Tensor<B>>,
    pub param_cts: Tree<B>,
    pub state: Tree<B>,
}

/// Result of [`ReversibleLayer::reverse_and_grad`].
#[derive(Debug, Clone)]
pub struct ReverseGrad<B: Backend> {
    /// The reconstructed inputs.
    pub inputs: Vec<Tensor<B>>,
    pub input_cts: Vec<Tensor<B>>,
    pub param_cts: Tree<B>,
}

/// A differentiable function with explicit params, state and rng.
pub trait Layer<B: Backend>: Send + Sync {
    fn name(&self) -> &str;

    fn n_in(&self) -> usize {
        1
    }

    fn n_out(&self) -> usize {
        1
    }

    /// Run the layer. Returns the outputs and the new state.
    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)>;

    /// Fresh params and state for inputs with the given signatures.
    fn new_params_and_state(
        &self,
        _input_sig: &[ShapeDtype],
        _rng: RngKey,
        _device: &B::Device,
    ) -> Result<(Tree<B>, Tree<B>)> {
        Ok((Tree::empty(), Tree::empty()))
    }

    /// Create params and state and infer the output signatures.
    ///
    /// Leaf layers infer outputs by running `forward` on zeros; combinators
    /// override this to chain their sublayers' signatures instead.
    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), self.n_in(), input_sig.len())?;
        let (params, state) = self.new_params_and_state(input_sig, rng, device)?;
        let output_sig = eval_on_shapes(
            |xs: &[Tensor<B>]| Ok(self.forward(xs, &params, &state, Some(rng))?.0),
            input_sig,
            device,
        )?;
        Ok(LayerInit {
            params,
            state,
            output_sig,
        })
    }

    /// `Some(self)` for layers that can reconstruct their inputs.
    fn as_reversible(&self) -> Option<&dyn ReversibleLayer<B>> {
        None
    }

    /// Forward pass plus vector-Jacobian product with `output_cts`.
    fn backprop(
        &self,
        inputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<Backprop<B>> {
        tape_backprop(self, inputs, output_cts, params, state, rng)
    }
}

/// A layer whose inputs can be recomputed from its outputs and params.
pub trait ReversibleLayer<B: Backend>: Layer<B> {
    fn reverse(
        &self,
        outputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<Vec<Tensor<B>>>;

    /// `forward` with no autodiff graph kept past the outputs.
    ///
    /// Backprop through a `Serial` runs reversible layers this way, since
    /// `reverse_and_grad` rebuilds whatever it needs from the outputs.
    fn forward_detached(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let (outputs, state) = self.forward(inputs, params, state, rng)?;
        Ok((outputs.iter().map(Tensor::detach).collect(), state.detached()))
    }

    /// Reconstruct the inputs and backpropagate `output_cts` to them.
    ///
    /// The default reverses, then runs a tape vjp of `forward` on the
    /// reconstructed inputs.
    fn reverse_and_grad(
        &self,
        outputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<ReverseGrad<B>> {
        naive_reverse_and_grad(self, outputs, output_cts, params, state, rng)
    }
}

/// Causal attention that can recompute its output while backpropagating.
///
/// Takes `(q, k, v)` and returns one tensor. Implementors have no params.
pub trait FusedAttention<B: Backend>: Layer<B> {
    /// Returns the attention output and the cotangents of `(q, k, v)`.
    fn forward_and_backward(
        &self,
        inputs: &[Tensor<B>],
        output_ct: &Tensor<B>,
        rng: Option<RngKey>,
    ) -> Result<(Tensor<B>, Vec<Tensor<B>>)>;
}

/// Backprop by recording `forward` on the tape and pulling `output_cts`
/// back through it.
pub fn tape_backprop<B, L>(
    layer: &L,
    inputs: &[Tensor<B>],
    output_cts: &[Tensor<B>],
    params: &Tree<B>,
    state: &Tree<B>,
    rng: Option<RngKey>,
) -> Result<Backprop<B>>
where
    B: Backend,
    L: Layer<B> + ?Sized,
{
    let n = inputs.len();
    let mut primals = inputs.to_vec();
    primals.extend(params.leaves());

    let mut new_state = None;
    let (outputs, pullback) = vjp(
        |p: &[Tensor<B>]| {
            let p_tree = params.unflatten_like(&p[n..])?;
            let (out, s) = layer.forward(&p[..n], &p_tree, state, rng)?;
            new_state = Some(s);
            Ok(out)
        },
        &primals,
    )?;
    let mut cts = pullback.apply(output_cts)?;
    let param_cts = params.unflatten_like(&cts.split_off(n))?;

    Ok(Backprop {
        outputs: outputs.iter().map(Tensor::detach).collect(),
        input_cts: cts,
        param_cts,
        state: new_state.map(|s| s.detached()).unwrap_or_else(|| state.clone()),
    })
}

/// Reverse, then backprop through a fresh forward pass. This is the
/// two-pass reference the fused implementations must agree with.
pub fn naive_reverse_and_grad<B, L>(
    layer: &L,
    outputs: &[Tensor<B>],
    output_cts: &[Tensor<B>],
    params: &Tree<B>,
    state: &Tree<B>,
    rng: Option<RngKey>,
) -> Result<ReverseGrad<B>>
where
    B: Backend,
    L: ReversibleLayer<B> + ?Sized,
{
    let inputs = layer.reverse(outputs, params, state, rng)?;
    let bp = tape_backprop(layer, &inputs, output_cts, params, state, rng)?;
    Ok(ReverseGrad {
        inputs,
        input_cts: bp.input_cts,
        param_cts: bp.param_cts,
    })
}

/// Fail with `ArityMismatch` unless `got == expected`.
pub fn check_arity(layer: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::ArityMismatch {
            layer: layer.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

/// One key per sublayer, or `None`s when there is no key.
pub fn split_rng(rng: Option<RngKey>, n: usize) -> Vec<Option<RngKey>> {
    match rng {
        Some(key) => key.split(n).into_iter().map(Some).collect(),
        None => vec![None; n],
    }
}

/// The key, or `MissingRng` for `layer`.
pub fn require_rng(layer: &str, rng: Option<RngKey>) -> Result<RngKey> {
    rng.ok_or_else(|| Error::MissingRng {
        layer: layer.to_string(),
    })
}

/// The single input of a 1 -> 1 layer.
pub(crate) fn single<'a, B: Backend>(layer: &str, inputs: &'a [Tensor<B>]) -> Result<&'a Tensor<B>> {
    check_arity(layer, 1, inputs.len())?;
    Ok(&inputs[0])
}
