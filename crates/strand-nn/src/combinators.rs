// Combinators — building bigger layers out of smaller ones
//
// Serial runs its sublayers on a data stack:
//
//   stack = inputs
//   for layer in layers:
//       args  = stack[..layer.n_in]          (top of stack is index 0)
//       stack = layer(args) ++ stack[layer.n_in..]
//
// so `Serial[Dup, Parallel(f, g), Add]` computes f(x) + g(x). The arity of a
// Serial is what a stack machine needs: n_in is the deepest the stack is
// ever read, n_out what is left at the end.
//
// Parallel partitions its inputs by each sublayer's n_in; Branch hands every
// sublayer a copy of the leading inputs; Map applies one layer, with one set
// of params, to each of n inputs.
//
// Params and state are threaded positionally: a combinator's tree is a Node
// with one child per sublayer. The rng is split once per sublayer.
//
// MEMORY-EFFICIENT BACKPROP:
//
// Serial::backprop does not record a tape over the whole stack. Its forward
// pass keeps only the inputs of the sublayers that cannot reconstruct them;
// the backward pass walks the layers in reverse and asks reversible layers to
// rebuild their inputs while computing their gradients (`reverse_and_grad`).
// Everything else is differentiated with its own `backprop` on the saved
// inputs. For a stack of reversible layers the activation memory is therefore
// independent of depth.

use strand_core::backend::Backend;
use strand_core::{eval_on_shapes, Error, Result, RngKey, ShapeDtype, Tensor};

use crate::layer::{check_arity, split_rng, Backprop, Layer, LayerInit};
use crate::primitives::{Add, NoOp};
use crate::tree::Tree;

/// Split the top `n` entries off a stack.
pub(crate) fn split_stack<'a, T>(layer: &str, stack: &'a [T], n: usize) -> Result<(&'a [T], &'a [T])> {
    if stack.len() < n {
        return Err(Error::ArityMismatch {
            layer: layer.to_string(),
            expected: n,
            got: stack.len(),
        });
    }
    Ok(stack.split_at(n))
}

pub(crate) fn push_onto<T: Clone>(top: Vec<T>, rest: &[T]) -> Vec<T> {
    let mut stack = top;
    stack.extend_from_slice(rest);
    stack
}

fn as_refs<B: Backend>(layers: &[Box<dyn Layer<B>>]) -> Vec<&dyn Layer<B>> {
    layers.iter().map(|l| l.as_ref()).collect()
}

// Serial helpers, shared with the reversible layers

/// `(n_in, n_out)` of running `layers` in sequence on a stack.
pub(crate) fn serial_arity<B: Backend, L: Layer<B> + ?Sized>(layers: &[&L]) -> (usize, usize) {
    if layers.is_empty() {
        return (1, 1);
    }
    let mut running_total: isize = 0;
    let mut running_max: isize = 0;
    for layer in layers {
        running_total += layer.n_in() as isize;
        running_max = running_max.max(running_total);
        running_total -= layer.n_out() as isize;
    }
    (running_max as usize, (running_max - running_total) as usize)
}

pub(crate) fn serial_forward<B: Backend, L: Layer<B> + ?Sized>(
    name: &str,
    layers: &[&L],
    inputs: &[Tensor<B>],
    params: &Tree<B>,
    state: &Tree<B>,
    rng: Option<RngKey>,
) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
    let n = layers.len();
    let p = params.children(name, n)?;
    let s = state.children(name, n)?;
    let rngs = split_rng(rng, n);

    let mut stack = inputs.to_vec();
    let mut new_state = Vec::with_capacity(n);
    for (i, layer) in layers.iter().enumerate() {
        let (args, rest) = split_stack(name, &stack, layer.n_in())?;
        let (outputs, st) = layer.forward(args, &p[i], &s[i], rngs[i])?;
        stack = push_onto(outputs, rest);
        new_state.push(st);
    }
    Ok((stack, Tree::Node(new_state)))
}

pub(crate) fn serial_init<B: Backend, L: Layer<B> + ?Sized>(
    name: &str,
    layers: &[&L],
    input_sig: &[ShapeDtype],
    rng: RngKey,
    device: &B::Device,
) -> Result<LayerInit<B>> {
    let keys = rng.split(layers.len());
    let mut stack = input_sig.to_vec();
    let mut params = Vec::with_capacity(layers.len());
    let mut state = Vec::with_capacity(layers.len());
    for (layer, key) in layers.iter().zip(keys) {
        let (args, rest) = split_stack(name, &stack, layer.n_in())?;
        let init = layer.init(args, key, device)?;
        stack = push_onto(init.output_sig, rest);
        params.push(init.params);
        state.push(init.state);
    }
    Ok(LayerInit {
        params: Tree::Node(params),
        state: Tree::Node(state),
        output_sig: stack,
    })
}

/// Walk `layers` backwards from `outputs`, reconstructing the stack and
/// pulling `output_cts` back to the inputs.
///
/// `saved[i]` holds the inputs of layer `i` when it is not reversible.
/// Returns (inputs, input cotangents, param cotangents).
#[allow(clippy::too_many_arguments)]
pub(crate) fn serial_backward<B: Backend, L: Layer<B> + ?Sized>(
    name: &str,
    layers: &[&L],
    outputs: &[Tensor<B>],
    output_cts: &[Tensor<B>],
    params: &Tree<B>,
    state: &Tree<B>,
    rngs: &[Option<RngKey>],
    saved: &[Option<Vec<Tensor<B>>>],
) -> Result<(Vec<Tensor<B>>, Vec<Tensor<B>>, Tree<B>)> {
    let n = layers.len();
    let p = params.children(name, n)?;
    let s = state.children(name, n)?;
    check_arity(name, outputs.len(), output_cts.len())?;

    let mut stack = outputs.to_vec();
    let mut cts = output_cts.to_vec();
    let mut param_cts = vec![Tree::empty(); n];
    for i in (0..n).rev() {
        let layer = layers[i];
        let (top, rest) = split_stack(name, &stack, layer.n_out())?;
        let (ct_top, ct_rest) = split_stack(name, &cts, layer.n_out())?;

        let (sub_inputs, sub_cts, sub_param_cts) = match (layer.as_reversible(), &saved[i]) {
            (_, Some(inputs)) => {
                let bp = layer.backprop(inputs, ct_top, &p[i], &s[i], rngs[i])?;
                (inputs.clone(), bp.input_cts, bp.param_cts)
            }
            (Some(rev), None) => {
                log::trace!("{}: reconstructing inputs of {} (layer {})", name, layer.name(), i);
                let rg = rev.reverse_and_grad(top, ct_top, &p[i], &s[i], rngs[i])?;
                (rg.inputs, rg.input_cts, rg.param_cts)
            }
            (None, None) => {
                return Err(Error::msg(format!(
                    "{}: no saved inputs for non-reversible layer {} ({})",
                    name,
                    i,
                    layer.name()
                )))
            }
        };
        stack = push_onto(sub_inputs, rest);
        cts = push_onto(sub_cts, ct_rest);
        param_cts[i] = sub_param_cts;
    }
    Ok((stack, cts, Tree::Node(param_cts)))
}

pub(crate) fn serial_backprop<B: Backend, L: Layer<B> + ?Sized>(
    name: &str,
    layers: &[&L],
    inputs: &[Tensor<B>],
    output_cts: &[Tensor<B>],
    params: &Tree<B>,
    state: &Tree<B>,
    rng: Option<RngKey>,
) -> Result<Backprop<B>> {
    let n = layers.len();
    let p = params.children(name, n)?;
    let s = state.children(name, n)?;
    let rngs = split_rng(rng, n);

    let mut stack = inputs.to_vec();
    let mut saved = Vec::with_capacity(n);
    let mut new_state = Vec::with_capacity(n);
    for (i, layer) in layers.iter().enumerate() {
        let (args, rest) = split_stack(name, &stack, layer.n_in())?;
        let (outputs, st) = match layer.as_reversible() {
            Some(rev) => {
                saved.push(None);
                rev.forward_detached(args, &p[i], &s[i], rngs[i])?
            }
            None => {
                saved.push(Some(args.to_vec()));
                let (outputs, st) = layer.forward(args, &p[i], &s[i], rngs[i])?;
                (outputs.iter().map(Tensor::detach).collect(), st.detached())
            }
        };
        stack = push_onto(outputs, rest);
        new_state.push(st);
    }

    let (_, input_cts, param_cts) =
        serial_backward(name, layers, &stack, output_cts, params, state, &rngs, &saved)?;
    Ok(Backprop {
        outputs: stack,
        input_cts,
        param_cts,
        state: Tree::Node(new_state),
    })
}

// Serial

/// Runs sublayers one after another on a data stack.
///
/// An empty Serial is the identity on one input.
pub struct Serial<B: Backend> {
    layers: Vec<Box<dyn Layer<B>>>,
    n_in: usize,
    n_out: usize,
}

impl<B: Backend> Serial<B> {
    pub fn new(layers: Vec<Box<dyn Layer<B>>>) -> Self {
        let (n_in, n_out) = serial_arity(&as_refs(&layers));
        Serial {
            layers,
            n_in,
            n_out,
        }
    }

    pub fn layers(&self) -> &[Box<dyn Layer<B>>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<B: Backend> Layer<B> for Serial<B> {
    fn name(&self) -> &str {
        "Serial"
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
        serial_forward(self.name(), &as_refs(&self.layers), inputs, params, state, rng)
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), self.n_in, input_sig.len())?;
        serial_init(self.name(), &as_refs(&self.layers), input_sig, rng, device)
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
        serial_backprop(
            self.name(),
            &as_refs(&self.layers),
            inputs,
            output_cts,
            params,
            state,
            rng,
        )
    }
}

// Parallel

/// Runs sublayers side by side on consecutive slices of the inputs.
pub struct Parallel<B: Backend> {
    layers: Vec<Box<dyn Layer<B>>>,
}

impl<B: Backend> Parallel<B> {
    pub fn new(layers: Vec<Box<dyn Layer<B>>>) -> Self {
        Parallel { layers }
    }
}

impl<B: Backend> Layer<B> for Parallel<B> {
    fn name(&self) -> &str {
        "Parallel"
    }

    fn n_in(&self) -> usize {
        self.layers.iter().map(|l| l.n_in()).sum()
    }

    fn n_out(&self) -> usize {
        self.layers.iter().map(|l| l.n_out()).sum()
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(self.name(), self.n_in(), inputs.len())?;
        let n = self.layers.len();
        let p = params.children(self.name(), n)?;
        let s = state.children(self.name(), n)?;
        let rngs = split_rng(rng, n);

        let mut outputs = Vec::with_capacity(self.n_out());
        let mut new_state = Vec::with_capacity(n);
        let mut offset = 0;
        for (i, layer) in self.layers.iter().enumerate() {
            let args = &inputs[offset..offset + layer.n_in()];
            offset += layer.n_in();
            let (out, st) = layer.forward(args, &p[i], &s[i], rngs[i])?;
            outputs.extend(out);
            new_state.push(st);
        }
        Ok((outputs, Tree::Node(new_state)))
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), self.n_in(), input_sig.len())?;
        let keys = rng.split(self.layers.len());
        let mut params = Vec::with_capacity(self.layers.len());
        let mut state = Vec::with_capacity(self.layers.len());
        let mut output_sig = Vec::with_capacity(self.n_out());
        let mut offset = 0;
        for (layer, key) in self.layers.iter().zip(keys) {
            let init = layer.init(&input_sig[offset..offset + layer.n_in()], key, device)?;
            offset += layer.n_in();
            params.push(init.params);
            state.push(init.state);
            output_sig.extend(init.output_sig);
        }
        Ok(LayerInit {
            params: Tree::Node(params),
            state: Tree::Node(state),
            output_sig,
        })
    }
}

// Branch

/// Runs every sublayer on (a prefix of) the same inputs and concatenates
/// their outputs.
pub struct Branch<B: Backend> {
    layers: Vec<Box<dyn Layer<B>>>,
}

impl<B: Backend> Branch<B> {
    pub fn new(layers: Vec<Box<dyn Layer<B>>>) -> Self {
        Branch { layers }
    }
}

impl<B: Backend> Layer<B> for Branch<B> {
    fn name(&self) -> &str {
        "Branch"
    }

    fn n_in(&self) -> usize {
        self.layers.iter().map(|l| l.n_in()).max().unwrap_or(1)
    }

    fn n_out(&self) -> usize {
        self.layers.iter().map(|l| l.n_out()).sum()
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(self.name(), self.n_in(), inputs.len())?;
        let n = self.layers.len();
        let p = params.children(self.name(), n)?;
        let s = state.children(self.name(), n)?;
        let rngs = split_rng(rng, n);

        let mut outputs = Vec::with_capacity(self.n_out());
        let mut new_state = Vec::with_capacity(n);
        for (i, layer) in self.layers.iter().enumerate() {
            let (out, st) = layer.forward(&inputs[..layer.n_in()], &p[i], &s[i], rngs[i])?;
            outputs.extend(out);
            new_state.push(st);
        }
        Ok((outputs, Tree::Node(new_state)))
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), self.n_in(), input_sig.len())?;
        let keys = rng.split(self.layers.len());
        let mut params = Vec::with_capacity(self.layers.len());
        let mut state = Vec::with_capacity(self.layers.len());
        let mut output_sig = Vec::with_capacity(self.n_out());
        for (layer, key) in self.layers.iter().zip(keys) {
            let init = layer.init(&input_sig[..layer.n_in()], key, device)?;
            params.push(init.params);
            state.push(init.state);
            output_sig.extend(init.output_sig);
        }
        Ok(LayerInit {
            params: Tree::Node(params),
            state: Tree::Node(state),
            output_sig,
        })
    }
}

// Residual

/// `Serial[Branch(NoOp, Serial(layers)), Add]`: adds the layers' output to
/// their first input. Extra inputs of the layers (e.g. a mask) pass through.
pub struct Residual<B: Backend> {
    inner: Serial<B>,
}

impl<B: Backend> Residual<B> {
    pub fn new(layers: Vec<Box<dyn Layer<B>>>) -> Self {
        let branch = Branch::new(vec![Box::new(NoOp), Box::new(Serial::new(layers))]);
        Residual {
            inner: Serial::new(vec![Box::new(branch), Box::new(Add)]),
        }
    }
}

impl<B: Backend> Layer<B> for Residual<B> {
    fn name(&self) -> &str {
        "Residual"
    }

    fn n_in(&self) -> usize {
        self.inner.n_in()
    }

    fn n_out(&self) -> usize {
        self.inner.n_out()
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        self.inner.forward(inputs, params, state, rng)
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        self.inner.init(input_sig, rng, device)
    }

    fn backprop(
        &self,
        inputs: &[Tensor<B>],
        output_cts: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<Backprop<B>> {
        self.inner.backprop(inputs, output_cts, params, state, rng)
    }
}

// Map

/// Applies one 1 -> 1 layer to each of `n_sections` inputs with shared
/// params.
///
/// The layer is initialized once, on the first input's signature. With
/// `check_shapes` every input must have that shape; without it, inputs may
/// differ. Output signatures are then inferred element by element for a
/// parameter-free layer, and copied from the first section otherwise.
pub struct Map<B: Backend> {
    layer: Box<dyn Layer<B>>,
    n_sections: usize,
    check_shapes: bool,
}

impl<B: Backend> Map<B> {
    pub fn new(layer: Box<dyn Layer<B>>, n_sections: usize, check_shapes: bool) -> Result<Self> {
        check_arity("Map", 1, layer.n_in())?;
        if layer.n_out() != 1 {
            return Err(Error::msg(format!(
                "Map: {} must produce one output, not {}",
                layer.name(),
                layer.n_out()
            )));
        }
        if n_sections == 0 {
            return Err(Error::msg("Map: n_sections must be at least 1"));
        }
        Ok(Map {
            layer,
            n_sections,
            check_shapes,
        })
    }

    pub fn n_sections(&self) -> usize {
        self.n_sections
    }
}

impl<B: Backend> Layer<B> for Map<B> {
    fn name(&self) -> &str {
        "Map"
    }

    fn n_in(&self) -> usize {
        self.n_sections
    }

    fn n_out(&self) -> usize {
        self.n_sections
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(self.name(), self.n_sections, inputs.len())?;
        if self.n_sections == 1 {
            return self.layer.forward(inputs, params, state, rng);
        }
        let rngs = split_rng(rng, self.n_sections);
        let mut outputs = Vec::with_capacity(self.n_sections);
        let mut last_state = state.clone();
        for (x, r) in inputs.iter().zip(rngs) {
            // Every element starts from the incoming state.
            let (out, st) = self.layer.forward(std::slice::from_ref(x), params, state, r)?;
            outputs.extend(out);
            last_state = st;
        }
        Ok((outputs, last_state))
    }

    fn init(&self, input_sig: &[ShapeDtype], rng: RngKey, device: &B::Device) -> Result<LayerInit<B>> {
        check_arity(self.name(), self.n_sections, input_sig.len())?;
        if self.n_sections == 1 {
            return self.layer.init(input_sig, rng, device);
        }
        let first = input_sig[0].shape();
        if self.check_shapes {
            if let Some(bad) = input_sig.iter().find(|s| s.shape() != first) {
                return Err(Error::MapShapeMismatch {
                    shape: bad.shape().clone(),
                    first: first.clone(),
                });
            }
        }

        let init = self.layer.init(&input_sig[..1], rng, device)?;
        // Params are sized for the first section, so only a param-free layer
        // can be traced on the other shapes.
        let output_sig = if self.check_shapes || init.params.leaf_count() > 0 {
            let out = init
                .output_sig
                .first()
                .cloned()
                .ok_or_else(|| Error::msg(format!("Map: {} produced no output", self.layer.name())))?;
            vec![out; self.n_sections]
        } else {
            let keys = rng.split(self.n_sections);
            let mut sigs = Vec::with_capacity(self.n_sections);
            for (sig, key) in input_sig.iter().zip(keys) {
                let out = eval_on_shapes(
                    |xs: &[Tensor<B>]| Ok(self.layer.forward(xs, &init.params, &init.state, Some(key))?.0),
                    std::slice::from_ref(sig),
                    device,
                )?;
                sigs.extend(out);
            }
            sigs
        };
        Ok(LayerInit {
            params: init.params,
            state: init.state,
            output_sig,
        })
    }
}
