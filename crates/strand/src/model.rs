// Model — a layer plus the params and state it owns
//
// Layers are pure; a Model is the stateful handle around one. It
//
//   1. initializes params and state once, from the first input signature
//   2. threads state between calls (e.g. the Predict-mode position counter)
//   3. draws per-call randomness from the active provider
//
// Every call enters the model's BackendContext, so the configured provider
// is in effect unless the caller has an override open.

use log::{debug, info};
use strand_core::backend::Backend;
use strand_core::{Error, Result, RngKey, ShapeDtype, Tensor};
use strand_nn::{Backprop, Layer, Tree};

use crate::backend::BackendContext;

struct Initialized<B: Backend> {
    params: Tree<B>,
    state: Tree<B>,
    input_sig: Vec<ShapeDtype>,
}

/// A layer with its weights.
pub struct Model<B: Backend> {
    layer: Box<dyn Layer<B>>,
    ctx: BackendContext,
    device: B::Device,
    init: Option<Initialized<B>>,
}

impl<B: Backend> Model<B> {
    pub fn new(layer: Box<dyn Layer<B>>, ctx: BackendContext, device: B::Device) -> Self {
        Model {
            layer,
            ctx,
            device,
            init: None,
        }
    }

    pub fn layer(&self) -> &dyn Layer<B> {
        self.layer.as_ref()
    }

    pub fn context(&self) -> &BackendContext {
        &self.ctx
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn is_initialized(&self) -> bool {
        self.init.is_some()
    }

    /// Create params and state for inputs of `input_sig`.
    ///
    /// Only the first call does anything; later calls return immediately,
    /// whatever signature they pass.
    pub fn initialize_once(&mut self, input_sig: &[ShapeDtype], seed: u64) -> Result<()> {
        if self.init.is_some() {
            return Ok(());
        }
        let _guard = self.ctx.enter();
        let provider = self.ctx.provider();
        let rng = provider.get_prng(seed).unwrap_or_else(|| RngKey::new(seed));

        debug!("initializing {} on {} (seed {})", self.layer.name(), provider, seed);
        let out = self.layer.init(input_sig, rng, &self.device)?;
        info!(
            "{}: {} params in {} tensors",
            self.layer.name(),
            out.params.elem_count(),
            out.params.leaf_count()
        );
        self.init = Some(Initialized {
            params: out.params,
            state: out.state,
            input_sig: input_sig.to_vec(),
        });
        Ok(())
    }

    fn initialized(&self) -> Result<&Initialized<B>> {
        self.init.as_ref().ok_or_else(|| Error::Uninitialized {
            layer: self.layer.name().to_string(),
        })
    }

    /// Run the model and keep the state it returns.
    pub fn apply(&mut self, inputs: &[Tensor<B>], seed: u64) -> Result<Vec<Tensor<B>>> {
        let _guard = self.ctx.enter();
        let rng = self.ctx.provider().get_prng(seed);
        let init = self.initialized()?;
        let (outputs, state) = self.layer.forward(inputs, &init.params, &init.state, rng)?;
        if let Some(init) = self.init.as_mut() {
            init.state = state;
        }
        Ok(outputs)
    }

    /// Outputs plus cotangents of the inputs and params for `output_cts`.
    ///
    /// Goes through [`Layer::backprop`], so reversible layers inside a
    /// `Serial` reconstruct their inputs instead of keeping them. The model's
    /// state is left untouched.
    pub fn vjp(&self, inputs: &[Tensor<B>], output_cts: &[Tensor<B>], seed: u64) -> Result<Backprop<B>> {
        let _guard = self.ctx.enter();
        let provider = self.ctx.provider();
        if !provider.supports_grad() {
            return Err(provider.unsupported("vjp"));
        }
        let init = self.initialized()?;
        self.layer
            .backprop(inputs, output_cts, &init.params, &init.state, provider.get_prng(seed))
    }

    pub fn params(&self) -> Option<&Tree<B>> {
        self.init.as_ref().map(|i| &i.params)
    }

    pub fn state(&self) -> Option<&Tree<B>> {
        self.init.as_ref().map(|i| &i.state)
    }

    /// Signature the model was initialized with.
    pub fn input_sig(&self) -> Option<&[ShapeDtype]> {
        self.init.as_ref().map(|i| i.input_sig.as_slice())
    }

    /// Total number of scalar parameters; 0 before initialization.
    pub fn num_params(&self) -> usize {
        self.params().map_or(0, Tree::elem_count)
    }

    /// Replace the params with a tree of the same structure and shapes.
    pub fn set_params(&mut self, params: Tree<B>) -> Result<()> {
        let name = self.layer.name().to_string();
        let init = self.init.as_mut().ok_or(Error::Uninitialized { layer: name })?;
        let old = init.params.leaves();
        let new = params.leaves();
        if old.len() != new.len() {
            return Err(Error::msg(format!(
                "set_params: expected {} param tensors, got {}",
                old.len(),
                new.len()
            )));
        }
        for (o, n) in old.iter().zip(&new) {
            if o.shape() != n.shape() {
                return Err(Error::ShapeMismatch {
                    expected: o.shape().clone(),
                    got: n.shape().clone(),
                });
            }
        }
        init.params = init.params.unflatten_like(&new)?;
        Ok(())
    }
}
