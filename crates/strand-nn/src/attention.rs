// Attention — multi-head attention layers and causal attention kernels
//
// SHAPES:
//
//   B = batch, L = length, D = d_model, H = heads, dh = per-head depth
//
//   ComputeAttentionHeads    [B, L, D]      -> [B*H, L, dh]
//   ComputeAttentionOutput   [B*H, L, dh]   -> [B, L, D]
//   causal kernels           q, k, v        -> out        (all [B*H, L, dh])
//   PureAttention            q, k, v, mask  -> out, mask  (q, k, v [B, L, D])
//
// CAUSAL KERNELS:
//
// Query position i attends to key positions j <= i:
//
//   S = q k^T / sqrt(dh),  S[i, j] = -1e9 for j > i
//   P = exp(S - logsumexp(S))
//   out = P v
//
// MemoryEfficientCausalAttention evaluates the rows of S in chunks of
// `loop_stride` queries, so at most [B*H, loop_stride, L] scores are alive
// at once. DotProductCausalAttention is the same computation in a single
// chunk.
//
// Both implement FusedAttention. `forward_and_backward` recomputes each
// chunk of P and immediately uses it for the analytic backward pass:
//
//   dv += P^T dout
//   dP  = dout v^T
//   dS  = P * (dP - rowsum(dP * P))
//   dq  = dS k / sqrt(dh)
//   dk += dS^T q / sqrt(dh)
//
// In Predict mode the kernels cache the keys and values seen so far in
// their state and attend the new queries to the whole cache.

use serde::{Deserialize, Serialize};
use strand_core::backend::Backend;
use strand_core::{DType, Error, Result, RngKey, ShapeDtype, Tensor};

use crate::combinators::{Parallel, Serial};
use crate::dense::{last_dim, param_dtype, Dense};
use crate::dropout::{apply_keep_mask, check_rate};
use crate::init;
use crate::layer::{check_arity, require_rng, single, FusedAttention, Layer, Mode};
use crate::primitives::Dup;
use crate::tree::Tree;

const MASK_VALUE: f64 = -1e9;

// Multi-head projections

/// Projects `[B, L, D]` to per-head vectors `[B*H, L, d_head]`.
#[derive(Debug, Clone, Copy)]
pub struct ComputeAttentionHeads {
    n_heads: usize,
    d_head: usize,
}

impl ComputeAttentionHeads {
    pub fn new(n_heads: usize, d_head: usize) -> Self {
        ComputeAttentionHeads { n_heads, d_head }
    }
}

impl<B: Backend> Layer<B> for ComputeAttentionHeads {
    fn name(&self) -> &str {
        "ComputeAttentionHeads"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let w = params.leaf_children(Layer::<B>::name(self), 1)?[0];
        let (batch, len) = (x.dim(0)?, x.dim(1)?);
        let heads = x
            .matmul(w)?
            .reshape((batch, len, self.n_heads, self.d_head))?
            .permute(&[0, 2, 1, 3])?
            .reshape((batch * self.n_heads, len, self.d_head))?;
        Ok((vec![heads], state.clone()))
    }

    fn new_params_and_state(
        &self,
        input_sig: &[ShapeDtype],
        rng: RngKey,
        device: &B::Device,
    ) -> Result<(Tree<B>, Tree<B>)> {
        let d_in = last_dim(Layer::<B>::name(self), input_sig)?;
        let w = init::glorot_uniform::<B>(
            rng,
            (d_in, self.n_heads * self.d_head),
            param_dtype(&input_sig[0]),
            device,
        )?;
        Ok((Tree::from_leaves(vec![w]), Tree::empty()))
    }
}

/// Merges heads `[B*H, L, dh]` back to `[B, L, H*dh]` and applies a dense
/// projection to `d_model`.
///
/// The layer is affine in its input, which the reversible attention block
/// relies on.
#[derive(Debug, Clone, Copy)]
pub struct ComputeAttentionOutput {
    n_heads: usize,
    dense: Dense,
}

impl ComputeAttentionOutput {
    pub fn new(n_heads: usize, d_model: usize) -> Self {
        ComputeAttentionOutput {
            n_heads,
            dense: Dense::new(d_model),
        }
    }
}

impl<B: Backend> Layer<B> for ComputeAttentionOutput {
    fn name(&self) -> &str {
        "ComputeAttentionOutput"
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        let x = single(Layer::<B>::name(self), inputs)?;
        let (bh, len, d_head) = (x.dim(0)?, x.dim(1)?, x.dim(2)?);
        if bh % self.n_heads != 0 {
            return Err(Error::not_divisible("ComputeAttentionOutput: batch * heads", bh, self.n_heads));
        }
        let batch = bh / self.n_heads;
        let merged = x
            .reshape((batch, self.n_heads, len, d_head))?
            .permute(&[0, 2, 1, 3])?
            .reshape((batch, len, self.n_heads * d_head))?;
        self.dense.forward(&[merged], params, state, rng)
    }

    fn new_params_and_state(
        &self,
        input_sig: &[ShapeDtype],
        rng: RngKey,
        device: &B::Device,
    ) -> Result<(Tree<B>, Tree<B>)> {
        let d_head = last_dim(Layer::<B>::name(self), input_sig)?;
        let merged = ShapeDtype::new(self.n_heads * d_head, input_sig[0].dtype());
        Layer::<B>::new_params_and_state(&self.dense, &[merged], rng, device)
    }
}

// Causal kernels

/// U8 mask `[rows, cols]`: 1 where key `j` is visible to query `q_offset + i`.
fn causal_mask<B: Backend>(rows: usize, cols: usize, q_offset: usize, device: &B::Device) -> Result<Tensor<B>> {
    let data: Vec<f64> = (0..rows)
        .flat_map(|i| (0..cols).map(move |j| if j <= q_offset + i { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_f64_slice(&data, (rows, cols), DType::U8, device)
}

/// Attention probabilities of a block of queries starting at `q_offset`.
fn causal_probs<B: Backend>(q: &Tensor<B>, k: &Tensor<B>, q_offset: usize) -> Result<Tensor<B>> {
    let scale = 1.0 / (q.dim(-1)? as f64).sqrt();
    let dots = q.matmul(&k.t()?)?.mul_scalar(scale)?;
    let mask = causal_mask::<B>(q.dim(1)?, k.dim(1)?, q_offset, q.device())?;
    let dots = Tensor::where_cond(&mask, &dots, &Tensor::full_like(&dots, MASK_VALUE)?)?;
    let lse = dots.logsumexp(2, true)?;
    dots.sub(&lse)?.exp()
}

/// Row ranges `[start, start + n)` of at most `stride` queries.
fn query_chunks(len: usize, stride: Option<usize>) -> Vec<(usize, usize)> {
    let stride = stride.unwrap_or(len).max(1);
    (0..len)
        .step_by(stride)
        .map(|start| (start, stride.min(len - start)))
        .collect()
}

/// `[batch, 0, d_v]`, the output for an empty query block.
fn empty_attention<B: Backend>(q: &Tensor<B>, v: &Tensor<B>) -> Result<Tensor<B>> {
    Tensor::zeros((q.dim(0)?, 0, v.dim(-1)?), v.dtype(), v.device())
}

fn causal_attend<B: Backend>(
    q: &Tensor<B>,
    k: &Tensor<B>,
    v: &Tensor<B>,
    q_offset: usize,
    stride: Option<usize>,
) -> Result<Tensor<B>> {
    if q.dim(1)? == 0 {
        return empty_attention(q, v);
    }
    let mut outs = Vec::new();
    for (start, n) in query_chunks(q.dim(1)?, stride) {
        let p = causal_probs(&q.narrow(1, start, n)?, k, q_offset + start)?;
        outs.push(p.matmul(v)?);
    }
    Tensor::cat(&outs, 1)
}

fn causal_attend_and_grad<B: Backend>(
    inputs: &[Tensor<B>],
    output_ct: &Tensor<B>,
    stride: Option<usize>,
) -> Result<(Tensor<B>, Vec<Tensor<B>>)> {
    let (q, k, v) = (inputs[0].detach(), inputs[1].detach(), inputs[2].detach());
    let ct = output_ct.detach().to_dtype(q.dtype())?;
    let scale = 1.0 / (q.dim(-1)? as f64).sqrt();

    let mut outs = Vec::new();
    let mut q_cts = Vec::new();
    let mut k_ct = Tensor::zeros_like(&k)?;
    let mut v_ct = Tensor::zeros_like(&v)?;
    if q.dim(1)? == 0 {
        return Ok((empty_attention(&q, &v)?, vec![Tensor::zeros_like(&q)?, k_ct, v_ct]));
    }
    for (start, n) in query_chunks(q.dim(1)?, stride) {
        let qc = q.narrow(1, start, n)?;
        let ctc = ct.narrow(1, start, n)?;
        let p = causal_probs(&qc, &k, start)?;
        outs.push(p.matmul(&v)?.detach());

        v_ct = v_ct.add(&p.t()?.matmul(&ctc)?)?.detach();
        let dp = ctc.matmul(&v.t()?)?;
        let row = dp.mul(&p)?.sum(2, true)?;
        let ds = p.mul(&dp.sub(&row)?)?;
        q_cts.push(ds.matmul(&k)?.mul_scalar(scale)?.detach());
        k_ct = k_ct.add(&ds.t()?.matmul(&qc)?.mul_scalar(scale)?)?.detach();
    }
    Ok((Tensor::cat(&outs, 1)?, vec![Tensor::cat(&q_cts, 1)?, k_ct, v_ct]))
}

fn causal_forward<B: Backend>(
    layer: &str,
    mode: Mode,
    stride: Option<usize>,
    inputs: &[Tensor<B>],
    state: &Tree<B>,
) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
    check_arity(layer, 3, inputs.len())?;
    let (q, k, v) = (&inputs[0], &inputs[1], &inputs[2]);
    if mode != Mode::Predict {
        return Ok((vec![causal_attend(q, k, v, 0, stride)?], state.clone()));
    }

    let cache = state.leaves();
    let (k, v, offset) = match cache.as_slice() {
        [] => (k.clone(), v.clone(), 0),
        [k_cache, v_cache] => (
            Tensor::cat(&[k_cache.clone(), k.clone()], 1)?,
            Tensor::cat(&[v_cache.clone(), v.clone()], 1)?,
            k_cache.dim(1)?,
        ),
        _ => {
            return Err(Error::Uninitialized {
                layer: layer.to_string(),
            })
        }
    };
    let out = causal_attend(q, &k, &v, offset, stride)?;
    Ok((vec![out], Tree::from_leaves(vec![k, v])))
}

/// Causal scaled dot-product attention over the full length at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProductCausalAttention {
    mode: Mode,
}

impl DotProductCausalAttention {
    pub fn new(mode: Mode) -> Self {
        DotProductCausalAttention { mode }
    }
}

impl<B: Backend> Layer<B> for DotProductCausalAttention {
    fn name(&self) -> &str {
        "DotProductCausalAttention"
    }

    fn n_in(&self) -> usize {
        3
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        causal_forward(Layer::<B>::name(self), self.mode, None, inputs, state)
    }
}

impl<B: Backend> FusedAttention<B> for DotProductCausalAttention {
    fn forward_and_backward(
        &self,
        inputs: &[Tensor<B>],
        output_ct: &Tensor<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Tensor<B>, Vec<Tensor<B>>)> {
        check_arity(Layer::<B>::name(self), 3, inputs.len())?;
        causal_attend_and_grad(inputs, output_ct, None)
    }
}

/// Causal attention computed `loop_stride` queries at a time.
#[derive(Debug, Clone, Copy)]
pub struct MemoryEfficientCausalAttention {
    loop_stride: usize,
    mode: Mode,
}

impl MemoryEfficientCausalAttention {
    pub fn new(mode: Mode) -> Self {
        MemoryEfficientCausalAttention { loop_stride: 512, mode }
    }

    pub fn with_loop_stride(mut self, loop_stride: usize) -> Self {
        self.loop_stride = loop_stride;
        self
    }
}

impl<B: Backend> Layer<B> for MemoryEfficientCausalAttention {
    fn name(&self) -> &str {
        "MemoryEfficientCausalAttention"
    }

    fn n_in(&self) -> usize {
        3
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        causal_forward(Layer::<B>::name(self), self.mode, Some(self.loop_stride), inputs, state)
    }
}

impl<B: Backend> FusedAttention<B> for MemoryEfficientCausalAttention {
    fn forward_and_backward(
        &self,
        inputs: &[Tensor<B>],
        output_ct: &Tensor<B>,
        _rng: Option<RngKey>,
    ) -> Result<(Tensor<B>, Vec<Tensor<B>>)> {
        check_arity(Layer::<B>::name(self), 3, inputs.len())?;
        causal_attend_and_grad(inputs, output_ct, Some(self.loop_stride))
    }
}

/// Which causal kernel a model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    #[default]
    DotProductCausal,
    MemoryEfficientCausal,
}

impl AttentionType {
    pub fn layer<B: Backend>(self, mode: Mode) -> Box<dyn Layer<B>> {
        match self {
            AttentionType::DotProductCausal => Box::new(DotProductCausalAttention::new(mode)),
            AttentionType::MemoryEfficientCausal => Box::new(MemoryEfficientCausalAttention::new(mode)),
        }
    }

    pub fn fused<B: Backend>(self, mode: Mode) -> Box<dyn FusedAttention<B>> {
        match self {
            AttentionType::DotProductCausal => Box::new(DotProductCausalAttention::new(mode)),
            AttentionType::MemoryEfficientCausal => Box::new(MemoryEfficientCausalAttention::new(mode)),
        }
    }
}

// Masked multi-head attention

/// `(q, k, v, mask) -> (out, mask)` with q, k, v already projected to
/// `[B, L, D]`. The mask broadcasts to `[B, H, Lq, Lk]`; zeros are hidden.
#[derive(Debug, Clone, Copy)]
pub struct PureAttention {
    n_heads: usize,
    dropout: f64,
    mode: Mode,
}

impl PureAttention {
    pub fn new(n_heads: usize, dropout: f64, mode: Mode) -> Self {
        PureAttention {
            n_heads,
            dropout,
            mode,
        }
    }

    fn split_heads<B: Backend>(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (batch, len, d) = (x.dim(0)?, x.dim(1)?, x.dim(2)?);
        if d % self.n_heads != 0 {
            return Err(Error::not_divisible("PureAttention: d_model", d, self.n_heads));
        }
        x.reshape((batch, len, self.n_heads, d / self.n_heads))?
            .permute(&[0, 2, 1, 3])
    }
}

impl<B: Backend> Layer<B> for PureAttention {
    fn name(&self) -> &str {
        "PureAttention"
    }

    fn n_in(&self) -> usize {
        4
    }

    fn n_out(&self) -> usize {
        2
    }

    fn forward(
        &self,
        inputs: &[Tensor<B>],
        _params: &Tree<B>,
        state: &Tree<B>,
        rng: Option<RngKey>,
    ) -> Result<(Vec<Tensor<B>>, Tree<B>)> {
        check_arity(Layer::<B>::name(self), 4, inputs.len())?;
        let (q, k, v, mask) = (&inputs[0], &inputs[1], &inputs[2], &inputs[3]);
        let (batch, len, d) = (q.dim(0)?, q.dim(1)?, q.dim(2)?);
        let (qh, kh, vh) = (self.split_heads(q)?, self.split_heads(k)?, self.split_heads(v)?);

        let scale = 1.0 / ((d / self.n_heads) as f64).sqrt();
        let dots = qh.matmul(&kh.t()?)?.mul_scalar(scale)?;
        let dots = Tensor::where_cond(mask, &dots, &Tensor::full_like(&dots, MASK_VALUE)?)?;
        let mut probs = dots.softmax(3)?;
        if self.mode == Mode::Train && self.dropout > 0.0 {
            let key = require_rng(Layer::<B>::name(self), rng)?;
            check_rate(self.dropout)?;
            probs = apply_keep_mask(&probs, self.dropout, probs.dims().to_vec(), key)?;
        }
        let out = probs
            .matmul(&vh)?
            .permute(&[0, 2, 1, 3])?
            .reshape((batch, len, d))?;
        Ok((vec![out, mask.clone()], state.clone()))
    }
}

// Builders

/// `(q, k, v, mask) -> (out, mask)`: dense projections around PureAttention.
pub fn attention_qkv<B: Backend>(d_model: usize, n_heads: usize, dropout: f64, mode: Mode) -> Serial<B> {
    Serial::new(vec![
        Box::new(Parallel::new(vec![
            Box::new(Dense::new(d_model)),
            Box::new(Dense::new(d_model)),
            Box::new(Dense::new(d_model)),
        ])),
        Box::new(PureAttention::new(n_heads, dropout, mode)),
        Box::new(Dense::new(d_model)),
    ])
}

/// `(x, mask) -> (y, mask)`: self-attention.
pub fn attention<B: Backend>(d_model: usize, n_heads: usize, dropout: f64, mode: Mode) -> Serial<B> {
    Serial::new(vec![
        Box::new(Dup),
        Box::new(Dup),
        Box::new(attention_qkv(d_model, n_heads, dropout, mode)),
    ])
}

/// `x -> (q, k, v)` per-head projections for the causal kernels.
///
/// With `share_qk` the keys double as queries.
pub fn qkv_heads<B: Backend>(n_heads: usize, d_key: usize, d_value: usize, share_qk: bool) -> Vec<Box<dyn Layer<B>>> {
    if share_qk {
        vec![
            Box::new(Dup),
            Box::new(Parallel::new(vec![
                Box::new(ComputeAttentionHeads::new(n_heads, d_key)),
                Box::new(ComputeAttentionHeads::new(n_heads, d_value)),
            ])),
            Box::new(Dup),
        ]
    } else {
        vec![
            Box::new(Dup),
            Box::new(Dup),
            Box::new(Parallel::new(vec![
                Box::new(ComputeAttentionHeads::new(n_heads, d_key)),
                Box::new(ComputeAttentionHeads::new(n_heads, d_key)),
                Box::new(ComputeAttentionHeads::new(n_heads, d_value)),
            ])),
        ]
    }
}

/// `x -> y` causal self-attention with the chosen kernel.
pub fn causal_attention<B: Backend>(
    d_model: usize,
    n_heads: usize,
    d_key: usize,
    d_value: usize,
    attention_type: AttentionType,
    share_qk: bool,
    mode: Mode,
) -> Serial<B> {
    let mut layers = qkv_heads(n_heads, d_key, d_value, share_qk);
    layers.push(attention_type.layer(mode));
    layers.push(Box::new(ComputeAttentionOutput::new(n_heads, d_model)));
    Serial::new(layers)
}
