// ReformerLM — reversible decoder-only language model
//
//   tokens (or n_chunks token chunks)
//     [Concatenate]  ShiftRight
//     Embedding  BroadcastedDropout  PositionalEncoding       -> x
//     Dup                                                     -> x x
//     ReversibleSerial[ decoder_block * n_layers, SplitForOutput(n_chunks) ]
//     Map[ LayerNorm, BroadcastedDropout, Dense(vocab), LogSoftmax ] over n_chunks
//
// Each decoder block is four reversible layers over the two streams:
//
//   ReversibleAttentionHalfResidual(pre, attention, post)
//   ReversibleSwap
//   ReversibleHalfResidual(feed_forward)
//   ReversibleSwap
//
// pre  = Chunk(n_attention_chunks), LayerNorm, per-head q/k/v projections
// post = ComputeAttentionOutput, Unchunk(n_attention_chunks), BroadcastedDropout
//
// post is linear in its input, which the fused backward pass relies on.

use strand_core::backend::Backend;
use strand_core::Result;
use strand_nn::{
    qkv_heads, AttentionType, BroadcastedDropout, Chunk, ComputeAttentionOutput, Concatenate, Dense, Dup, Embedding,
    Layer, LayerNorm, LogSoftmax, Map, Mode, PositionalEncoding, Relu, ReversibleAttentionHalfResidual,
    ReversibleHalfResidual, ReversibleLayer, ReversibleSerial, ReversibleSwap, Serial, ShiftRight, SplitForOutput,
    Unchunk,
};

use crate::config::ReformerLmConfig;

/// LayerNorm, Dense(d_ff), BroadcastedDropout, Relu, Dense(d_model),
/// BroadcastedDropout.
pub fn feed_forward<B: Backend>(d_model: usize, d_ff: usize, dropout: f64, mode: Mode) -> Vec<Box<dyn Layer<B>>> {
    vec![
        Box::new(LayerNorm::new()),
        Box::new(Dense::new(d_ff)),
        Box::new(BroadcastedDropout::new(dropout, mode)),
        Box::new(Relu),
        Box::new(Dense::new(d_model)),
        Box::new(BroadcastedDropout::new(dropout, mode)),
    ]
}

/// The four reversible layers of one block.
#[allow(clippy::too_many_arguments)]
pub fn decoder_block<B: Backend>(
    d_model: usize,
    d_ff: usize,
    d_attention_key: usize,
    d_attention_value: usize,
    n_heads: usize,
    n_attention_chunks: usize,
    attention_type: AttentionType,
    dropout: f64,
    share_qk: bool,
    mode: Mode,
) -> Vec<Box<dyn ReversibleLayer<B>>> {
    let mut pre_attention: Vec<Box<dyn Layer<B>>> =
        vec![Box::new(Chunk::new(n_attention_chunks)), Box::new(LayerNorm::new())];
    pre_attention.extend(qkv_heads(n_heads, d_attention_key, d_attention_value, share_qk));

    let post_attention: Vec<Box<dyn Layer<B>>> = vec![
        Box::new(ComputeAttentionOutput::new(n_heads, d_model)),
        Box::new(Unchunk::new(n_attention_chunks)),
        Box::new(BroadcastedDropout::new(dropout, mode)),
    ];

    vec![
        Box::new(ReversibleAttentionHalfResidual::new(
            pre_attention,
            attention_type.fused(mode),
            post_attention,
        )),
        Box::new(ReversibleSwap),
        Box::new(ReversibleHalfResidual::new(feed_forward(d_model, d_ff, dropout, mode))),
        Box::new(ReversibleSwap),
    ]
}

/// Build the reversible language model.
///
/// Fails with `NotDivisible` when a list of attention types does not divide
/// `n_layers`.
pub fn reformer_lm<B: Backend>(cfg: &ReformerLmConfig) -> Result<Serial<B>> {
    let n_chunks = cfg.n_chunks.max(1);
    let kernels = cfg.attention_type.per_layer(cfg.n_layers)?;

    let mut layers: Vec<Box<dyn Layer<B>>> = Vec::new();
    if cfg.n_chunks > 0 {
        layers.push(Box::new(Concatenate::new(cfg.n_chunks, -1)));
    }
    layers.push(Box::new(ShiftRight::new(cfg.mode)));
    layers.push(Box::new(Embedding::new(cfg.d_model, cfg.vocab_size)));
    layers.push(Box::new(BroadcastedDropout::new(cfg.dropout, cfg.mode)));
    layers.push(Box::new(PositionalEncoding::new(cfg.max_len, cfg.dropout, cfg.mode)));
    layers.push(Box::new(Dup));

    let mut blocks: Vec<Box<dyn ReversibleLayer<B>>> = Vec::new();
    for kernel in kernels {
        blocks.extend(decoder_block(
            cfg.d_model,
            cfg.d_ff,
            cfg.d_attention_key,
            cfg.d_attention_value,
            cfg.n_heads,
            cfg.n_attention_chunks,
            kernel,
            cfg.dropout,
            cfg.share_qk,
            cfg.mode,
        ));
    }
    blocks.push(Box::new(SplitForOutput::new(n_chunks).with_axis(-2)));
    layers.push(Box::new(ReversibleSerial::new(blocks)));

    let head: Serial<B> = Serial::new(vec![
        Box::new(LayerNorm::new()),
        Box::new(BroadcastedDropout::new(cfg.dropout, cfg.mode)),
        Box::new(Dense::new(cfg.vocab_size)),
        Box::new(LogSoftmax::default()),
    ]);
    layers.push(Box::new(Map::new(Box::new(head), n_chunks, true)?));
    Ok(Serial::new(layers))
}
