// Transformer — encoder, decoder, language model and encoder-decoder
//
// Every block is pre-norm: LayerNorm, sublayer, dropout, wrapped in a
// Residual. Stack layouts (top of stack first):
//
//   transformer_encoder   toks                 -> log-probs over n_classes
//   transformer_decoder   toks | vecs          -> vecs
//   transformer_lm        toks (or n_chunks)   -> log-probs over vocab (or n_chunks)
//   transformer           toks_e toks_d        -> log-probs  toks_d
//
// encoder_block   (vecs, mask)                 -> (vecs, mask)
// decoder_block   vecs                         -> vecs
// encoder_decoder (vecs_d, mask, vecs_e)       -> (vecs_d, mask, vecs_e)

use strand_core::backend::Backend;
use strand_core::{Error, Result};
use strand_nn::{
    attention, attention_qkv, causal_attention, AttentionType, Concatenate, Dense, Drop, Dropout, Dup, Embedding,
    EncoderDecoderMask, Layer, LayerNorm, LogSoftmax, Mean, Mode, NoOp, PaddingMask, Parallel, PositionalEncoding,
    Relu, Residual, Serial, ShiftRight, Split, Swap,
};

use crate::config::{TransformerConfig, TransformerDecoderConfig, TransformerEncoderConfig, TransformerLmConfig};

type Layers<B> = Vec<Box<dyn Layer<B>>>;

/// `d_model / n_heads`, which must be exact.
pub(crate) fn head_depth(d_model: usize, n_heads: usize) -> Result<usize> {
    if n_heads == 0 || d_model % n_heads != 0 {
        return Err(Error::not_divisible("d_model by n_heads", d_model, n_heads));
    }
    Ok(d_model / n_heads)
}

/// Token embedding, dropout and sinusoidal positions (no dropout on the
/// positions themselves).
fn embedder<B: Backend>(vocab_size: usize, d_model: usize, dropout: f64, max_len: usize, mode: Mode) -> Serial<B> {
    Serial::new(vec![
        Box::new(Embedding::new(d_model, vocab_size)),
        Box::new(Dropout::new(dropout, mode)),
        Box::new(PositionalEncoding::new(max_len, 0.0, mode)),
    ])
}

/// Pre-norm feed-forward: LayerNorm, Dense(d_ff), Relu, Dropout,
/// Dense(d_model), Dropout.
pub fn feed_forward<B: Backend>(d_model: usize, d_ff: usize, dropout: f64, mode: Mode) -> Serial<B> {
    Serial::new(vec![
        Box::new(LayerNorm::new()),
        Box::new(Dense::new(d_ff)),
        Box::new(Relu),
        Box::new(Dropout::new(dropout, mode)),
        Box::new(Dense::new(d_model)),
        Box::new(Dropout::new(dropout, mode)),
    ])
}

/// Self-attention over padded tokens, then feed-forward.
pub fn encoder_block<B: Backend>(d_model: usize, d_ff: usize, n_heads: usize, dropout: f64, mode: Mode) -> Serial<B> {
    let self_attention: Layers<B> = vec![
        Box::new(LayerNorm::new()),
        Box::new(attention(d_model, n_heads, dropout, mode)),
        Box::new(Dropout::new(dropout, mode)),
    ];
    Serial::new(vec![
        Box::new(Residual::new(self_attention)),
        Box::new(Residual::new(vec![Box::new(feed_forward(d_model, d_ff, dropout, mode))])),
    ])
}

/// Causal self-attention, then feed-forward.
#[allow(clippy::too_many_arguments)]
pub fn decoder_block<B: Backend>(
    d_model: usize,
    d_ff: usize,
    n_heads: usize,
    d_attention_key: usize,
    d_attention_value: usize,
    attention_type: AttentionType,
    dropout: f64,
    share_qk: bool,
    mode: Mode,
) -> Serial<B> {
    let self_attention: Layers<B> = vec![
        Box::new(LayerNorm::new()),
        Box::new(causal_attention(
            d_model,
            n_heads,
            d_attention_key,
            d_attention_value,
            attention_type,
            share_qk,
            mode,
        )),
        Box::new(Dropout::new(dropout, mode)),
    ];
    Serial::new(vec![
        Box::new(Residual::new(self_attention)),
        Box::new(Residual::new(vec![Box::new(feed_forward(d_model, d_ff, dropout, mode))])),
    ])
}

/// Decoder block that also attends to the encoder's output.
pub fn encoder_decoder<B: Backend>(
    d_model: usize,
    d_ff: usize,
    n_heads: usize,
    dropout: f64,
    mode: Mode,
) -> Result<Serial<B>> {
    let d_head = head_depth(d_model, n_heads)?;
    let self_attention: Layers<B> = vec![
        Box::new(LayerNorm::new()),
        Box::new(causal_attention(
            d_model,
            n_heads,
            d_head,
            d_head,
            AttentionType::DotProductCausal,
            false,
            mode,
        )),
        Box::new(Dropout::new(dropout, mode)),
    ];
    //                                                  vecs_d        mask   vecs_e
    let to_encoder: Layers<B> = vec![
        Box::new(LayerNorm::new()),
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(NoOp), Box::new(Dup)])), // vecs_d mask vecs_e vecs_e
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(Swap)])), //               vecs_d vecs_e mask vecs_e
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(Dup)])), //                vecs_d vecs_e vecs_e mask vecs_e
        Box::new(attention_qkv(d_model, n_heads, dropout, mode)), //                    vecs_d mask vecs_e
        Box::new(Dropout::new(dropout, mode)),
    ];
    Ok(Serial::new(vec![
        Box::new(Residual::new(self_attention)),
        Box::new(Residual::new(to_encoder)),
        Box::new(Residual::new(vec![Box::new(feed_forward(d_model, d_ff, dropout, mode))])),
    ]))
}

/// Classifies token sequences: encoder blocks, mean over length, dense
/// head, log-softmax.
pub fn transformer_encoder<B: Backend>(cfg: &TransformerEncoderConfig) -> Result<Serial<B>> {
    head_depth(cfg.d_model, cfg.n_heads)?;
    let mut layers: Layers<B> = vec![
        Box::new(Dup),
        Box::new(Parallel::new(vec![
            Box::new(embedder(cfg.vocab_size, cfg.d_model, cfg.dropout, cfg.max_len, cfg.mode)),
            Box::new(PaddingMask::default()),
        ])),
    ];
    for _ in 0..cfg.n_layers {
        layers.push(Box::new(encoder_block(cfg.d_model, cfg.d_ff, cfg.n_heads, cfg.dropout, cfg.mode)));
    }
    let head: Layers<B> = vec![
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(Drop)])),
        Box::new(LayerNorm::new()),
        Box::new(Mean::new(1)),
        Box::new(Dense::new(cfg.n_classes)),
        Box::new(LogSoftmax::default()),
    ];
    layers.extend(head);
    Ok(Serial::new(layers))
}

/// Causal decoder stack without a head or right shift: the output at step t
/// sees inputs up to and including t.
pub fn transformer_decoder<B: Backend>(cfg: &TransformerDecoderConfig) -> Result<Serial<B>> {
    let d_head = head_depth(cfg.d_model, cfg.n_heads)?;
    let input_layer: Box<dyn Layer<B>> = match cfg.vocab_size {
        Some(vocab_size) => Box::new(Embedding::new(cfg.d_model, vocab_size)),
        None => Box::new(Dense::new(cfg.d_model)),
    };
    let mut layers: Layers<B> = vec![
        input_layer,
        Box::new(Dropout::new(cfg.dropout, cfg.mode)),
        Box::new(PositionalEncoding::new(cfg.max_len, 0.0, cfg.mode)),
    ];
    for _ in 0..cfg.n_layers {
        layers.push(Box::new(decoder_block(
            cfg.d_model,
            cfg.d_ff,
            cfg.n_heads,
            cfg.d_attention_key.unwrap_or(d_head),
            cfg.d_attention_value.unwrap_or(d_head),
            cfg.attention_type,
            cfg.dropout,
            cfg.share_qk,
            cfg.mode,
        )));
    }
    layers.push(Box::new(LayerNorm::new()));
    Ok(Serial::new(layers))
}

/// Decoder-only language model over right-shifted tokens.
///
/// With `n_chunks > 0` it takes that many token chunks, concatenated on
/// length, and returns the log-probs split back the same way.
pub fn transformer_lm<B: Backend>(cfg: &TransformerLmConfig) -> Result<Serial<B>> {
    let d_head = head_depth(cfg.d_model, cfg.n_heads)?;
    let mut layers: Layers<B> = Vec::new();
    if cfg.n_chunks > 0 {
        layers.push(Box::new(Concatenate::new(cfg.n_chunks, -1)));
    }
    layers.push(Box::new(ShiftRight::new(cfg.mode)));
    layers.push(Box::new(embedder(cfg.vocab_size, cfg.d_model, cfg.dropout, cfg.max_len, cfg.mode)));
    for _ in 0..cfg.n_layers {
        layers.push(Box::new(decoder_block(
            cfg.d_model,
            cfg.d_ff,
            cfg.n_heads,
            cfg.d_attention_key.unwrap_or(d_head),
            cfg.d_attention_value.unwrap_or(d_head),
            cfg.attention_type,
            cfg.dropout,
            cfg.share_qk,
            cfg.mode,
        )));
    }
    layers.push(Box::new(LayerNorm::new()));
    layers.push(Box::new(Dense::new(cfg.vocab_size)));
    layers.push(Box::new(LogSoftmax::default()));
    if cfg.n_chunks > 0 {
        layers.push(Box::new(Split::new(cfg.n_chunks, -2)));
    }
    Ok(Serial::new(layers))
}

/// Encoder-decoder model over `(source tokens, target tokens)`.
///
/// Returns the target log-probs with the target tokens left underneath for
/// the loss.
///
/// Embeddings are never tied: with `output_vocab_size` unset, source and
/// target still get their own `input_vocab_size` tables, trained
/// independently.
pub fn transformer<B: Backend>(cfg: &TransformerConfig) -> Result<Serial<B>> {
    head_depth(cfg.d_model, cfg.n_heads)?;
    let output_vocab_size = cfg.output_vocab_size.unwrap_or(cfg.input_vocab_size);

    let mut encoder: Layers<B> = vec![
        Box::new(Dup),
        Box::new(Parallel::new(vec![
            Box::new(embedder(cfg.input_vocab_size, cfg.d_model, cfg.dropout, cfg.max_len, cfg.mode)),
            Box::new(PaddingMask::default()),
        ])),
    ];
    for _ in 0..cfg.n_encoder_layers {
        encoder.push(Box::new(encoder_block(cfg.d_model, cfg.d_ff, cfg.n_heads, cfg.dropout, cfg.mode)));
    }
    encoder.push(Box::new(LayerNorm::new()));
    encoder.push(Box::new(Swap));

    let mut layers: Layers<B> = vec![
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(Dup)])), // toks_e toks_d toks_d
        Box::new(Swap),                                               // toks_d toks_e toks_d
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(Serial::new(encoder))])), // toks_d mask vecs_e toks_d
        Box::new(ShiftRight::new(cfg.mode)),
        Box::new(embedder(output_vocab_size, cfg.d_model, cfg.dropout, cfg.max_len, cfg.mode)),
        Box::new(Dup),
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(EncoderDecoderMask)])), // vecs_d mask vecs_e toks_d
    ];
    for _ in 0..cfg.n_decoder_layers {
        layers.push(Box::new(encoder_decoder(cfg.d_model, cfg.d_ff, cfg.n_heads, cfg.dropout, cfg.mode)?));
    }
    let head: Layers<B> = vec![
        Box::new(Parallel::new(vec![Box::new(NoOp), Box::new(Drop), Box::new(Drop)])),
        Box::new(LayerNorm::new()),
        Box::new(Dense::new(output_vocab_size)),
        Box::new(LogSoftmax::default()),
    ];
    layers.extend(head);
    Ok(Serial::new(layers))
}
