// Model configurations
//
// Plain structs with Default and builder-style setters. Every struct also
// deserializes with missing fields taken from Default, so a JSON document
// only needs to name what it changes:
//
//   { "vocab_size": 256, "n_layers": 2, "attention_type": "memory_efficient_causal" }
//
// Shared defaults: d_model 512, d_ff 2048, n_layers 6, n_heads 8,
// dropout 0.1, max_len 2048, mode train.

use serde::{Deserialize, Serialize};
use strand_core::{Error, Result};
use strand_nn::{AttentionType, Mode};

pub use crate::backend::BackendConfig;

const D_MODEL: usize = 512;
const D_FF: usize = 2048;
const N_LAYERS: usize = 6;
const N_HEADS: usize = 8;
const DROPOUT: f64 = 0.1;
const MAX_LEN: usize = 2048;
const VOCAB_SIZE: usize = 256;

/// One attention kernel for every layer, or a list cycled over the layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttentionTypes {
    One(AttentionType),
    Cycle(Vec<AttentionType>),
}

impl Default for AttentionTypes {
    fn default() -> Self {
        AttentionTypes::One(AttentionType::default())
    }
}

impl From<AttentionType> for AttentionTypes {
    fn from(t: AttentionType) -> Self {
        AttentionTypes::One(t)
    }
}

impl From<Vec<AttentionType>> for AttentionTypes {
    fn from(ts: Vec<AttentionType>) -> Self {
        AttentionTypes::Cycle(ts)
    }
}

impl AttentionTypes {
    /// The kernel of each of `n_layers` layers. A cycle must divide
    /// `n_layers` evenly.
    pub fn per_layer(&self, n_layers: usize) -> Result<Vec<AttentionType>> {
        match self {
            AttentionTypes::One(t) => Ok(vec![*t; n_layers]),
            AttentionTypes::Cycle(ts) if ts.is_empty() => Err(Error::msg("attention_type: empty list")),
            AttentionTypes::Cycle(ts) => {
                if n_layers % ts.len() != 0 {
                    return Err(Error::not_divisible("n_layers by the attention_type list", n_layers, ts.len()));
                }
                Ok((0..n_layers).map(|i| ts[i % ts.len()]).collect())
            }
        }
    }
}

/// Defines builder-style setters, `with_x => x: T` per field.
macro_rules! setters {
    ($ty:ty { $($setter:ident => $field:ident: $t:ty),* $(,)? }) => {
        impl $ty {
            $(
                #[doc = concat!("Set `", stringify!($field), "`.")]
                pub fn $setter(mut self, value: $t) -> Self {
                    self.$field = value;
                    self
                }
            )*
        }
    };
}

/// Token classifier: encoder stack, mean over length, dense head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerEncoderConfig {
    pub vocab_size: usize,
    pub n_classes: usize,
    pub d_model: usize,
    pub d_ff: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub dropout: f64,
    pub max_len: usize,
    pub mode: Mode,
}

impl Default for TransformerEncoderConfig {
    fn default() -> Self {
        TransformerEncoderConfig {
            vocab_size: VOCAB_SIZE,
            n_classes: 10,
            d_model: D_MODEL,
            d_ff: D_FF,
            n_layers: N_LAYERS,
            n_heads: N_HEADS,
            dropout: DROPOUT,
            max_len: MAX_LEN,
            mode: Mode::Train,
        }
    }
}

setters!(TransformerEncoderConfig {
    with_vocab_size => vocab_size: usize,
    with_n_classes => n_classes: usize,
    with_d_model => d_model: usize,
    with_d_ff => d_ff: usize,
    with_n_layers => n_layers: usize,
    with_n_heads => n_heads: usize,
    with_dropout => dropout: f64,
    with_max_len => max_len: usize,
    with_mode => mode: Mode,
});

/// Causal decoder stack over embedded tokens, or over continuous inputs
/// when `vocab_size` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerDecoderConfig {
    pub vocab_size: Option<usize>,
    pub d_model: usize,
    pub d_ff: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Per-head key depth; `d_model / n_heads` when unset.
    pub d_attention_key: Option<usize>,
    /// Per-head value depth; `d_model / n_heads` when unset.
    pub d_attention_value: Option<usize>,
    pub attention_type: AttentionType,
    pub dropout: f64,
    pub share_qk: bool,
    pub max_len: usize,
    pub mode: Mode,
}

impl Default for TransformerDecoderConfig {
    fn default() -> Self {
        TransformerDecoderConfig {
            vocab_size: None,
            d_model: D_MODEL,
            d_ff: D_FF,
            n_layers: N_LAYERS,
            n_heads: N_HEADS,
            d_attention_key: None,
            d_attention_value: None,
            attention_type: AttentionType::DotProductCausal,
            dropout: DROPOUT,
            share_qk: false,
            max_len: MAX_LEN,
            mode: Mode::Train,
        }
    }
}

setters!(TransformerDecoderConfig {
    with_vocab_size => vocab_size: Option<usize>,
    with_d_model => d_model: usize,
    with_d_ff => d_ff: usize,
    with_n_layers => n_layers: usize,
    with_n_heads => n_heads: usize,
    with_d_attention_key => d_attention_key: Option<usize>,
    with_d_attention_value => d_attention_value: Option<usize>,
    with_attention_type => attention_type: AttentionType,
    with_dropout => dropout: f64,
    with_share_qk => share_qk: bool,
    with_max_len => max_len: usize,
    with_mode => mode: Mode,
});

/// Decoder-only language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerLmConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_ff: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_attention_key: Option<usize>,
    pub d_attention_value: Option<usize>,
    pub attention_type: AttentionType,
    pub dropout: f64,
    pub share_qk: bool,
    pub max_len: usize,
    /// Number of input chunks; 0 takes one unchunked tensor.
    pub n_chunks: usize,
    pub mode: Mode,
}

impl Default for TransformerLmConfig {
    fn default() -> Self {
        TransformerLmConfig {
            vocab_size: VOCAB_SIZE,
            d_model: D_MODEL,
            d_ff: D_FF,
            n_layers: N_LAYERS,
            n_heads: N_HEADS,
            d_attention_key: None,
            d_attention_value: None,
            attention_type: AttentionType::DotProductCausal,
            dropout: DROPOUT,
            share_qk: false,
            max_len: MAX_LEN,
            n_chunks: 0,
            mode: Mode::Train,
        }
    }
}

setters!(TransformerLmConfig {
    with_vocab_size => vocab_size: usize,
    with_d_model => d_model: usize,
    with_d_ff => d_ff: usize,
    with_n_layers => n_layers: usize,
    with_n_heads => n_heads: usize,
    with_d_attention_key => d_attention_key: Option<usize>,
    with_d_attention_value => d_attention_value: Option<usize>,
    with_attention_type => attention_type: AttentionType,
    with_dropout => dropout: f64,
    with_share_qk => share_qk: bool,
    with_max_len => max_len: usize,
    with_n_chunks => n_chunks: usize,
    with_mode => mode: Mode,
});

/// Encoder-decoder sequence model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    pub input_vocab_size: usize,
    /// Target vocabulary; the source vocabulary when unset.
    pub output_vocab_size: Option<usize>,
    pub d_model: usize,
    pub d_ff: usize,
    pub n_encoder_layers: usize,
    pub n_decoder_layers: usize,
    pub n_heads: usize,
    pub dropout: f64,
    pub max_len: usize,
    pub mode: Mode,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        TransformerConfig {
            input_vocab_size: VOCAB_SIZE,
            output_vocab_size: None,
            d_model: D_MODEL,
            d_ff: D_FF,
            n_encoder_layers: N_LAYERS,
            n_decoder_layers: N_LAYERS,
            n_heads: N_HEADS,
            dropout: DROPOUT,
            max_len: MAX_LEN,
            mode: Mode::Train,
        }
    }
}

setters!(TransformerConfig {
    with_input_vocab_size => input_vocab_size: usize,
    with_output_vocab_size => output_vocab_size: Option<usize>,
    with_d_model => d_model: usize,
    with_d_ff => d_ff: usize,
    with_n_encoder_layers => n_encoder_layers: usize,
    with_n_decoder_layers => n_decoder_layers: usize,
    with_n_heads => n_heads: usize,
    with_dropout => dropout: f64,
    with_max_len => max_len: usize,
    with_mode => mode: Mode,
});

/// Reversible language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReformerLmConfig {
    pub vocab_size: usize,
    /// Depth of each of the two reversible streams.
    pub d_model: usize,
    pub d_ff: usize,
    pub d_attention_key: usize,
    pub d_attention_value: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub dropout: f64,
    pub max_len: usize,
    /// Number of input (and output) chunks; 0 means one unchunked tensor.
    pub n_chunks: usize,
    /// Attention runs on the batch split this many ways along length.
    pub n_attention_chunks: usize,
    pub attention_type: AttentionTypes,
    pub share_qk: bool,
    pub mode: Mode,
}

impl Default for ReformerLmConfig {
    fn default() -> Self {
        ReformerLmConfig {
            vocab_size: VOCAB_SIZE,
            d_model: D_MODEL,
            d_ff: D_FF,
            d_attention_key: 64,
            d_attention_value: 64,
            n_layers: N_LAYERS,
            n_heads: N_HEADS,
            dropout: DROPOUT,
            max_len: MAX_LEN,
            n_chunks: 0,
            n_attention_chunks: 1,
            attention_type: AttentionTypes::default(),
            share_qk: false,
            mode: Mode::Train,
        }
    }
}

setters!(ReformerLmConfig {
    with_vocab_size => vocab_size: usize,
    with_d_model => d_model: usize,
    with_d_ff => d_ff: usize,
    with_d_attention_key => d_attention_key: usize,
    with_d_attention_value => d_attention_value: usize,
    with_n_layers => n_layers: usize,
    with_n_heads => n_heads: usize,
    with_dropout => dropout: f64,
    with_max_len => max_len: usize,
    with_n_chunks => n_chunks: usize,
    with_n_attention_chunks => n_attention_chunks: usize,
    with_share_qk => share_qk: bool,
    with_mode => mode: Mode,
});

impl ReformerLmConfig {
    pub fn with_attention_type(mut self, value: impl Into<AttentionTypes>) -> Self {
        self.attention_type = value.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = TransformerLmConfig::default();
        assert_eq!((c.d_model, c.d_ff, c.n_layers, c.n_heads), (512, 2048, 6, 8));
        assert_eq!(c.mode, Mode::Train);
        assert_eq!(ReformerLmConfig::default().d_attention_key, 64);
    }

    #[test]
    fn test_partial_json() -> serde_json::Result<()> {
        let c: ReformerLmConfig =
            serde_json::from_str(r#"{"n_layers": 4, "mode": "eval", "attention_type": ["dot_product_causal", "memory_efficient_causal"]}"#)?;
        assert_eq!(c.n_layers, 4);
        assert_eq!(c.mode, Mode::Eval);
        assert_eq!(c.d_model, 512);
        assert_eq!(
            c.attention_type,
            AttentionTypes::Cycle(vec![AttentionType::DotProductCausal, AttentionType::MemoryEfficientCausal])
        );

        let c: ReformerLmConfig = serde_json::from_str(r#"{"attention_type": "memory_efficient_causal"}"#)?;
        assert_eq!(c.attention_type, AttentionTypes::One(AttentionType::MemoryEfficientCausal));
        Ok(())
    }

    #[test]
    fn test_attention_cycle() -> Result<()> {
        let cycle = AttentionTypes::from(vec![AttentionType::DotProductCausal, AttentionType::MemoryEfficientCausal]);
        let kinds = cycle.per_layer(4)?;
        assert_eq!(kinds[2], AttentionType::DotProductCausal);
        assert_eq!(kinds[3], AttentionType::MemoryEfficientCausal);
        assert!(matches!(cycle.per_layer(3), Err(Error::NotDivisible { .. })));
        assert!(AttentionTypes::Cycle(vec![]).per_layer(2).is_err());
        Ok(())
    }

    #[test]
    fn test_setters_chain() {
        let c = TransformerConfig::default()
            .with_n_encoder_layers(1)
            .with_output_vocab_size(Some(30))
            .with_dropout(0.0);
        assert_eq!(c.n_encoder_layers, 1);
        assert_eq!(c.output_vocab_size, Some(30));
        assert_eq!(c.dropout, 0.0);
    }
}
