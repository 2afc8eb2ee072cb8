// Models — config-to-topology builders
//
// Each builder is a pure function from a config struct to a `Serial` layer.
// Nothing is initialized here; wrap the result in a `Model` for that.

pub mod reformer;
pub mod transformer;

pub use reformer::reformer_lm;
pub use transformer::{transformer, transformer_decoder, transformer_encoder, transformer_lm};
