use crate::shape::Shape;

/// All errors that can occur within strand.
///
/// One enum covers tensor-level failures (shape, dtype, bounds), layer-algebra
/// failures (arity, missing random keys, uninitialized parameters) and
/// configuration failures (unknown backends, non-divisible chunk counts).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., trying to add [2,3] + [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors in a binary operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: i64, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Tried to access a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: {lhs} @ {rhs}")]
    MatmulShapeMismatch { lhs: Shape, rhs: Shape },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// A size that must split evenly does not (chunks, devices, attention types).
    #[error("{what}: {size} is not divisible by {n}")]
    NotDivisible { what: String, size: usize, n: usize },

    /// Map was asked to share one set of parameters across differently shaped inputs.
    #[error(
        "Map layer can only be applied to elements with the same shapes: shape {shape} vs first shape {first}"
    )]
    MapShapeMismatch { shape: Shape, first: Shape },

    /// A stochastic layer ran without a random key.
    #[error("{layer} requires an rng key")]
    MissingRng { layer: String },

    /// Dropout rates must lie in [0, 1).
    #[error("dropout rate ({rate}) must be lower than 1")]
    InvalidDropoutRate { rate: f64 },

    /// A layer received the wrong number of inputs.
    #[error("{layer}: expected {expected} inputs, got {got}")]
    ArityMismatch {
        layer: String,
        expected: usize,
        got: usize,
    },

    /// A layer was called with parameters that do not match its structure.
    #[error("{layer}: parameters are not initialized")]
    Uninitialized { layer: String },

    /// The requested backend provider is not registered.
    #[error("unknown backend '{name}'")]
    UnknownBackend { name: String },

    /// The active backend provider does not implement an operation.
    #[error("backend '{backend}' does not support {op}")]
    Unsupported { backend: String, op: String },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn not_divisible(what: impl Into<String>, size: usize, n: usize) -> Self {
        Error::NotDivisible {
            what: what.into(),
            size,
            n,
        }
    }
}

/// Convenience Result type used throughout strand.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
