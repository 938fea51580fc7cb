use thiserror::Error;

/// Errors raised by the operation model.
///
/// All three structural variants are client input defects: the operation
/// is rejected and never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// Retain + Delete lengths do not cover the document the operation
    /// claims to be defined against, or a component has zero length.
    #[error("malformed operation: expected input length {expected}, got {actual}")]
    MalformedOperation { expected: usize, actual: usize },

    /// The operation has no components at all.
    #[error("operation has no components")]
    EmptyOperation,

    /// `compose(a, b)` where `b` does not start from `a`'s output, or
    /// `transform(a, b)` where the two are not defined on the same base.
    #[error("incompatible operations: expected length {expected}, got {actual}")]
    IncompatibleOperation { expected: usize, actual: usize },

    /// Wire bytes could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(String),
}
