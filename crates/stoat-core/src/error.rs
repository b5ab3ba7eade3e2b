use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// This enum covers both compile-time failures (scheduling, shape inference,
/// layout planning) and run-time failures reported by the compute backend.
/// Compile-time errors abort the whole compilation: no partial graph is usable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A requested output name cannot be produced from the given nodes,
    /// declared inputs, or parameters.
    #[error("unresolved output: no node produces \"{name}\" and it is not a declared input")]
    UnresolvedOutput { name: String },

    /// Forward layering made no progress: the remaining nodes form a cycle
    /// or depend on values that can never become available.
    #[error("dependency cycle: staging cannot make forward progress")]
    Cycle,

    /// No implementation exists for this operator kind.
    #[error("unimplemented operator: {op}")]
    Unimplemented { op: String },

    /// An attribute value violates a constraint the implementation assumes.
    #[error("unsupported attribute \"{attr}\" on node \"{node}\": {reason}")]
    UnsupportedAttribute {
        node: String,
        attr: String,
        reason: String,
    },

    /// The reshape target is inconsistent with the input element count.
    #[error("invalid reshape: {reason}")]
    InvalidReshape { reason: String },

    /// A name referenced as an input has no producer and is not a declared
    /// input or parameter.
    #[error("missing value: \"{name}\" has no producer and is not a declared input or parameter")]
    MissingValue { name: String },

    /// The compute backend failed to build or execute a primitive.
    #[error("backend error on node \"{node}\" ({op}): {msg}")]
    Backend { node: String, op: String, msg: String },

    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between tensors in one operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Element count mismatch when creating a buffer from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Stoat.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
