use thiserror::Error;

/// Errors raised anywhere in the trace → quantize → optimize → convert pipeline.
///
/// Each failure aborts the stage that raised it; nothing is retried.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported operator `{op}` (in scope `{scope}`)")]
    UnsupportedOperator { op: String, scope: String },

    #[error("node {node} ({op}) in scope `{scope}` cannot be quantized: {reason}")]
    NonQuantizableOperator {
        node: usize,
        op: String,
        scope: String,
        reason: String,
    },

    #[error("input {index}: expected shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        index: usize,
        expected: Vec<i64>,
        actual: Vec<usize>,
    },

    #[error("node {node} ({op}) in scope `{scope}` has no TFLite encoding: {reason}")]
    UnsupportedOperatorForTarget {
        node: usize,
        op: String,
        scope: String,
        reason: String,
    },

    #[error("node {node} ({op}) in scope `{scope}`: cannot resolve layout: {reason}")]
    UnsupportedLayout {
        node: usize,
        op: String,
        scope: String,
        reason: String,
    },

    #[error("invalid arguments to `{op}` (in scope `{scope}`): {reason}")]
    InvalidArgument {
        op: String,
        scope: String,
        reason: String,
    },

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid tensor: {0}")]
    InvalidTensor(String),

    #[error("malformed model: {0}")]
    MalformedModel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<flatbuffers::InvalidFlatbuffer> for Error {
    fn from(err: flatbuffers::InvalidFlatbuffer) -> Self {
        Error::MalformedModel(err.to_string())
    }
}
