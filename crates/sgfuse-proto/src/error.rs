//! Error types for model serialization.

use std::path::PathBuf;

use sgfuse_ir::IrError;

/// Errors raised while reading or writing a serialized model.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed model: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("model has no graph")]
    MissingGraph,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(i64),

    #[error("unknown element type code {code} for '{name}'")]
    UnknownDataType { name: String, code: i32 },

    #[error("scalar type {0} cannot be serialized")]
    UnsupportedScalar(String),

    #[error("node '{node}' references undeclared tensor '{name}'")]
    UndeclaredTensor { node: String, name: String },

    #[error("node '{node}' must produce exactly one tensor, found {found}")]
    OutputCount { node: String, found: usize },

    #[error("invalid tensor '{name}': {detail}")]
    InvalidTensor { name: String, detail: String },

    #[error("attribute '{attr}' of node '{node}' has no value")]
    EmptyAttribute { node: String, attr: String },

    #[error(transparent)]
    Graph(#[from] IrError),
}
