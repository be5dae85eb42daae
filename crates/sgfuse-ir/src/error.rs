//! Error types for the sgfuse graph model.

/// Errors that can occur when constructing or validating a graph.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// An edge id does not belong to this graph.
    #[error("node `{node}` references unknown edge #{edge}")]
    UnknownEdge { node: String, edge: u32 },

    /// Two nodes or two edges share a name.
    #[error("duplicate {what} name `{name}`")]
    DuplicateName { what: &'static str, name: String },

    /// An edge already has a producer.
    #[error("edge `{edge}` is already produced by node `{producer}`")]
    MultipleProducers { edge: String, producer: String },

    /// The graph is not a DAG.
    #[error("graph contains a cycle ({visited} of {total} nodes ordered)")]
    Cycle { visited: usize, total: usize },

    /// An operator received the wrong number of inputs.
    #[error("node `{node}` expects {expected} inputs, found {found}")]
    Arity {
        node: String,
        expected: usize,
        found: usize,
    },

    /// Input shapes are incompatible with the operator.
    #[error("shape mismatch at `{node}`: {detail}")]
    ShapeMismatch { node: String, detail: String },

    /// Input dtypes are incompatible with the operator.
    #[error("dtype mismatch at `{node}`: expected {expected}, found {found}")]
    DtypeMismatch {
        node: String,
        expected: String,
        found: String,
    },

    /// An operator kind or attribute could not be decoded.
    #[error("invalid attribute `{attr}` for `{op_type}`: {detail}")]
    InvalidAttribute {
        op_type: String,
        attr: String,
        detail: String,
    },

    /// An operator type string is not known.
    #[error("unknown operator type `{0}`")]
    UnknownOp(String),
}
