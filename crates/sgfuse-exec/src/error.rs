//! Error types for graph execution.

use sgfuse_ir::IrError;

/// Failure inside a single kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Operand shapes cannot be combined.
    #[error("{0}")]
    Shape(String),

    /// ndarray rejected a reshape or view.
    #[error(transparent)]
    Layout(#[from] ndarray::ShapeError),

    /// A float kernel received a fixed-point operand.
    #[error("operand {index} is quantized, expected f32")]
    UnexpectedQuantized {
        /// Input slot of the offending operand.
        index: usize,
    },

    /// A dequantizing kernel received a float operand.
    #[error("operand {index} is f32, expected a quantized tensor")]
    ExpectedQuantized {
        /// Input slot of the offending operand.
        index: usize,
    },
}

/// Errors raised while executing a graph.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The graph itself is malformed.
    #[error(transparent)]
    Graph(#[from] IrError),

    /// No feed or parameter was bound for a tensor.
    #[error("no value bound for tensor `{0}`")]
    Unbound(String),

    /// A feed does not match the declared input shape.
    #[error("feed `{name}` has shape {found:?}, graph declares {expected:?}")]
    FeedShape {
        /// Input name.
        name: String,
        /// Declared static shape.
        expected: Vec<usize>,
        /// Shape of the fed array.
        found: Vec<usize>,
    },

    /// A kernel failed.
    #[error("node `{node}` ({op_type}): {source}")]
    Kernel {
        /// Failing node.
        node: String,
        /// Its operator type.
        op_type: String,
        /// Underlying kernel failure.
        source: KernelError,
    },
}
