//! Error types for the rewrite passes.

use std::path::PathBuf;

use sgfuse_exec::ExecError;
use sgfuse_ir::IrError;

/// Errors from pattern matching and fusion.
#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    /// A node in a matched chain has a different element type than its root.
    #[error("cannot fuse '{node}' into '{root}': dtype {found} differs from {expected}")]
    DtypeMismatch {
        root: String,
        node: String,
        expected: String,
        found: String,
    },

    /// A node in a matched chain changes the shape of the root output.
    #[error("cannot fuse '{node}' into '{root}': {detail}")]
    ShapeMismatch {
        root: String,
        node: String,
        detail: String,
    },

    #[error(transparent)]
    Graph(#[from] IrError),
}

/// Errors during calibration data loading and collection.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("failed to read calibration file {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("calibration file {path} has {size} bytes, expected {expected}")]
    InvalidFileSize {
        path: PathBuf,
        size: usize,
        expected: usize,
    },

    #[error("no calibration samples found in {0}")]
    NoSamples(PathBuf),

    #[error("calibration batch shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Errors from the quantization rewriter.
#[derive(Debug, thiserror::Error)]
pub enum QuantizeError {
    /// A concat's inputs cannot share one range because some are not finite.
    #[error("cannot align scales of concat '{concat}': non-finite range on {}", edges.join(", "))]
    ScaleAlignment { concat: String, edges: Vec<String> },

    /// A calibrated range that cannot be turned into a scale.
    #[error("calibration range of '{edge}' is not finite")]
    InvalidRange { edge: String },

    /// A weight of a quantized node has no bound value.
    #[error("parameter '{0}' is not bound")]
    MissingParam(String),

    #[error(transparent)]
    Graph(#[from] IrError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}

/// Errors reported by [`crate::PassManager`].
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("pass '{pass}' failed: {source}")]
    Fusion {
        pass: String,
        #[source]
        source: FusionError,
    },

    #[error("pass '{pass}' failed: {source}")]
    Graph {
        pass: String,
        #[source]
        source: IrError,
    },
}
