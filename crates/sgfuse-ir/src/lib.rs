//! sgfuse graph model.
//!
//! A dataflow graph of tensor operators with typed operator kinds, a string
//! attribute view, shape inference and the fixed-point arithmetic shared by
//! the quantization passes and the executor.

mod attr;
mod builder;
mod display;
mod error;
pub mod graph;
mod op;
mod quant;
pub mod shape;
mod types;

pub use attr::{AttrValue, Attributes};
pub use builder::BATCH_NORM_PARAMS;
pub use display::dump_graph;
pub use error::IrError;
pub use graph::{ComputeGraph, EdgeId, GraphNode, NodeId, TensorInfo};
pub use op::{
    ActType, BatchNormParams, ConvParams, FcParams, FusedConvParams, FusedFcParams, OpKind,
    PoolParams, PoolType, QuantizedOutput,
};
pub use quant::{CalibRange, QuantDtype, QuantizationParams};
pub use types::{Bytes, Dimension, Scalar, ScalarKind, TensorShape};
