//! Display implementations and text dump for debugging.

use std::fmt;

use crate::graph::{ComputeGraph, TensorInfo};
use crate::types::{Dimension, Scalar, ScalarKind, TensorShape};

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sint => write!(f, "sint"),
            Self::Uint => write!(f, "uint"),
            Self::Float => write!(f, "float"),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Sint => write!(f, "i{}", self.width * 8),
            ScalarKind::Uint => write!(f, "u{}", self.width * 8),
            ScalarKind::Float => write!(f, "f{}", self.width * 8),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(n) => write!(f, "{n}"),
            Self::Dynamic(Some(name)) => f.write_str(name),
            Self::Dynamic(None) => f.write_str("?"),
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: tensor<{}>{}", self.name, self.scalar, self.shape)
    }
}

/// Renders a graph as text, one node per line in topological order.
///
/// Cyclic graphs fall back to insertion order.
pub fn dump_graph(graph: &ComputeGraph) -> String {
    let mut out = String::new();

    out.push_str("Inputs:\n");
    for &e in &graph.inputs {
        if let Some(info) = graph.edge(e) {
            out.push_str(&format!("  {info}\n"));
        }
    }

    if !graph.params.is_empty() {
        out.push_str("\nParams:\n");
        for &e in &graph.params {
            if let Some(info) = graph.edge(e) {
                out.push_str(&format!("  {info}\n"));
            }
        }
    }

    out.push_str("\nNodes:\n");
    let order = graph
        .topological_order()
        .unwrap_or_else(|_| graph.nodes.iter().collect());
    for node in order {
        let args: Vec<&str> = node.inputs.iter().map(|&e| graph.edge_name(e)).collect();
        let outs: Vec<&str> = node.outputs.iter().map(|&e| graph.edge_name(e)).collect();
        out.push_str(&format!(
            "  {} = {} {}({})\n",
            outs.join(", "),
            node.name,
            node.op,
            args.join(", ")
        ));
    }

    out.push_str("\nOutputs:\n");
    for &e in &graph.outputs {
        out.push_str(&format!("  {}\n", graph.edge_name(e)));
    }
    out
}
