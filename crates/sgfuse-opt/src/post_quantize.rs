//! Folding of quantized tails.
//!
//! - `quantized_X (int32) ─► requantize` becomes `quantized_X` emitting the
//!   requantized type directly, exposing the calibration range.
//! - With [`QuantizeConfig::fc_float_output`], `quantized_fc ─► dequantize`
//!   becomes `quantized_fc` with `enable_float_output`.

use std::collections::HashSet;

use sgfuse_ir::{ComputeGraph, GraphNode, NodeId, OpKind, QuantizedOutput};

use crate::config::QuantizeConfig;
use crate::error::QuantizeError;

/// Return a copy of `graph` with quantized tails folded.
pub fn fold_quantized(graph: &ComputeGraph, config: &QuantizeConfig) -> Result<ComputeGraph, QuantizeError> {
    let mut out = graph.clone();
    let folded = fold(&mut out, |node, next| match (&node.op, &next.op) {
        (
            OpKind::Quantized {
                inner,
                output: QuantizedOutput::Int32,
            },
            OpKind::Requantize { out_type, range },
        ) => Some(OpKind::Quantized {
            inner: inner.clone(),
            output: QuantizedOutput::Requantized {
                out_type: *out_type,
                range: *range,
            },
        }),
        _ => None,
    });
    log::debug!("post-quantize: folded {folded} requantize nodes");

    if config.fc_float_output {
        let folded = fold(&mut out, |node, next| match (&node.op, &next.op) {
            (OpKind::Quantized { inner, output }, OpKind::Dequantize)
                if *output != QuantizedOutput::Float
                    && matches!(
                        **inner,
                        OpKind::FullyConnected(_) | OpKind::FusedFullyConnected(_)
                    ) =>
            {
                Some(OpKind::Quantized {
                    inner: inner.clone(),
                    output: QuantizedOutput::Float,
                })
            }
            _ => None,
        });
        log::debug!("post-quantize: {folded} fully-connected nodes emit float");
    }

    out.validate()?;
    Ok(out)
}

/// Merge every node with its sole consumer when `rule` yields a new op.
///
/// The merged node keeps its own name and takes over the consumer's output
/// edge. Returns the number of merges.
fn fold(
    graph: &mut ComputeGraph,
    rule: impl Fn(&GraphNode, &GraphNode) -> Option<OpKind>,
) -> usize {
    let mut rewrites: Vec<(NodeId, OpKind, NodeId)> = Vec::new();
    let mut consumed: HashSet<NodeId> = HashSet::new();
    let mut producers: HashSet<NodeId> = HashSet::new();
    for node in &graph.nodes {
        let edge = node.output();
        if graph.fan_out(edge) != 1 {
            continue;
        }
        let consumers = graph.edge_consumers(edge);
        let [next] = consumers.as_slice() else {
            continue;
        };
        if consumed.contains(&node.id) || producers.contains(&next.id) {
            continue;
        }
        if let Some(op) = rule(node, next) {
            consumed.insert(next.id);
            producers.insert(node.id);
            rewrites.push((node.id, op, next.id));
        }
    }

    for (id, op, next_id) in &rewrites {
        let Some(next) = graph.node(*next_id).cloned() else {
            continue;
        };
        let Some(pos) = graph.nodes.iter().position(|n| n.id == *id) else {
            continue;
        };
        let target = &mut graph.nodes[pos];
        log::trace!("folded '{}' into '{}'", next.name, target.name);
        let old_edge = target.output();
        target.op = op.clone();
        target.outputs = next.outputs;
        graph.nodes.retain(|n| n.id != *next_id);
        graph.edges.remove(&old_edge);
    }
    rewrites.len()
}
