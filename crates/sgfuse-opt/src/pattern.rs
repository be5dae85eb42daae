//! Root-first pattern matching over single-consumer chains.
//!
//! Every `Convolution` and `FullyConnected` node is a candidate root. A
//! candidate grows one step at a time along the consumer of its current
//! output, as long as that output has exactly one reader and the consumer is
//! a legal next step:
//!
//! ```text
//! conv ─► BatchNorm ─► elemwise_add ─► relu
//!   │          │            ▲
//!   │          └──► relu    └── other addend
//!   └──► elemwise_add / relu
//! fc ─► relu
//! ```
//!
//! Overlapping candidates are resolved longest-first.

use std::collections::{HashMap, HashSet};

use sgfuse_ir::{ActType, ComputeGraph, EdgeId, GraphNode, IrError, NodeId, OpKind};

use crate::config::FusionConfig;
use crate::error::FusionError;

/// The operator a pattern starts from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootKind {
    Conv,
    FullyConnected,
}

/// One absorbed node in a matched chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    BatchNorm,
    Sum,
    Relu,
    PostSumRelu,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Self::BatchNorm => "bn",
            Self::Sum => "sum",
            Self::Relu | Self::PostSumRelu => "relu",
        }
    }
}

/// Legal transitions. `state` is the last accepted step, `None` at the root.
fn next_step(root: RootKind, state: Option<Step>, op: &OpKind) -> Option<Step> {
    let relu = matches!(op, OpKind::Activation(ActType::Relu));
    match (root, state) {
        (RootKind::Conv, None) if matches!(op, OpKind::BatchNorm(_)) => Some(Step::BatchNorm),
        (RootKind::Conv, None | Some(Step::BatchNorm)) if matches!(op, OpKind::ElemwiseAdd) => {
            Some(Step::Sum)
        }
        (RootKind::Conv, None | Some(Step::BatchNorm)) if relu => Some(Step::Relu),
        (RootKind::Conv, Some(Step::Sum)) if relu => Some(Step::PostSumRelu),
        (RootKind::FullyConnected, None) if relu => Some(Step::Relu),
        _ => None,
    }
}

/// A matched chain, root first.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternMatch {
    pub kind: RootKind,
    pub root: NodeId,
    pub steps: Vec<(Step, NodeId)>,
    /// The other operand of an absorbed sum.
    pub addend: Option<EdgeId>,
}

impl PatternMatch {
    /// Pattern name such as `conv+bn+sum+relu`.
    pub fn pattern_name(&self) -> String {
        let root = match self.kind {
            RootKind::Conv => "conv",
            RootKind::FullyConnected => "fc",
        };
        std::iter::once(root)
            .chain(self.steps.iter().map(|(s, _)| s.as_str()))
            .collect::<Vec<_>>()
            .join("+")
    }

    pub fn has_step(&self, step: Step) -> bool {
        self.steps.iter().any(|(s, _)| *s == step)
    }

    /// Root followed by every absorbed node.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::once(self.root).chain(self.steps.iter().map(|&(_, n)| n))
    }

    /// The node whose output the fused node takes over.
    pub fn last(&self) -> NodeId {
        self.steps.last().map_or(self.root, |&(_, n)| n)
    }

    /// Drop the first claimed step and everything after it.
    fn truncate_at(&mut self, claimed: &HashSet<NodeId>) {
        if let Some(pos) = self.steps.iter().position(|(_, n)| claimed.contains(n)) {
            self.steps.truncate(pos);
        }
        if !self.has_step(Step::Sum) {
            self.addend = None;
        }
    }
}

/// Grow the longest legal chain starting at `root`.
fn extend(graph: &ComputeGraph, kind: RootKind, root: &GraphNode) -> PatternMatch {
    let mut m = PatternMatch {
        kind,
        root: root.id,
        steps: Vec::new(),
        addend: None,
    };
    let mut current = root.output();
    loop {
        if graph.fan_out(current) != 1 {
            break;
        }
        let consumers = graph.edge_consumers(current);
        let [next] = consumers.as_slice() else {
            break;
        };
        let Some(step) = next_step(kind, m.steps.last().map(|&(s, _)| s), &next.op) else {
            break;
        };
        // Only the data operand of a batch-norm can be absorbed.
        if step == Step::BatchNorm && next.inputs.first() != Some(&current) {
            break;
        }
        if step == Step::Sum {
            m.addend = next.inputs.iter().copied().find(|&e| e != current);
        }
        m.steps.push((step, next.id));
        current = next.output();
    }
    m
}

/// All non-overlapping matches in `graph`, longest first.
///
/// Candidates are ordered by number of steps (descending), then by the
/// topological position of their root. A candidate that runs into a node
/// already claimed is cut just before it.
pub fn find_matches(
    graph: &ComputeGraph,
    config: &FusionConfig,
) -> Result<Vec<PatternMatch>, FusionError> {
    let order = graph.topological_order()?;
    let position: HashMap<NodeId, usize> = order
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id, i))
        .collect();

    let mut candidates: Vec<PatternMatch> = order
        .iter()
        .filter_map(|node| {
            let kind = match node.op {
                OpKind::Convolution(_) if config.fuse_conv => RootKind::Conv,
                OpKind::FullyConnected(_) if config.fuse_fc => RootKind::FullyConnected,
                _ => return None,
            };
            Some(extend(graph, kind, node))
        })
        .collect();
    candidates.sort_by_key(|m| (std::cmp::Reverse(m.steps.len()), position[&m.root]));

    let mut claimed: HashSet<NodeId> = HashSet::new();
    let mut accepted = Vec::with_capacity(candidates.len());
    for mut m in candidates {
        m.truncate_at(&claimed);
        check_chain(graph, &m)?;
        claimed.extend(m.nodes());
        log::debug!(
            "matched {} at '{}'",
            m.pattern_name(),
            graph.node(m.root).map_or("?", |n| n.name.as_str())
        );
        accepted.push(m);
    }
    accepted.sort_by_key(|m| position[&m.root]);
    Ok(accepted)
}

/// Absorbed nodes must keep the root's element type and shape.
fn check_chain(graph: &ComputeGraph, m: &PatternMatch) -> Result<(), FusionError> {
    let Some(root) = graph.node(m.root) else {
        return Ok(());
    };
    let Some(expected) = graph.edge(root.output()) else {
        return Err(IrError::UnknownEdge {
            node: root.name.clone(),
            edge: root.output().0,
        }
        .into());
    };

    let mut chain_edges: Vec<(&str, EdgeId)> = Vec::new();
    for &(_, id) in &m.steps {
        if let Some(node) = graph.node(id) {
            chain_edges.push((&node.name, node.output()));
        }
    }
    if let Some(addend) = m.addend
        && let Some(&(_, sum)) = m.steps.iter().find(|(s, _)| *s == Step::Sum)
        && let Some(node) = graph.node(sum)
    {
        chain_edges.push((&node.name, addend));
    }

    for (node, edge) in chain_edges {
        let Some(info) = graph.edge(edge) else {
            continue;
        };
        if info.scalar != expected.scalar {
            return Err(FusionError::DtypeMismatch {
                root: root.name.clone(),
                node: node.to_string(),
                expected: expected.scalar.to_string(),
                found: info.scalar.to_string(),
            });
        }
        if info.shape != expected.shape {
            return Err(FusionError::ShapeMismatch {
                root: root.name.clone(),
                node: node.to_string(),
                detail: format!("shape {} differs from {}", info.shape, expected.shape),
            });
        }
    }
    Ok(())
}

/// A concat and the edges it joins; these must share one quantization range.
#[derive(Clone, Debug, PartialEq)]
pub struct ConcatGroup {
    pub concat: NodeId,
    pub name: String,
    pub inputs: Vec<EdgeId>,
}

/// Every concat in `graph` with its input edges, regardless of fan-out.
pub fn concat_groups(graph: &ComputeGraph) -> Vec<ConcatGroup> {
    graph
        .nodes
        .iter()
        .filter(|n| matches!(n.op, OpKind::Concat { .. }))
        .map(|n| ConcatGroup {
            concat: n.id,
            name: n.name.clone(),
            inputs: n.inputs.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgfuse_ir::{BatchNormParams, ConvParams, FcParams, Scalar, TensorInfo, TensorShape};

    fn data(g: &mut ComputeGraph) -> EdgeId {
        g.add_input("data", Scalar::F32, TensorShape::fixed(&[1, 2, 5, 5]))
            .unwrap()
    }

    fn conv(g: &mut ComputeGraph, name: &str, x: EdgeId) -> EdgeId {
        g.convolution(name, x, None, ConvParams::new([3, 3], 2).with_pad([1, 1]))
            .unwrap()
    }

    fn matches(g: &ComputeGraph) -> Vec<PatternMatch> {
        find_matches(g, &FusionConfig::default()).unwrap()
    }

    #[test]
    fn full_conv_chain() {
        let mut g = ComputeGraph::new();
        let x = data(&mut g);
        let c = conv(&mut g, "conv", x);
        let bn = g.batch_norm("bn", c, BatchNormParams::default()).unwrap();
        let sum = g.elemwise_add("sum", x, bn).unwrap();
        let out = g.relu("relu", sum).unwrap();
        g.set_outputs(vec![out]);

        let found = matches(&g);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern_name(), "conv+bn+sum+relu");
        assert_eq!(found[0].addend, Some(x));
        assert_eq!(found[0].steps[3].0, Step::PostSumRelu);
    }

    #[test]
    fn graph_output_blocks_extension() {
        let mut g = ComputeGraph::new();
        let x = data(&mut g);
        let c = conv(&mut g, "conv", x);
        let out = g.relu("relu", c).unwrap();
        g.set_outputs(vec![out, c]);

        let found = matches(&g);
        assert_eq!(found[0].pattern_name(), "conv");
    }

    #[test]
    fn second_consumer_blocks_later_steps() {
        let mut g = ComputeGraph::new();
        let x = data(&mut g);
        let c = conv(&mut g, "conv", x);
        let bn = g.batch_norm("bn", c, BatchNormParams::default()).unwrap();
        let r = g.relu("relu", bn).unwrap();
        let t = g.activation("tanh", bn, ActType::Tanh).unwrap();
        g.set_outputs(vec![r, t]);

        let found = matches(&g);
        assert_eq!(found[0].pattern_name(), "conv+bn");
    }

    #[test]
    fn sigmoid_is_not_fused() {
        let mut g = ComputeGraph::new();
        let x = data(&mut g);
        let c = conv(&mut g, "conv", x);
        let out = g.activation("sig", c, ActType::Sigmoid).unwrap();
        g.set_outputs(vec![out]);
        assert_eq!(matches(&g)[0].pattern_name(), "conv");
    }

    #[test]
    fn longest_candidate_claims_shared_sum() {
        let mut g = ComputeGraph::new();
        let x = data(&mut g);
        let a = conv(&mut g, "conv_a", x);
        let b = conv(&mut g, "conv_b", x);
        let bn = g.batch_norm("bn", b, BatchNormParams::default()).unwrap();
        let sum = g.elemwise_add("sum", a, bn).unwrap();
        g.set_outputs(vec![sum]);

        let found = matches(&g);
        assert_eq!(found.len(), 2);
        let by_name = |name: &str| {
            let id = g.node_by_name(name).unwrap().id;
            found.iter().find(|m| m.root == id).unwrap()
        };
        assert_eq!(by_name("conv_b").pattern_name(), "conv+bn+sum");
        assert_eq!(by_name("conv_b").addend, Some(a));
        assert_eq!(by_name("conv_a").pattern_name(), "conv");
        assert_eq!(by_name("conv_a").addend, None);
    }

    #[test]
    fn equal_length_tie_goes_to_earlier_root() {
        let mut g = ComputeGraph::new();
        let x = data(&mut g);
        let a = conv(&mut g, "conv_a", x);
        let b = conv(&mut g, "conv_b", x);
        let sum = g.elemwise_add("sum", b, a).unwrap();
        g.set_outputs(vec![sum]);

        let found = matches(&g);
        let a_id = g.node_by_name("conv_a").unwrap().id;
        let winner = found.iter().find(|m| m.has_step(Step::Sum)).unwrap();
        assert_eq!(winner.root, a_id);
        assert_eq!(winner.addend, Some(b));
    }

    #[test]
    fn fc_relu_and_config_switch() {
        let mut g = ComputeGraph::new();
        let x = g.add_input("x", Scalar::F32, TensorShape::fixed(&[2, 8])).unwrap();
        let fc = g.fully_connected("fc", x, None, FcParams::new(4)).unwrap();
        let out = g.relu("relu", fc).unwrap();
        g.set_outputs(vec![out]);

        assert_eq!(matches(&g)[0].pattern_name(), "fc+relu");
        let only_conv = FusionConfig {
            fuse_conv: true,
            fuse_fc: false,
        };
        assert!(find_matches(&g, &only_conv).unwrap().is_empty());
    }

    #[test]
    fn concat_groups_list_inputs() {
        let mut g = ComputeGraph::new();
        let x = data(&mut g);
        let a = conv(&mut g, "conv_a", x);
        let b = conv(&mut g, "conv_b", x);
        let cat = g.concat("cat", vec![a, b, a], 1).unwrap();
        g.set_outputs(vec![cat]);

        let groups = concat_groups(&g);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "cat");
        assert_eq!(groups[0].inputs, vec![a, b, a]);
    }

    /// conv feeding a relu whose output edge is declared with `out`.
    fn conv_relu_with_output(out: TensorInfo) -> ComputeGraph {
        let mut g = ComputeGraph::new();
        let x = data(&mut g);
        let c = conv(&mut g, "conv", x);
        let r = g.add_edge(out).unwrap();
        g.add_node(OpKind::Activation(ActType::Relu), vec![c], vec![r], "relu")
            .unwrap();
        g.set_outputs(vec![r]);
        g
    }

    #[test]
    fn dtype_change_in_chain_fails_fast() {
        let g = conv_relu_with_output(TensorInfo::new(
            "relu_output",
            Scalar::I32,
            TensorShape::fixed(&[1, 2, 5, 5]),
        ));
        let err = find_matches(&g, &FusionConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            FusionError::DtypeMismatch { ref root, ref node, .. } if root == "conv" && node == "relu"
        ));
    }

    #[test]
    fn shape_change_in_chain_fails_fast() {
        let g = conv_relu_with_output(TensorInfo::new(
            "relu_output",
            Scalar::F32,
            TensorShape::fixed(&[1, 2, 4, 4]),
        ));
        let err = find_matches(&g, &FusionConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            FusionError::ShapeMismatch { ref root, ref node, .. } if root == "conv" && node == "relu"
        ));
    }
}
