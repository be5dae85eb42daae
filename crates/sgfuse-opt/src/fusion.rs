//! Operator fusion pass.
//!
//! Replaces every matched chain with one fused node:
//! - **conv** (+ bn) (+ relu | + sum (+ relu)) → `sg_conv`
//! - **fc** (+ relu) → `sg_fully_connected`
//!
//! The fused node is named `<root>_fused` and takes over the output edge of
//! the last absorbed node, so consumers outside the chain are untouched.

use std::collections::HashSet;

use sgfuse_ir::{ComputeGraph, EdgeId, FusedConvParams, FusedFcParams, GraphNode, IrError, OpKind};

use crate::config::FusionConfig;
use crate::error::{FusionError, PassError};
use crate::pattern::{PatternMatch, Step, find_matches};
use crate::Pass;

/// Fuses conv and fully-connected chains into single fused operators.
#[derive(Debug, Default)]
pub struct OperatorFusion {
    pub config: FusionConfig,
}

impl Pass for OperatorFusion {
    fn name(&self) -> &str {
        "operator-fusion"
    }

    fn run(&self, graph: &mut ComputeGraph) -> Result<bool, PassError> {
        let fused = self.fuse(graph).map_err(|source| PassError::Fusion {
            pass: self.name().to_string(),
            source,
        })?;
        let changed = fused.node_count() != graph.node_count()
            || fused.nodes.iter().zip(&graph.nodes).any(|(a, b)| a.op != b.op);
        *graph = fused;
        Ok(changed)
    }
}

impl OperatorFusion {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Return a fused copy of `graph`; the input is left untouched.
    ///
    /// Running this on its own output is a no-op, since fused kinds are
    /// never pattern roots.
    pub fn fuse(&self, graph: &ComputeGraph) -> Result<ComputeGraph, FusionError> {
        let matches = find_matches(graph, &self.config)?;
        let mut out = graph.clone();
        for m in &matches {
            apply_match(graph, &mut out, m)?;
        }
        out.validate()?;
        log::debug!(
            "fusion: {} matches, {} -> {} nodes",
            matches.len(),
            graph.node_count(),
            out.node_count()
        );
        Ok(out)
    }
}

fn node(graph: &ComputeGraph, id: sgfuse_ir::NodeId) -> Result<&GraphNode, FusionError> {
    graph
        .node(id)
        .ok_or_else(|| IrError::UnknownOp(format!("node #{}", id.0)).into())
}

/// Op and input list of the fused node for `m`.
fn fused_op(graph: &ComputeGraph, m: &PatternMatch) -> Result<(OpKind, Vec<EdgeId>), FusionError> {
    let root = node(graph, m.root)?;
    let mut inputs = root.inputs.clone();
    let op = match &root.op {
        OpKind::Convolution(conv) => {
            let mut p = FusedConvParams::plain(conv.clone());
            for &(step, id) in &m.steps {
                let absorbed = node(graph, id)?;
                match (step, &absorbed.op) {
                    (Step::BatchNorm, OpKind::BatchNorm(bn)) => {
                        p.bn = Some(bn.clone());
                        inputs.extend_from_slice(&absorbed.inputs[1..]);
                    }
                    (Step::Sum, _) => p.with_sum = true,
                    (Step::Relu, _) => p.with_relu = true,
                    (Step::PostSumRelu, _) => p.with_postsum_relu = true,
                    (Step::BatchNorm, other) => {
                        return Err(IrError::UnknownOp(other.op_type()).into());
                    }
                }
            }
            if p.with_sum
                && let Some(addend) = m.addend
            {
                inputs.push(addend);
            }
            OpKind::FusedConv(p)
        }
        OpKind::FullyConnected(fc) => OpKind::FusedFullyConnected(FusedFcParams {
            fc: fc.clone(),
            with_relu: m.has_step(Step::Relu),
        }),
        other => return Err(IrError::UnknownOp(other.op_type()).into()),
    };
    Ok((op, inputs))
}

/// Rewrite one match inside `out`, reading structure from `original`.
fn apply_match(
    original: &ComputeGraph,
    out: &mut ComputeGraph,
    m: &PatternMatch,
) -> Result<(), FusionError> {
    let root = node(original, m.root)?;
    let (op, inputs) = fused_op(original, m)?;
    let output = node(original, m.last())?.output();
    let name = format!("{}_fused", root.name);
    if out.node_by_name(&name).is_some() {
        return Err(IrError::DuplicateName { what: "node", name }.into());
    }

    // Intermediate edges are consumed only inside the chain.
    let absorbed: HashSet<_> = m.steps.iter().map(|&(_, id)| id).collect();
    let mut dead_edges = vec![root.output()];
    for &(_, id) in &m.steps[..m.steps.len().saturating_sub(1)] {
        dead_edges.push(node(original, id)?.output());
    }
    dead_edges.retain(|&e| e != output);

    log::debug!("fusing {} at '{}' into '{name}'", m.pattern_name(), root.name);

    out.nodes.retain(|n| !absorbed.contains(&n.id));
    if let Some(slot) = out.nodes.iter_mut().find(|n| n.id == m.root) {
        *slot = GraphNode {
            id: m.root,
            op,
            inputs,
            outputs: vec![output],
            name,
        };
    }
    for e in dead_edges {
        out.edges.remove(&e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use sgfuse_exec::{Executor, Feeds, ParamSet, ReferenceExecutor, Tensor};
    use sgfuse_ir::{ActType, BatchNormParams, ConvParams, FcParams, Scalar, TensorShape};

    fn random_params(graph: &ComputeGraph, seed: u64) -> ParamSet {
        let mut rng = StdRng::seed_from_u64(seed);
        graph
            .params
            .iter()
            .map(|&e| {
                let info = graph.edge(e).unwrap();
                let shape = info.shape.to_fixed().unwrap();
                let positive = info.name.ends_with("moving_var");
                let values = ArrayD::from_shape_simple_fn(shape, || {
                    if positive {
                        rng.gen_range(0.5f32..1.5)
                    } else {
                        rng.gen_range(-1.0f32..1.0)
                    }
                });
                (info.name.clone(), Tensor::Float(values))
            })
            .collect()
    }

    fn feeds(graph: &ComputeGraph, seed: u64) -> Feeds {
        let mut rng = StdRng::seed_from_u64(seed);
        graph
            .inputs
            .iter()
            .map(|&e| {
                let info = graph.edge(e).unwrap();
                let shape = info.shape.to_fixed().unwrap();
                let values = ArrayD::from_shape_simple_fn(shape, || rng.gen_range(-1.0f32..1.0));
                (info.name.clone(), values)
            })
            .collect()
    }

    fn assert_same_outputs(before: &ComputeGraph, after: &ComputeGraph) {
        let params = random_params(before, 7);
        let feeds = feeds(before, 11);
        let exec = ReferenceExecutor;
        let want = exec.run(before, &params, &feeds).unwrap();
        let got = exec.run(after, &params, &feeds).unwrap();
        assert_eq!(want.len(), got.len());
        for (w, g) in want.iter().zip(&got) {
            let (w, g) = (w.to_f32(), g.to_f32());
            assert_eq!(w.shape(), g.shape());
            for (a, b) in w.iter().zip(g.iter()) {
                assert!((a - b).abs() <= 1e-3 + 1e-3 * a.abs(), "{a} vs {b}");
            }
        }
    }

    fn conv_bn_sum_relu() -> ComputeGraph {
        let mut g = ComputeGraph::new();
        let x = g
            .add_input("data", Scalar::F32, TensorShape::fixed(&[1, 3, 6, 6]))
            .unwrap();
        let c = g
            .convolution("conv", x, None, ConvParams::new([3, 3], 3).with_pad([1, 1]))
            .unwrap();
        let bn = g.batch_norm("bn", c, BatchNormParams::default()).unwrap();
        let sum = g.elemwise_add("sum", bn, x).unwrap();
        let out = g.relu("relu", sum).unwrap();
        g.set_outputs(vec![out]);
        g
    }

    #[test]
    fn fuse_conv_bn_sum_relu() {
        let graph = conv_bn_sum_relu();
        let fused = OperatorFusion::default().fuse(&graph).unwrap();

        assert_eq!(fused.node_count(), 1);
        let node = &fused.nodes[0];
        assert_eq!(node.name, "conv_fused");
        let OpKind::FusedConv(p) = &node.op else {
            panic!("expected FusedConv, got {:?}", node.op);
        };
        assert!(p.bn.is_some() && p.with_sum && p.with_postsum_relu);
        assert!(!p.with_relu);
        // data, weight, bias, 4 bn params, addend
        assert_eq!(node.inputs.len(), 8);
        assert_eq!(fused.edge_name(node.inputs[7]), "data");
        assert_eq!(fused.edge_name(node.output()), "relu_output");
        assert!(fused.edge_by_name("conv_output").is_none());
        assert!(fused.edge_by_name("bn_output").is_none());

        assert_same_outputs(&graph, &fused);
    }

    #[test]
    fn original_graph_is_untouched() {
        let graph = conv_bn_sum_relu();
        let _ = OperatorFusion::default().fuse(&graph).unwrap();
        assert_eq!(graph.node_count(), 4);
        graph.validate().unwrap();
    }

    #[test]
    fn fusion_is_idempotent() {
        let graph = conv_bn_sum_relu();
        let pass = OperatorFusion::default();
        let once = pass.fuse(&graph).unwrap();
        let twice = pass.fuse(&once).unwrap();
        assert_eq!(once.nodes, twice.nodes);

        let mut g = once;
        assert!(!pass.run(&mut g).unwrap());
    }

    #[test]
    fn bn_with_second_consumer_stays_separate() {
        let mut g = ComputeGraph::new();
        let x = g
            .add_input("data", Scalar::F32, TensorShape::fixed(&[1, 2, 4, 4]))
            .unwrap();
        let c = g
            .convolution("conv", x, None, ConvParams::new([1, 1], 2))
            .unwrap();
        let bn = g.batch_norm("bn", c, BatchNormParams::default()).unwrap();
        let pool = g
            .pooling(
                "pool",
                c,
                sgfuse_ir::PoolParams::new(sgfuse_ir::PoolType::Max, [2, 2]),
            )
            .unwrap();
        g.set_outputs(vec![bn, pool]);

        let fused = OperatorFusion::default().fuse(&g).unwrap();
        let node = fused.node_by_name("conv_fused").unwrap();
        let OpKind::FusedConv(p) = &node.op else {
            panic!("expected FusedConv");
        };
        assert!(p.bn.is_none());
        assert!(fused.node_by_name("bn").is_some());
        assert_same_outputs(&g, &fused);
    }

    #[test]
    fn fc_relu_softmax_tail() {
        let mut g = ComputeGraph::new();
        let x = g.add_input("x", Scalar::F32, TensorShape::fixed(&[2, 6])).unwrap();
        let fc = g.fully_connected("fc", x, None, FcParams::new(5)).unwrap();
        let r = g.activation("act", fc, ActType::Relu).unwrap();
        let out = g.softmax("softmax", r).unwrap();
        g.set_outputs(vec![out]);

        let fused = OperatorFusion::default().fuse(&g).unwrap();
        assert_eq!(fused.node_count(), 2);
        let node = fused.node_by_name("fc_fused").unwrap();
        assert_eq!(
            node.op,
            OpKind::FusedFullyConnected(FusedFcParams {
                fc: FcParams::new(5),
                with_relu: true,
            })
        );
        assert_same_outputs(&g, &fused);
    }

    #[test]
    fn disabled_config_changes_nothing() {
        let graph = conv_bn_sum_relu();
        let pass = OperatorFusion::new(FusionConfig::disabled());
        let mut g = graph.clone();
        assert!(!pass.run(&mut g).unwrap());
        assert_eq!(g.nodes, graph.nodes);
    }
}
