//! Graph rewrites for sgfuse.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] with fixed-point iteration,
//! pattern-based operator fusion, calibration, and post-training
//! quantization.

pub mod calibrate;
mod config;
mod error;
mod fusion;
pub mod pattern;
mod post_quantize;
pub mod quantize;

pub use calibrate::{CalibrationCollector, CalibrationDataset, CalibrationTable};
pub use config::{CalibMode, FusionConfig, LayerFilter, QuantizeConfig, QuantizeTarget};
pub use error::{CalibrationError, FusionError, PassError, QuantizeError};
pub use fusion::OperatorFusion;
pub use post_quantize::fold_quantized;
pub use quantize::{QuantizedModel, quantize_graph, quantize_model};

use std::fmt::Debug;

use sgfuse_ir::ComputeGraph;

/// A rewrite over a compute graph.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Run the pass on a graph. Returns `true` if anything was modified.
    fn run(&self, graph: &mut ComputeGraph) -> Result<bool, PassError>;
}

/// Drops nodes and parameters the graph outputs do not depend on.
#[derive(Debug)]
pub struct DeadNodeElimination;

impl Pass for DeadNodeElimination {
    fn name(&self) -> &str {
        "dead-node-elimination"
    }

    fn run(&self, graph: &mut ComputeGraph) -> Result<bool, PassError> {
        let pruned = graph.retain_reachable();
        let changed = pruned.node_count() != graph.node_count() || pruned.params != graph.params;
        *graph = pruned;
        Ok(changed)
    }
}

/// Optimization level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptLevel {
    /// No rewrites.
    O0,
    /// Operator fusion.
    O1,
    /// Fusion plus dead node elimination.
    O2,
}

/// Maximum number of fixed-point iterations before giving up.
const MAX_ITERATIONS: usize = 10;

/// Runs passes in sequence with fixed-point iteration.
#[derive(Debug, Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates a pass manager with passes appropriate for the given level.
    pub fn for_level(level: OptLevel, fusion: FusionConfig) -> Self {
        let mut pm = Self::new();
        match level {
            OptLevel::O0 => {}
            OptLevel::O1 => pm.add_pass(Box::new(OperatorFusion::new(fusion))),
            OptLevel::O2 => {
                pm.add_pass(Box::new(OperatorFusion::new(fusion)));
                pm.add_pass(Box::new(DeadNodeElimination));
            }
        }
        pm
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Runs all passes until a fixed point is reached or the iteration limit.
    pub fn run(&self, graph: &mut ComputeGraph) -> Result<(), PassError> {
        for iteration in 0..MAX_ITERATIONS {
            let mut changed = false;
            for pass in &self.passes {
                let modified = pass.run(graph)?;
                if modified {
                    log::debug!("{} changed the graph (iteration {iteration})", pass.name());
                }
                changed |= modified;
            }
            if !changed {
                break;
            }
        }
        graph.validate().map_err(|source| PassError::Graph {
            pass: "pass-manager".into(),
            source,
        })
    }
}

/// Convenience function: fuses everything fusable in `graph`.
pub fn optimize(graph: &mut ComputeGraph) -> Result<(), PassError> {
    PassManager::for_level(OptLevel::O1, FusionConfig::default()).run(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgfuse_ir::{ConvParams, OpKind, Scalar, TensorShape};

    fn conv_relu() -> ComputeGraph {
        let mut g = ComputeGraph::new();
        let x = g
            .add_input("data", Scalar::F32, TensorShape::fixed(&[1, 1, 3, 3]))
            .unwrap();
        let c = g
            .convolution("conv", x, None, ConvParams::new([1, 1], 1))
            .unwrap();
        let out = g.relu("relu", c).unwrap();
        g.set_outputs(vec![out]);
        g
    }

    #[test]
    fn optimize_empty_graph() {
        let mut graph = ComputeGraph::new();
        optimize(&mut graph).unwrap();
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn pass_manager_o0_is_noop() {
        let mut graph = conv_relu();
        PassManager::for_level(OptLevel::O0, FusionConfig::default())
            .run(&mut graph)
            .unwrap();
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn pass_manager_o1_fuses() {
        let mut graph = conv_relu();
        optimize(&mut graph).unwrap();
        assert_eq!(graph.node_count(), 1);
        assert!(matches!(&graph.nodes[0].op, OpKind::FusedConv(p) if p.with_relu));
    }

    #[test]
    fn dead_node_elimination_drops_unused_branch() {
        let mut graph = conv_relu();
        let data = graph.edge_by_name("data").unwrap();
        graph
            .convolution("unused", data, None, ConvParams::new([1, 1], 1))
            .unwrap();
        PassManager::for_level(OptLevel::O2, FusionConfig::default())
            .run(&mut graph)
            .unwrap();
        assert_eq!(graph.node_count(), 1);
        assert!(graph.edge_by_name("unused_weight").is_none());
    }
}
