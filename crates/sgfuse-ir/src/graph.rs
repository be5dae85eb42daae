//! Dataflow graph of tensor operators.
//!
//! A [`ComputeGraph`] is a DAG where nodes are operators and edges are
//! tensors flowing between them. Edges without a producer are either graph
//! inputs (fed per batch) or parameters (bound weights).
//!
//! Rewrites never mutate a graph in place: passes read a `&ComputeGraph` and
//! build a new one, so the original stays valid for comparison.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::attr::Attributes;
use crate::error::IrError;
use crate::op::OpKind;
use crate::shape::infer_output;
use crate::types::{Scalar, TensorShape};

/// A unique identifier for a node in the computation graph.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct NodeId(pub u32);

/// A unique identifier for an edge (tensor) in the computation graph.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct EdgeId(pub u32);

/// Metadata about a tensor edge in the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorInfo {
    /// Unique name.
    pub name: String,
    /// Element scalar type.
    pub scalar: Scalar,
    /// Shape (may contain dynamic dimensions).
    pub shape: TensorShape,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, scalar: Scalar, shape: TensorShape) -> Self {
        Self {
            name: name.into(),
            scalar,
            shape,
        }
    }
}

/// A node in the computation graph.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphNode {
    /// Unique identifier for this node.
    pub id: NodeId,
    /// The operation this node performs.
    pub op: OpKind,
    /// Input edge identifiers (ordered).
    pub inputs: Vec<EdgeId>,
    /// Output edge identifiers (ordered).
    pub outputs: Vec<EdgeId>,
    /// Unique name for this node.
    pub name: String,
}

impl GraphNode {
    /// The single output edge every operator produces.
    pub fn output(&self) -> EdgeId {
        self.outputs[0]
    }
}

/// A computation graph.
#[derive(Clone, Debug, Default)]
pub struct ComputeGraph {
    /// All nodes in the graph, in insertion order.
    pub nodes: Vec<GraphNode>,
    /// All tensor edges, keyed by EdgeId.
    pub edges: HashMap<EdgeId, TensorInfo>,
    /// Graph-level data inputs, fed per batch.
    pub inputs: Vec<EdgeId>,
    /// Bound parameters (weights, biases, statistics).
    pub params: Vec<EdgeId>,
    /// Graph-level output edge ids.
    pub outputs: Vec<EdgeId>,
    /// Next available node id.
    next_node_id: u32,
    /// Next available edge id.
    next_edge_id: u32,
}

impl ComputeGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor edge to the graph and return its id.
    pub fn add_edge(&mut self, info: TensorInfo) -> Result<EdgeId, IrError> {
        if self.edge_by_name(&info.name).is_some() {
            return Err(IrError::DuplicateName {
                what: "edge",
                name: info.name,
            });
        }
        let id = EdgeId(self.next_edge_id);
        self.next_edge_id += 1;
        self.edges.insert(id, info);
        Ok(id)
    }

    /// Add a graph-level data input.
    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        scalar: Scalar,
        shape: TensorShape,
    ) -> Result<EdgeId, IrError> {
        let id = self.add_edge(TensorInfo::new(name, scalar, shape))?;
        self.inputs.push(id);
        Ok(id)
    }

    /// Add a bound parameter.
    pub fn add_param(
        &mut self,
        name: impl Into<String>,
        scalar: Scalar,
        shape: TensorShape,
    ) -> Result<EdgeId, IrError> {
        let id = self.add_edge(TensorInfo::new(name, scalar, shape))?;
        self.params.push(id);
        Ok(id)
    }

    /// Add a node over already registered edges and return its id.
    ///
    /// Fails if an edge is unknown, if an output edge already has a producer,
    /// or if the node name is taken.
    pub fn add_node(
        &mut self,
        op: OpKind,
        inputs: Vec<EdgeId>,
        outputs: Vec<EdgeId>,
        name: impl Into<String>,
    ) -> Result<NodeId, IrError> {
        let name = name.into();

        for &e in inputs.iter().chain(outputs.iter()) {
            if !self.edges.contains_key(&e) {
                return Err(IrError::UnknownEdge { node: name, edge: e.0 });
            }
        }
        for &out in &outputs {
            if let Some(existing) = self.edge_producer(out) {
                return Err(IrError::MultipleProducers {
                    edge: self.edge_name(out).to_string(),
                    producer: existing.name.clone(),
                });
            }
        }
        if self.node_by_name(&name).is_some() {
            return Err(IrError::DuplicateName { what: "node", name });
        }

        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        self.nodes.push(GraphNode {
            id,
            op,
            inputs,
            outputs,
            name,
        });
        Ok(id)
    }

    /// Add an operator, inferring its output tensor `<name>_output`.
    ///
    /// Returns the output edge.
    pub fn add_op(
        &mut self,
        op: OpKind,
        inputs: Vec<EdgeId>,
        name: impl Into<String>,
    ) -> Result<EdgeId, IrError> {
        let name = name.into();
        let (scalar, shape) = {
            let infos = inputs
                .iter()
                .map(|&e| {
                    self.edges.get(&e).ok_or_else(|| IrError::UnknownEdge {
                        node: name.clone(),
                        edge: e.0,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            infer_output(&op, &name, &infos)?
        };
        if self.node_by_name(&name).is_some() {
            return Err(IrError::DuplicateName { what: "node", name });
        }
        let out = self.add_edge(TensorInfo::new(format!("{name}_output"), scalar, shape))?;
        self.add_node(op, inputs, vec![out], name)?;
        Ok(out)
    }

    /// Declare the graph outputs.
    pub fn set_outputs(&mut self, outputs: Vec<EdgeId>) {
        self.outputs = outputs;
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges (tensors) in the graph.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&TensorInfo> {
        self.edges.get(&id)
    }

    pub fn edge_by_name(&self, name: &str) -> Option<EdgeId> {
        self.edges
            .iter()
            .find_map(|(&id, info)| (info.name == name).then_some(id))
    }

    /// Name of an edge, or `"?"` if it is not part of this graph.
    pub fn edge_name(&self, id: EdgeId) -> &str {
        self.edges.get(&id).map_or("?", |info| info.name.as_str())
    }

    pub fn is_param(&self, edge: EdgeId) -> bool {
        self.params.contains(&edge)
    }

    pub fn is_output(&self, edge: EdgeId) -> bool {
        self.outputs.contains(&edge)
    }

    /// Returns nodes in topological order.
    ///
    /// The ordering is deterministic: among ready nodes, the one with the
    /// smaller [`NodeId`] is emitted first.
    pub fn topological_order(&self) -> Result<Vec<&GraphNode>, IrError> {
        let mut edge_producer: HashMap<EdgeId, usize> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for &out in &node.outputs {
                edge_producer.insert(out, i);
            }
        }

        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (ci, node) in self.nodes.iter().enumerate() {
            for &inp in &node.inputs {
                if let Some(&pi) = edge_producer.get(&inp) {
                    in_degree[ci] += 1;
                    consumers[pi].push(ci);
                }
            }
        }

        // Kahn's algorithm with deterministic BTreeSet (ordered by NodeId)
        let mut ready: BTreeSet<(NodeId, usize)> = BTreeSet::new();
        for (i, &deg) in in_degree.iter().enumerate() {
            if deg == 0 {
                ready.insert((self.nodes[i].id, i));
            }
        }

        let mut result: Vec<&GraphNode> = Vec::with_capacity(n);
        while let Some((_, idx)) = ready.pop_first() {
            result.push(&self.nodes[idx]);
            for &ci in &consumers[idx] {
                in_degree[ci] -= 1;
                if in_degree[ci] == 0 {
                    ready.insert((self.nodes[ci].id, ci));
                }
            }
        }

        if result.len() != n {
            return Err(IrError::Cycle {
                visited: result.len(),
                total: n,
            });
        }
        Ok(result)
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> Result<Vec<&GraphNode>, IrError> {
        self.topological_order()
    }

    /// Find all nodes that consume the given edge.
    pub fn edge_consumers(&self, edge: EdgeId) -> Vec<&GraphNode> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.contains(&edge))
            .collect()
    }

    /// Find the node that produces the given edge, if any.
    pub fn edge_producer(&self, edge: EdgeId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.outputs.contains(&edge))
    }

    /// Distinct nodes reading any output of `node`.
    pub fn consumers(&self, node: &GraphNode) -> Vec<&GraphNode> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.iter().any(|e| node.outputs.contains(e)))
            .collect()
    }

    /// Number of reads of `edge`: one per consuming input slot, plus one if
    /// it is a graph output.
    pub fn fan_out(&self, edge: EdgeId) -> usize {
        let uses: usize = self
            .nodes
            .iter()
            .map(|n| n.inputs.iter().filter(|&&e| e == edge).count())
            .sum();
        uses + usize::from(self.is_output(edge))
    }

    /// The attribute view of a node.
    pub fn attributes(&self, node: &GraphNode) -> Attributes {
        node.op.attributes()
    }

    /// Every tensor name the graph can produce: inputs, parameters, then node
    /// outputs in topological order.
    pub fn internal_outputs(&self) -> Result<Vec<String>, IrError> {
        let mut names: Vec<String> = self
            .inputs
            .iter()
            .chain(&self.params)
            .map(|&e| self.edge_name(e).to_string())
            .collect();
        for node in self.topological_order()? {
            names.extend(node.outputs.iter().map(|&e| self.edge_name(e).to_string()));
        }
        Ok(names)
    }

    /// Check the structural invariants: unique names, resolvable references,
    /// single producers, acyclicity, and sourced inputs.
    pub fn validate(&self) -> Result<(), IrError> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(IrError::DuplicateName {
                    what: "node",
                    name: node.name.clone(),
                });
            }
        }
        let mut edge_names = HashSet::new();
        for info in self.edges.values() {
            if !edge_names.insert(info.name.as_str()) {
                return Err(IrError::DuplicateName {
                    what: "edge",
                    name: info.name.clone(),
                });
            }
        }

        let mut produced = HashMap::new();
        for node in &self.nodes {
            for &e in node.inputs.iter().chain(&node.outputs) {
                if !self.edges.contains_key(&e) {
                    return Err(IrError::UnknownEdge {
                        node: node.name.clone(),
                        edge: e.0,
                    });
                }
            }
            for &out in &node.outputs {
                if let Some(prev) = produced.insert(out, node.name.as_str()) {
                    return Err(IrError::MultipleProducers {
                        edge: self.edge_name(out).to_string(),
                        producer: prev.to_string(),
                    });
                }
            }
        }
        for node in &self.nodes {
            for &e in &node.inputs {
                if !produced.contains_key(&e) && !self.inputs.contains(&e) && !self.is_param(e) {
                    return Err(IrError::UnknownEdge {
                        node: node.name.clone(),
                        edge: e.0,
                    });
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Copy of this graph keeping only what the outputs transitively need.
    pub fn retain_reachable(&self) -> ComputeGraph {
        let mut live_edges: HashSet<EdgeId> = self.outputs.iter().copied().collect();
        let mut live_nodes: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<EdgeId> = self.outputs.clone();

        while let Some(edge) = stack.pop() {
            if let Some(producer) = self.edge_producer(edge)
                && live_nodes.insert(producer.id)
            {
                for &inp in &producer.inputs {
                    if live_edges.insert(inp) {
                        stack.push(inp);
                    }
                }
                live_edges.extend(producer.outputs.iter().copied());
            }
        }

        let mut graph = self.clone();
        graph.nodes.retain(|n| live_nodes.contains(&n.id));
        graph.edges.retain(|id, _| live_edges.contains(id));
        graph.params.retain(|e| live_edges.contains(e));
        graph
    }
}
