//! Post-training quantization rewrite.
//!
//! Given a float graph and its [`CalibrationTable`], builds a new graph in
//! which every calibrated conv / fully-connected node (fused or not) runs in
//! fixed point:
//!
//! ```text
//! data ─► data_quantize ─► quantized_sg_conv (int32) ─► conv_fused_requantize ─► ...
//!                               ▲
//!                        int8 weight
//! ```
//!
//! Pooling and concat stay in fixed point when their input already is.
//! Quantize / dequantize nodes are inserted lazily at float boundaries.
//! Inputs of a concat share one range so their integer codes are
//! comparable.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sgfuse_exec::{Executor, ParamSet, QTensor, Tensor};
use sgfuse_ir::{
    CalibRange, ComputeGraph, EdgeId, GraphNode, NodeId, OpKind, QuantDtype, QuantizedOutput,
    Scalar, TensorInfo,
};

use crate::calibrate::{CalibrationCollector, CalibrationDataset, CalibrationTable};
use crate::config::QuantizeConfig;
use crate::error::QuantizeError;
use crate::pattern::concat_groups;
use crate::post_quantize::fold_quantized;

/// Fixed-point encoding of a tensor: integer type and the real range it covers.
type Encoding = (QuantDtype, CalibRange);

/// Result of [`quantize_model`].
#[derive(Clone, Debug)]
pub struct QuantizedModel {
    pub graph: ComputeGraph,
    /// Parameters with int8 weights for quantized nodes.
    pub params: ParamSet,
    pub calibration: CalibrationTable,
}

/// Calibrate `graph` on `dataset`, rewrite it to fixed point, and fold the
/// requantize / dequantize tails.
///
/// `graph` is normally the output of fusion.
pub fn quantize_model(
    graph: &ComputeGraph,
    params: &ParamSet,
    executor: &dyn Executor,
    dataset: &CalibrationDataset,
    config: &QuantizeConfig,
) -> Result<QuantizedModel, QuantizeError> {
    let calibration = CalibrationCollector::collect(graph, params, executor, dataset, config)?;
    calibration.log_summary();

    let (rewritten, qparams) = quantize_graph(graph, params, &calibration, config)?;
    let folded = fold_quantized(&rewritten, config)?;
    Ok(QuantizedModel {
        graph: folded,
        params: qparams,
        calibration,
    })
}

/// Rewrite `graph` using the given calibration. Returns the new graph and
/// parameter set; neither input is modified.
pub fn quantize_graph(
    graph: &ComputeGraph,
    params: &ParamSet,
    table: &CalibrationTable,
    config: &QuantizeConfig,
) -> Result<(ComputeGraph, ParamSet), QuantizeError> {
    let aligned = align_scales(graph, table, config)?;
    let mut rw = Rewriter {
        src: graph,
        table,
        config,
        aligned,
        plans: HashMap::new(),
        out: ComputeGraph::new(),
        float_of: HashMap::new(),
        quant_of: HashMap::new(),
    };
    rw.plan()?;
    let int8_weights = rw.int8_weights();
    let qparams = encode_params(params, &int8_weights)?;
    rw.build(&int8_weights)?;

    let quantized = rw.plans.values().filter(|p| p.is_some()).count();
    log::debug!(
        "quantized {quantized} of {} nodes, {} int8 weights",
        graph.node_count(),
        int8_weights.len()
    );
    rw.out.validate()?;
    Ok((rw.out, qparams))
}

/// Shared range for every edge feeding a non-excluded concat.
///
/// Concats sharing an input are merged into one group; the group range is
/// the union of its members' calibrated ranges. A group with any
/// uncalibrated member gets no shared range, so its concats stay in float.
fn align_scales(
    graph: &ComputeGraph,
    table: &CalibrationTable,
    config: &QuantizeConfig,
) -> Result<HashMap<EdgeId, CalibRange>, QuantizeError> {
    let groups: Vec<_> = concat_groups(graph)
        .into_iter()
        .filter(|g| !config.is_excluded(&g.name))
        .collect();

    let mut parent: Vec<usize> = (0..groups.len()).collect();
    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut owner: BTreeMap<EdgeId, usize> = BTreeMap::new();
    for (gi, group) in groups.iter().enumerate() {
        for &e in &group.inputs {
            if let Some(&other) = owner.get(&e) {
                let (a, b) = (find(&mut parent, gi), find(&mut parent, other));
                parent[a] = b;
            } else {
                owner.insert(e, gi);
            }
        }
    }

    let mut ranges: BTreeMap<usize, CalibRange> = BTreeMap::new();
    let mut bad: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut incomplete: BTreeSet<usize> = BTreeSet::new();
    for (&e, &gi) in &owner {
        let root = find(&mut parent, gi);
        let name = graph.edge_name(e);
        let Some(range) = table.get(name) else {
            log::warn!("'{name}' feeds a concat but was never calibrated");
            incomplete.insert(root);
            continue;
        };
        if !range.is_representable() {
            bad.entry(root).or_default().push(name.to_string());
            continue;
        }
        ranges
            .entry(root)
            .and_modify(|r| *r = r.union(&range))
            .or_insert(range);
    }

    if let Some((&root, edges)) = bad.iter().next() {
        let concats: Vec<&str> = (0..groups.len())
            .filter(|&gi| find(&mut parent, gi) == root)
            .map(|gi| groups[gi].name.as_str())
            .collect();
        return Err(QuantizeError::ScaleAlignment {
            concat: concats.join(", "),
            edges: edges.clone(),
        });
    }

    let mut aligned = HashMap::new();
    for (&e, &gi) in &owner {
        let root = find(&mut parent, gi);
        if incomplete.contains(&root) {
            continue;
        }
        if let Some(&range) = ranges.get(&root) {
            aligned.insert(e, range);
        }
    }
    Ok(aligned)
}

/// Encode the chosen weights as symmetric int8; everything else is copied.
fn encode_params(params: &ParamSet, int8_weights: &BTreeSet<String>) -> Result<ParamSet, QuantizeError> {
    if let Some(missing) = int8_weights.iter().find(|name| !params.contains(name)) {
        return Err(QuantizeError::MissingParam(missing.clone()));
    }
    Ok(params
        .iter()
        .map(|(name, tensor)| {
            let tensor = match tensor {
                Tensor::Float(values) if int8_weights.contains(name) => {
                    Tensor::Quantized(QTensor::symmetric_int8(values))
                }
                other => other.clone(),
            };
            (name.to_string(), tensor)
        })
        .collect())
}

fn is_weighted(op: &OpKind) -> bool {
    matches!(
        op,
        OpKind::Convolution(_)
            | OpKind::FullyConnected(_)
            | OpKind::FusedConv(_)
            | OpKind::FusedFullyConnected(_)
    )
}

struct Rewriter<'a> {
    src: &'a ComputeGraph,
    table: &'a CalibrationTable,
    config: &'a QuantizeConfig,
    aligned: HashMap<EdgeId, CalibRange>,
    /// Output encoding of each quantized node; `None` keeps it in float.
    plans: HashMap<NodeId, Option<Encoding>>,
    out: ComputeGraph,
    /// Source edge → float version in `out`.
    float_of: HashMap<EdgeId, EdgeId>,
    /// Source edge → fixed-point version in `out`, with its encoding.
    quant_of: HashMap<EdgeId, (EdgeId, Encoding)>,
}

impl Rewriter<'_> {
    fn range_of(&self, edge: EdgeId) -> Option<CalibRange> {
        self.aligned
            .get(&edge)
            .copied()
            .or_else(|| self.table.get(self.src.edge_name(edge)))
    }

    /// Encoding a fresh quantization of `edge` would use.
    fn encoding_for(&self, edge: EdgeId) -> Result<Option<Encoding>, QuantizeError> {
        match self.range_of(edge) {
            None => Ok(None),
            Some(range) if !range.is_representable() => Err(QuantizeError::InvalidRange {
                edge: self.src.edge_name(edge).to_string(),
            }),
            Some(range) => Ok(Some((self.config.target.dtype_for(&range), range))),
        }
    }

    /// Encoding of `edge` when it feeds a concat.
    fn aligned_encoding(&self, edge: EdgeId) -> Option<Encoding> {
        let range = *self.aligned.get(&edge)?;
        Some((self.config.target.dtype_for(&range), range))
    }

    /// Encoding of `edge` when its producer was planned as quantized.
    fn produced_encoding(&self, edge: EdgeId) -> Option<Encoding> {
        let producer = self.src.edge_producer(edge)?;
        self.plans.get(&producer.id).copied().flatten()
    }

    /// Decide, in topological order, which nodes run in fixed point.
    fn plan(&mut self) -> Result<(), QuantizeError> {
        for node in self.src.topological_order()? {
            let plan = if self.config.is_excluded(&node.name) {
                log::debug!("'{}' is excluded from quantization", node.name);
                None
            } else {
                self.plan_node(node)?
            };
            self.plans.insert(node.id, plan);
        }
        Ok(())
    }

    fn plan_node(&self, node: &GraphNode) -> Result<Option<Encoding>, QuantizeError> {
        let out = node.output();
        match &node.op {
            op if is_weighted(op) => {
                let data = node.inputs[0];
                let data_ready = match self.produced_encoding(data) {
                    Some(_) => true,
                    None => self.encoding_for(data)?.is_some(),
                };
                match self.encoding_for(out)? {
                    Some(enc) if data_ready => Ok(Some(enc)),
                    _ => {
                        log::warn!(
                            "'{}' has no calibration range for its input or output, keeping it in float",
                            node.name
                        );
                        Ok(None)
                    }
                }
            }
            OpKind::Pooling(_) => {
                let Some(input) = self.produced_encoding(node.inputs[0]) else {
                    return Ok(None);
                };
                Ok(Some(self.aligned_encoding(out).unwrap_or(input)))
            }
            OpKind::Concat { .. } => {
                if !node.inputs.iter().any(|&e| self.produced_encoding(e).is_some()) {
                    return Ok(None);
                }
                let Some(shared) = self.aligned_encoding(node.inputs[0]) else {
                    log::warn!("concat '{}' has no aligned range, keeping it in float", node.name);
                    return Ok(None);
                };
                Ok(Some(self.aligned_encoding(out).unwrap_or(shared)))
            }
            _ => Ok(None),
        }
    }

    /// Weight parameters whose every use is the weight slot of a quantized
    /// node.
    fn int8_weights(&self) -> BTreeSet<String> {
        let quantized = |id: NodeId| matches!(self.plans.get(&id), Some(Some(_)));
        self.src
            .params
            .iter()
            .filter(|&&p| {
                let consumers = self.src.edge_consumers(p);
                !consumers.is_empty()
                    && consumers.iter().all(|n| {
                        quantized(n.id)
                            && n.op.weight_index().is_some_and(|w| {
                                n.inputs
                                    .iter()
                                    .enumerate()
                                    .all(|(slot, &e)| e != p || slot == w)
                            })
                    })
            })
            .map(|&p| self.src.edge_name(p).to_string())
            .collect()
    }

    fn build(&mut self, int8_weights: &BTreeSet<String>) -> Result<(), QuantizeError> {
        for &input in &self.src.inputs {
            let info = self.src_info(input)?;
            let id = self.out.add_input(info.name, info.scalar, info.shape)?;
            self.float_of.insert(input, id);
        }
        for &param in &self.src.params {
            let info = self.src_info(param)?;
            let scalar = if int8_weights.contains(&info.name) {
                Scalar::I8
            } else {
                info.scalar
            };
            let id = self.out.add_param(info.name, scalar, info.shape)?;
            self.float_of.insert(param, id);
        }

        let src = self.src;
        for node in src.topological_order()? {
            match self.plans.get(&node.id).copied().flatten() {
                None => self.emit_float(node)?,
                Some(enc) if is_weighted(&node.op) => self.emit_accumulating(node, enc)?,
                Some(enc) => self.emit_requantized(node, enc)?,
            }
        }

        let outputs = src
            .outputs
            .iter()
            .map(|&e| self.float(e))
            .collect::<Result<Vec<_>, _>>()?;
        self.out.set_outputs(outputs);
        Ok(())
    }

    fn src_info(&self, edge: EdgeId) -> Result<TensorInfo, QuantizeError> {
        self.src.edge(edge).cloned().ok_or_else(|| {
            sgfuse_ir::IrError::UnknownEdge {
                node: "?".into(),
                edge: edge.0,
            }
            .into()
        })
    }

    fn emit_float(&mut self, node: &GraphNode) -> Result<(), QuantizeError> {
        let inputs = node
            .inputs
            .iter()
            .map(|&e| self.float(e))
            .collect::<Result<Vec<_>, _>>()?;
        let out = self.out.add_edge(self.src_info(node.output())?)?;
        self.out
            .add_node(node.op.clone(), inputs, vec![out], node.name.clone())?;
        self.float_of.insert(node.output(), out);
        Ok(())
    }

    /// Conv / fully-connected: int32 accumulators, then a requantize to the
    /// calibrated output range.
    fn emit_accumulating(&mut self, node: &GraphNode, enc: Encoding) -> Result<(), QuantizeError> {
        let weight = node.op.weight_index();
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for (slot, &e) in node.inputs.iter().enumerate() {
            inputs.push(match slot {
                0 => self.quantized(e)?,
                s if Some(s) == weight => self.float(e)?,
                _ => self.any(e)?,
            });
        }

        let info = self.src_info(node.output())?;
        let acc = self.out.add_edge(TensorInfo::new(
            format!("{}_int32", node.name),
            Scalar::I32,
            info.shape.clone(),
        ))?;
        self.out.add_node(
            OpKind::Quantized {
                inner: Box::new(node.op.clone()),
                output: QuantizedOutput::Int32,
            },
            inputs,
            vec![acc],
            node.name.clone(),
        )?;

        let (out_type, range) = enc;
        let out = self
            .out
            .add_edge(TensorInfo::new(info.name, out_type.scalar(), info.shape))?;
        self.out.add_node(
            OpKind::Requantize { out_type, range },
            vec![acc],
            vec![out],
            format!("{}_requantize", node.name),
        )?;
        self.quant_of.insert(node.output(), (out, enc));
        Ok(())
    }

    /// Pooling / concat: fixed point in, fixed point out at `enc`.
    fn emit_requantized(&mut self, node: &GraphNode, enc: Encoding) -> Result<(), QuantizeError> {
        let inputs = node
            .inputs
            .iter()
            .map(|&e| self.quantized(e))
            .collect::<Result<Vec<_>, _>>()?;
        let (out_type, range) = enc;
        let info = self.src_info(node.output())?;
        let out = self
            .out
            .add_edge(TensorInfo::new(info.name, out_type.scalar(), info.shape))?;
        self.out.add_node(
            OpKind::Quantized {
                inner: Box::new(node.op.clone()),
                output: QuantizedOutput::Requantized { out_type, range },
            },
            inputs,
            vec![out],
            node.name.clone(),
        )?;
        self.quant_of.insert(node.output(), (out, enc));
        Ok(())
    }

    /// Float version of `edge`, dequantizing on first use if needed.
    fn float(&mut self, edge: EdgeId) -> Result<EdgeId, QuantizeError> {
        if let Some(&id) = self.float_of.get(&edge) {
            return Ok(id);
        }
        let Some(&(q, _)) = self.quant_of.get(&edge) else {
            return Err(sgfuse_ir::IrError::UnknownEdge {
                node: self.src.edge_name(edge).to_string(),
                edge: edge.0,
            }
            .into());
        };
        let name = format!("{}_dequantize", self.src.edge_name(edge));
        let id = self.out.add_op(OpKind::Dequantize, vec![q], name)?;
        self.float_of.insert(edge, id);
        Ok(id)
    }

    /// Fixed-point version of `edge`, quantizing on first use if needed.
    fn quantized(&mut self, edge: EdgeId) -> Result<EdgeId, QuantizeError> {
        if let Some(&(id, _)) = self.quant_of.get(&edge) {
            return Ok(id);
        }
        let (out_type, range) = self.encoding_for(edge)?.ok_or_else(|| QuantizeError::InvalidRange {
            edge: self.src.edge_name(edge).to_string(),
        })?;
        let source = self.float(edge)?;
        let name = format!("{}_quantize", self.src.edge_name(edge));
        let id = self
            .out
            .add_op(OpKind::Quantize { out_type, range }, vec![source], name)?;
        self.quant_of.insert(edge, (id, (out_type, range)));
        Ok(id)
    }

    /// Whichever version already exists, preferring fixed point.
    fn any(&mut self, edge: EdgeId) -> Result<EdgeId, QuantizeError> {
        match self.quant_of.get(&edge) {
            Some(&(id, _)) => Ok(id),
            None => self.float(edge),
        }
    }
}
