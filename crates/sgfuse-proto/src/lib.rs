//! Protobuf serialization of sgfuse graphs.
//!
//! A model is a [`ComputeGraph`] plus its [`ParamSet`]. Operators are written
//! through their attribute view ([`OpKind::attributes`]) and rebuilt with
//! [`OpKind::from_attributes`], so fused and quantized nodes survive a
//! save/load cycle. Quantized parameters keep their integer payload, scale
//! and zero point.

mod error;
pub mod proto;

pub use error::ProtoError;

use std::collections::HashMap;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use prost::Message;
use sgfuse_exec::{ParamSet, QTensor, Tensor};
use sgfuse_ir::{
    AttrValue, Attributes, ComputeGraph, Dimension, EdgeId, IrError, OpKind, QuantDtype,
    QuantizationParams, Scalar, TensorInfo, TensorShape,
};

use proto::{
    AttributeProto, GraphProto, Int64List, ModelProto, NodeProto, TensorProto,
    TensorShapeDimension, ValueInfoProto, attribute_proto, data_type, tensor_shape_dimension,
};

const PRODUCER_NAME: &str = "sgfuse";

/// Serialize a graph and its parameters.
///
/// Nodes are written in topological order. Parameters missing from
/// `params` are declared but carry no initializer.
pub fn encode_model(graph: &ComputeGraph, params: &ParamSet) -> Result<Vec<u8>, ProtoError> {
    let model = ModelProto {
        format_version: proto::FORMAT_VERSION,
        producer_name: PRODUCER_NAME.into(),
        producer_version: env!("CARGO_PKG_VERSION").into(),
        graph: Some(graph_to_proto(graph, params)?),
    };
    Ok(model.to_bytes())
}

/// Deserialize a model. Malformed input yields an error, never a panic.
pub fn decode_model(bytes: &[u8]) -> Result<(ComputeGraph, ParamSet), ProtoError> {
    let model = ModelProto::decode(bytes)?;
    if model.format_version != proto::FORMAT_VERSION {
        return Err(ProtoError::UnsupportedVersion(model.format_version));
    }
    let graph = model.graph.ok_or(ProtoError::MissingGraph)?;
    graph_from_proto(&graph)
}

/// Write a model to `path`.
pub fn save_model(
    path: impl AsRef<Path>,
    graph: &ComputeGraph,
    params: &ParamSet,
) -> Result<(), ProtoError> {
    let path = path.as_ref();
    let bytes = encode_model(graph, params)?;
    std::fs::write(path, &bytes).map_err(|source| ProtoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("wrote model to {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Read a model from `path`.
pub fn load_model(path: impl AsRef<Path>) -> Result<(ComputeGraph, ParamSet), ProtoError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| ProtoError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let (graph, params) = decode_model(&bytes)?;
    log::debug!(
        "loaded {}: {} nodes, {} params",
        path.display(),
        graph.node_count(),
        params.len()
    );
    Ok((graph, params))
}

// ---- encoding ----

fn graph_to_proto(graph: &ComputeGraph, params: &ParamSet) -> Result<GraphProto, ProtoError> {
    let edge = |e: EdgeId, node: &str| -> Result<&TensorInfo, ProtoError> {
        graph.edge(e).ok_or_else(|| {
            IrError::UnknownEdge {
                node: node.to_string(),
                edge: e.0,
            }
            .into()
        })
    };

    let mut out = GraphProto {
        name: "sgfuse".into(),
        ..Default::default()
    };
    for &e in &graph.inputs {
        out.input.push(value_info(edge(e, "<inputs>")?)?);
    }
    for &e in &graph.params {
        let info = edge(e, "<params>")?;
        out.param.push(value_info(info)?);
        match params.get(&info.name) {
            Some(tensor) => out.initializer.push(tensor_to_proto(&info.name, tensor)),
            None => log::debug!("parameter '{}' has no value", info.name),
        }
    }

    for node in graph.topological_order()? {
        let mut input = Vec::with_capacity(node.inputs.len());
        for &e in &node.inputs {
            input.push(edge(e, &node.name)?.name.clone());
        }
        let mut output = Vec::with_capacity(node.outputs.len());
        for &e in &node.outputs {
            let info = edge(e, &node.name)?;
            output.push(info.name.clone());
            out.value_info.push(value_info(info)?);
        }
        out.node.push(NodeProto {
            input,
            output,
            name: node.name.clone(),
            op_type: node.op.op_type(),
            attribute: node.op.attributes().iter().map(attribute_to_proto).collect(),
        });
    }

    for &e in &graph.outputs {
        out.output.push(edge(e, "<outputs>")?.name.clone());
    }
    Ok(out)
}

fn scalar_code(scalar: Scalar) -> Result<i32, ProtoError> {
    match scalar {
        Scalar::F32 => Ok(data_type::FLOAT),
        Scalar::I8 => Ok(data_type::INT8),
        Scalar::U8 => Ok(data_type::UINT8),
        Scalar::I32 => Ok(data_type::INT32),
        other => Err(ProtoError::UnsupportedScalar(other.to_string())),
    }
}

fn quant_code(dtype: QuantDtype) -> i32 {
    match dtype {
        QuantDtype::Int8 => data_type::INT8,
        QuantDtype::Uint8 => data_type::UINT8,
        QuantDtype::Int32 => data_type::INT32,
    }
}

fn value_info(info: &TensorInfo) -> Result<ValueInfoProto, ProtoError> {
    Ok(ValueInfoProto {
        name: info.name.clone(),
        elem_type: scalar_code(info.scalar)?,
        dim: info
            .shape
            .dims
            .iter()
            .map(|d| TensorShapeDimension {
                value: match d {
                    Dimension::Fixed(n) => Some(tensor_shape_dimension::Value::DimValue(*n as i64)),
                    Dimension::Dynamic(Some(name)) => {
                        Some(tensor_shape_dimension::Value::DimParam(name.clone()))
                    }
                    Dimension::Dynamic(None) => None,
                },
            })
            .collect(),
    })
}

fn attribute_to_proto((name, value): (&String, &AttrValue)) -> AttributeProto {
    use attribute_proto::Value;
    let value = match value {
        AttrValue::Bool(b) => Value::B(*b),
        AttrValue::Int(i) => Value::I(*i),
        AttrValue::Float(f) => Value::F(*f),
        AttrValue::Str(s) => Value::S(s.clone()),
        AttrValue::Ints(v) => Value::Ints(Int64List { values: v.clone() }),
    };
    AttributeProto {
        name: name.clone(),
        value: Some(value),
    }
}

fn tensor_to_proto(name: &str, tensor: &Tensor) -> TensorProto {
    let dims = tensor.shape().iter().map(|&d| d as i64).collect();
    match tensor {
        Tensor::Float(a) => TensorProto {
            name: name.to_string(),
            dims,
            data_type: data_type::FLOAT,
            float_data: a.iter().copied().collect(),
            ..Default::default()
        },
        Tensor::Quantized(q) => TensorProto {
            name: name.to_string(),
            dims,
            data_type: quant_code(q.dtype),
            int32_data: q.data.iter().copied().collect(),
            scale: q.params.scale,
            zero_point: q.params.zero_point,
            ..Default::default()
        },
    }
}

// ---- decoding ----

fn graph_from_proto(proto: &GraphProto) -> Result<(ComputeGraph, ParamSet), ProtoError> {
    let mut graph = ComputeGraph::new();
    let mut edges: HashMap<String, EdgeId> = HashMap::new();

    for vi in &proto.input {
        let (scalar, shape) = decode_value_info(vi)?;
        edges.insert(vi.name.clone(), graph.add_input(vi.name.clone(), scalar, shape)?);
    }
    for vi in &proto.param {
        let (scalar, shape) = decode_value_info(vi)?;
        edges.insert(vi.name.clone(), graph.add_param(vi.name.clone(), scalar, shape)?);
    }
    for vi in &proto.value_info {
        let (scalar, shape) = decode_value_info(vi)?;
        let id = graph.add_edge(TensorInfo::new(vi.name.clone(), scalar, shape))?;
        edges.insert(vi.name.clone(), id);
    }

    let resolve = |names: &[String], node: &str| -> Result<Vec<EdgeId>, ProtoError> {
        names
            .iter()
            .map(|name| {
                edges
                    .get(name)
                    .copied()
                    .ok_or_else(|| ProtoError::UndeclaredTensor {
                        node: node.to_string(),
                        name: name.clone(),
                    })
            })
            .collect()
    };

    for node in &proto.node {
        let attrs = decode_attributes(node)?;
        let op = OpKind::from_attributes(&node.op_type, &attrs)?;
        let inputs = resolve(&node.input, &node.name)?;
        let outputs = resolve(&node.output, &node.name)?;
        check_signature(&node.name, &op, inputs.len(), outputs.len())?;
        graph.add_node(op, inputs, outputs, node.name.clone())?;
    }
    graph.set_outputs(resolve(&proto.output, "<outputs>")?);

    let mut params = ParamSet::new();
    for t in &proto.initializer {
        let declared = edges
            .get(&t.name)
            .copied()
            .filter(|&e| graph.is_param(e))
            .and_then(|e| graph.edge(e))
            .ok_or_else(|| ProtoError::InvalidTensor {
                name: t.name.clone(),
                detail: "not a declared parameter".into(),
            })?;
        let tensor = decode_tensor(t)?;
        if let Some(expected) = declared.shape.to_fixed()
            && expected.as_slice() != tensor.shape()
        {
            return Err(ProtoError::InvalidTensor {
                name: t.name.clone(),
                detail: format!("shape {:?} does not match declared {}", tensor.shape(), declared.shape),
            });
        }
        params.insert(t.name.clone(), tensor);
    }

    graph.validate()?;
    Ok((graph, params))
}

/// Every operator produces one tensor and takes a fixed number of inputs
/// (concat: at least one).
fn check_signature(node: &str, op: &OpKind, inputs: usize, outputs: usize) -> Result<(), ProtoError> {
    if outputs != 1 {
        return Err(ProtoError::OutputCount {
            node: node.to_string(),
            found: outputs,
        });
    }
    let ok = match op.expected_inputs() {
        Some(expected) => expected == inputs,
        None => inputs > 0,
    };
    if !ok {
        return Err(IrError::Arity {
            node: node.to_string(),
            expected: op.expected_inputs().unwrap_or(1),
            found: inputs,
        }
        .into());
    }
    Ok(())
}

fn decode_scalar(name: &str, code: i32) -> Result<Scalar, ProtoError> {
    match code {
        data_type::FLOAT => Ok(Scalar::F32),
        data_type::INT8 => Ok(Scalar::I8),
        data_type::UINT8 => Ok(Scalar::U8),
        data_type::INT32 => Ok(Scalar::I32),
        code => Err(ProtoError::UnknownDataType {
            name: name.to_string(),
            code,
        }),
    }
}

fn decode_value_info(vi: &ValueInfoProto) -> Result<(Scalar, TensorShape), ProtoError> {
    let scalar = decode_scalar(&vi.name, vi.elem_type)?;
    let dims = vi
        .dim
        .iter()
        .map(|d| match &d.value {
            Some(tensor_shape_dimension::Value::DimValue(n)) => u32::try_from(*n)
                .map(Dimension::Fixed)
                .map_err(|_| ProtoError::InvalidTensor {
                    name: vi.name.clone(),
                    detail: format!("dimension {n} out of range"),
                }),
            Some(tensor_shape_dimension::Value::DimParam(p)) => Ok(Dimension::Dynamic(Some(p.clone()))),
            None => Ok(Dimension::Dynamic(None)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((scalar, TensorShape { dims }))
}

fn decode_attributes(node: &NodeProto) -> Result<Attributes, ProtoError> {
    use attribute_proto::Value;
    let mut attrs = Attributes::new();
    for a in &node.attribute {
        let value = match &a.value {
            Some(Value::B(b)) => AttrValue::Bool(*b),
            Some(Value::I(i)) => AttrValue::Int(*i),
            Some(Value::F(f)) => AttrValue::Float(*f),
            Some(Value::S(s)) => AttrValue::Str(s.clone()),
            Some(Value::Ints(list)) => AttrValue::Ints(list.values.clone()),
            None => {
                return Err(ProtoError::EmptyAttribute {
                    node: node.name.clone(),
                    attr: a.name.clone(),
                });
            }
        };
        attrs.insert(a.name.clone(), value);
    }
    Ok(attrs)
}

fn decode_tensor(t: &TensorProto) -> Result<Tensor, ProtoError> {
    let invalid = |detail: String| ProtoError::InvalidTensor {
        name: t.name.clone(),
        detail,
    };
    let shape = t
        .dims
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| invalid(format!("negative dimension {d}"))))
        .collect::<Result<Vec<_>, _>>()?;

    let dtype = match t.data_type {
        data_type::FLOAT => {
            let array = ArrayD::from_shape_vec(IxDyn(&shape), t.float_data.clone())
                .map_err(|e| invalid(e.to_string()))?;
            return Ok(Tensor::Float(array));
        }
        data_type::INT8 => QuantDtype::Int8,
        data_type::UINT8 => QuantDtype::Uint8,
        data_type::INT32 => QuantDtype::Int32,
        code => {
            return Err(ProtoError::UnknownDataType {
                name: t.name.clone(),
                code,
            });
        }
    };

    if !(t.scale.is_finite() && t.scale > 0.0) {
        return Err(invalid(format!("scale {} is not positive", t.scale)));
    }
    let (lo, hi) = (dtype.qmin(), dtype.qmax());
    if let Some(q) = t.int32_data.iter().find(|&&q| !(lo..=hi).contains(&i64::from(q))) {
        return Err(invalid(format!("value {q} outside {dtype} range")));
    }
    let data = ArrayD::from_shape_vec(IxDyn(&shape), t.int32_data.clone())
        .map_err(|e| invalid(e.to_string()))?;
    Ok(Tensor::Quantized(QTensor {
        data,
        dtype,
        params: QuantizationParams {
            scale: t.scale,
            zero_point: t.zero_point,
        },
    }))
}
