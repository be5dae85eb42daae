//! Hand-written prost messages for the sgfuse model container.
//!
//! The layout follows ONNX loosely (model → graph → nodes, value infos,
//! initializers) but carries sgfuse operator types and per-tensor
//! quantization parameters.

use prost::Message;

/// Top-level container.
#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub format_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(string, tag = "3")]
    pub producer_version: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
}

/// A compute graph with its bound parameters.
#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    /// Nodes in topological order.
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: String,
    /// Parameter values.
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    /// Data inputs.
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    /// Names of the graph outputs.
    #[prost(string, repeated, tag = "12")]
    pub output: Vec<String>,
    /// Node output edges.
    #[prost(message, repeated, tag = "13")]
    pub value_info: Vec<ValueInfoProto>,
    /// Parameter edges, in declaration order.
    #[prost(message, repeated, tag = "14")]
    pub param: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(oneof = "attribute_proto::Value", tags = "2, 3, 4, 8, 9")]
    pub value: Option<attribute_proto::Value>,
}

pub mod attribute_proto {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(float, tag = "2")]
        F(f32),
        #[prost(int64, tag = "3")]
        I(i64),
        #[prost(string, tag = "4")]
        S(String),
        #[prost(message, tag = "8")]
        Ints(super::Int64List),
        #[prost(bool, tag = "9")]
        B(bool),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Int64List {
    #[prost(int64, repeated, tag = "1")]
    pub values: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub elem_type: i32,
    #[prost(message, repeated, tag = "3")]
    pub dim: Vec<TensorShapeDimension>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeDimension {
    #[prost(oneof = "tensor_shape_dimension::Value", tags = "1, 2")]
    pub value: Option<tensor_shape_dimension::Value>,
}

pub mod tensor_shape_dimension {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(int64, tag = "1")]
        DimValue(i64),
        #[prost(string, tag = "2")]
        DimParam(String),
    }
}

/// A parameter value.
///
/// Float tensors fill `float_data`. Integer tensors fill `int32_data`
/// (widened) and carry `scale` / `zero_point`.
#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, repeated, tag = "2")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "3")]
    pub data_type: i32,
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    #[prost(int32, repeated, tag = "5")]
    pub int32_data: Vec<i32>,
    #[prost(float, tag = "6")]
    pub scale: f32,
    #[prost(int32, tag = "7")]
    pub zero_point: i32,
}

/// Element type codes (ONNX numbering).
pub mod data_type {
    pub const FLOAT: i32 = 1;
    pub const UINT8: i32 = 2;
    pub const INT8: i32 = 3;
    pub const INT32: i32 = 6;
}

/// Current container version.
pub const FORMAT_VERSION: i64 = 1;

impl ModelProto {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_roundtrip() {
        let model = ModelProto {
            format_version: FORMAT_VERSION,
            producer_name: "sgfuse".into(),
            producer_version: "0.1.0".into(),
            graph: Some(GraphProto {
                name: "g".into(),
                node: vec![NodeProto {
                    input: vec!["x".into()],
                    output: vec!["relu_output".into()],
                    name: "relu".into(),
                    op_type: "Activation".into(),
                    attribute: vec![AttributeProto {
                        name: "act_type".into(),
                        value: Some(attribute_proto::Value::S("relu".into())),
                    }],
                }],
                input: vec![ValueInfoProto {
                    name: "x".into(),
                    elem_type: data_type::FLOAT,
                    dim: vec![
                        TensorShapeDimension {
                            value: Some(tensor_shape_dimension::Value::DimParam("batch".into())),
                        },
                        TensorShapeDimension {
                            value: Some(tensor_shape_dimension::Value::DimValue(8)),
                        },
                    ],
                }],
                output: vec!["relu_output".into()],
                ..Default::default()
            }),
        };
        let bytes = model.to_bytes();
        let decoded = ModelProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, model);
    }

    #[test]
    fn quantized_tensor_roundtrip() {
        let t = TensorProto {
            name: "w".into(),
            dims: vec![2, 2],
            data_type: data_type::INT8,
            int32_data: vec![-127, 0, 5, 127],
            scale: 0.25,
            ..Default::default()
        };
        let decoded = TensorProto::decode(t.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.int32_data, vec![-127, 0, 5, 127]);
        assert_eq!(decoded.scale, 0.25);
        assert!(decoded.float_data.is_empty());
    }

    #[test]
    fn ints_attribute_roundtrip() {
        let attr = AttributeProto {
            name: "kernel".into(),
            value: Some(attribute_proto::Value::Ints(Int64List { values: vec![3, 3] })),
        };
        let decoded = AttributeProto::decode(attr.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, attr);
    }
}
