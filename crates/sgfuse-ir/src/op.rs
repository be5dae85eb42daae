//! Operator kinds and their typed parameters.
//!
//! Every node carries exactly one [`OpKind`]. The string view of a node
//! ([`OpKind::op_type`] plus [`OpKind::attributes`]) is lossless, so a kind can
//! be rebuilt from it with [`OpKind::from_attributes`].

use std::fmt;
use std::str::FromStr;

use crate::attr::{AttrValue, Attributes};
use crate::error::IrError;
use crate::quant::{CalibRange, QuantDtype};

/// Activation function.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ActType {
    Relu,
    Sigmoid,
    Tanh,
}

impl ActType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
        }
    }
}

impl FromStr for ActType {
    type Err = IrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            other => Err(IrError::InvalidAttribute {
                op_type: "Activation".into(),
                attr: "act_type".into(),
                detail: format!("unknown activation `{other}`"),
            }),
        }
    }
}

/// Pooling reduction.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum PoolType {
    Max,
    Avg,
}

impl PoolType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Avg => "avg",
        }
    }
}

/// 2-D convolution over NCHW data with OIHW weights.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvParams {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub num_filter: usize,
    pub no_bias: bool,
}

impl ConvParams {
    /// A stride-1, unpadded convolution with bias.
    pub fn new(kernel: [usize; 2], num_filter: usize) -> Self {
        Self {
            kernel,
            stride: [1, 1],
            pad: [0, 0],
            num_filter,
            no_bias: false,
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_pad(mut self, pad: [usize; 2]) -> Self {
        self.pad = pad;
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.no_bias = true;
        self
    }

    pub(crate) fn num_inputs(&self) -> usize {
        if self.no_bias { 2 } else { 3 }
    }
}

/// Inference-mode batch normalization over axis 1.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNormParams {
    pub eps: f32,
    /// Treat gamma as 1 regardless of its bound value.
    pub fix_gamma: bool,
}

impl Default for BatchNormParams {
    fn default() -> Self {
        Self {
            eps: 1e-3,
            fix_gamma: true,
        }
    }
}

/// 2-D pooling over NCHW data.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolParams {
    pub pool_type: PoolType,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub global_pool: bool,
}

impl PoolParams {
    pub fn new(pool_type: PoolType, kernel: [usize; 2]) -> Self {
        Self {
            pool_type,
            kernel,
            stride: [1, 1],
            pad: [0, 0],
            global_pool: false,
        }
    }

    pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
        self.stride = stride;
        self
    }
}

/// Fully-connected layer `y = x W^T + b`.
#[derive(Clone, Debug, PartialEq)]
pub struct FcParams {
    pub num_hidden: usize,
    pub no_bias: bool,
    /// Collapse all non-batch axes before the product.
    pub flatten: bool,
}

impl FcParams {
    pub fn new(num_hidden: usize) -> Self {
        Self {
            num_hidden,
            no_bias: false,
            flatten: true,
        }
    }

    pub(crate) fn num_inputs(&self) -> usize {
        if self.no_bias { 2 } else { 3 }
    }
}

/// A convolution with absorbed batch-norm, sum and relu steps.
#[derive(Clone, Debug, PartialEq)]
pub struct FusedConvParams {
    pub conv: ConvParams,
    pub bn: Option<BatchNormParams>,
    pub with_relu: bool,
    pub with_sum: bool,
    pub with_postsum_relu: bool,
}

impl FusedConvParams {
    pub fn plain(conv: ConvParams) -> Self {
        Self {
            conv,
            bn: None,
            with_relu: false,
            with_sum: false,
            with_postsum_relu: false,
        }
    }

    /// Input slot of the sum addend, when a sum was absorbed.
    pub fn addend_index(&self) -> Option<usize> {
        self.with_sum.then(|| self.num_inputs() - 1)
    }

    fn num_inputs(&self) -> usize {
        self.conv.num_inputs() + if self.bn.is_some() { 4 } else { 0 } + usize::from(self.with_sum)
    }
}

/// A fully-connected layer with an optional absorbed relu.
#[derive(Clone, Debug, PartialEq)]
pub struct FusedFcParams {
    pub fc: FcParams,
    pub with_relu: bool,
}

/// What a quantized operator emits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum QuantizedOutput {
    /// Raw int32 accumulators, to be requantized downstream.
    Int32,
    /// Already requantized to `out_type` over the calibrated range.
    Requantized {
        out_type: QuantDtype,
        range: CalibRange,
    },
    /// Dequantized in place; no calibration range is attached.
    Float,
}

/// The closed set of operator kinds a graph can hold.
#[derive(Clone, Debug, PartialEq)]
pub enum OpKind {
    Convolution(ConvParams),
    BatchNorm(BatchNormParams),
    Activation(ActType),
    ElemwiseAdd,
    Pooling(PoolParams),
    Concat {
        axis: usize,
    },
    FullyConnected(FcParams),
    /// Softmax over the last axis.
    Softmax,
    FusedConv(FusedConvParams),
    FusedFullyConnected(FusedFcParams),
    /// Float to fixed point over a calibrated range.
    Quantize {
        out_type: QuantDtype,
        range: CalibRange,
    },
    /// Fixed point back to float.
    Dequantize,
    /// Fixed point to `out_type` over a calibrated range.
    Requantize {
        out_type: QuantDtype,
        range: CalibRange,
    },
    /// A fixed-point version of `inner`.
    Quantized {
        inner: Box<OpKind>,
        output: QuantizedOutput,
    },
}

const QUANTIZED_PREFIX: &str = "quantized_";

impl OpKind {
    /// Operator type string, as used in dumps and serialized graphs.
    pub fn op_type(&self) -> String {
        let s = match self {
            Self::Convolution(_) => "Convolution",
            Self::BatchNorm(_) => "BatchNorm",
            Self::Activation(_) => "Activation",
            Self::ElemwiseAdd => "elemwise_add",
            Self::Pooling(_) => "Pooling",
            Self::Concat { .. } => "Concat",
            Self::FullyConnected(_) => "FullyConnected",
            Self::Softmax => "softmax",
            Self::FusedConv(_) => "sg_conv",
            Self::FusedFullyConnected(_) => "sg_fully_connected",
            Self::Quantize { .. } => "quantize",
            Self::Dequantize => "dequantize",
            Self::Requantize { .. } => "requantize",
            Self::Quantized { inner, .. } => return format!("{QUANTIZED_PREFIX}{}", inner.op_type()),
        };
        s.to_string()
    }

    /// Whether this node was produced by the fusion rewriter.
    pub fn is_fused(&self) -> bool {
        matches!(self, Self::FusedConv(_) | Self::FusedFullyConnected(_))
    }

    /// Whether this node consumes or produces fixed-point tensors.
    pub fn is_quantized(&self) -> bool {
        matches!(
            self,
            Self::Quantized { .. } | Self::Requantize { .. } | Self::Quantize { .. }
        )
    }

    /// Input slot holding the weight parameter, for ops that have one.
    pub fn weight_index(&self) -> Option<usize> {
        match self {
            Self::Convolution(_)
            | Self::FullyConnected(_)
            | Self::FusedConv(_)
            | Self::FusedFullyConnected(_) => Some(1),
            Self::Quantized { inner, .. } => inner.weight_index(),
            _ => None,
        }
    }

    /// Number of inputs this kind requires, or `None` when variadic.
    pub fn expected_inputs(&self) -> Option<usize> {
        match self {
            Self::Convolution(p) => Some(p.num_inputs()),
            Self::BatchNorm(_) => Some(5),
            Self::ElemwiseAdd => Some(2),
            Self::FullyConnected(p) => Some(p.num_inputs()),
            Self::FusedConv(p) => Some(p.num_inputs()),
            Self::FusedFullyConnected(p) => Some(p.fc.num_inputs()),
            Self::Concat { .. } => None,
            Self::Quantized { inner, .. } => inner.expected_inputs(),
            Self::Activation(_)
            | Self::Pooling(_)
            | Self::Softmax
            | Self::Quantize { .. }
            | Self::Dequantize
            | Self::Requantize { .. } => Some(1),
        }
    }

    /// The attribute view of this operator.
    ///
    /// Fusion flags (`with_bn`, `with_relu`, ...) only appear when set.
    pub fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        match self {
            Self::Convolution(p) => conv_attrs(&mut attrs, p),
            Self::BatchNorm(p) => bn_attrs(&mut attrs, p),
            Self::Activation(act) => {
                attrs.insert("act_type", AttrValue::Str(act.as_str().into()));
            }
            Self::Pooling(p) => {
                attrs.insert("pool_type", AttrValue::Str(p.pool_type.as_str().into()));
                attrs.insert("kernel", pair(p.kernel));
                attrs.insert("stride", pair(p.stride));
                attrs.insert("pad", pair(p.pad));
                attrs.insert("global_pool", AttrValue::Bool(p.global_pool));
            }
            Self::Concat { axis } => {
                attrs.insert("dim", AttrValue::Int(*axis as i64));
            }
            Self::FullyConnected(p) => fc_attrs(&mut attrs, p),
            Self::ElemwiseAdd | Self::Softmax | Self::Dequantize => {}
            Self::FusedConv(p) => {
                conv_attrs(&mut attrs, &p.conv);
                if let Some(bn) = &p.bn {
                    bn_attrs(&mut attrs, bn);
                }
                attrs.set_flag("with_bn", p.bn.is_some());
                attrs.set_flag("with_relu", p.with_relu);
                attrs.set_flag("with_sum", p.with_sum);
                attrs.set_flag("with_postsum_relu", p.with_postsum_relu);
            }
            Self::FusedFullyConnected(p) => {
                fc_attrs(&mut attrs, &p.fc);
                attrs.set_flag("with_relu", p.with_relu);
            }
            Self::Quantize { out_type, range } | Self::Requantize { out_type, range } => {
                range_attrs(&mut attrs, *out_type, range);
            }
            Self::Quantized { inner, output } => {
                attrs.extend(inner.attributes());
                match output {
                    QuantizedOutput::Int32 => {
                        attrs.insert("out_type", AttrValue::Str(QuantDtype::Int32.as_str().into()));
                    }
                    QuantizedOutput::Requantized { out_type, range } => {
                        range_attrs(&mut attrs, *out_type, range);
                    }
                    QuantizedOutput::Float => attrs.set_flag("enable_float_output", true),
                }
            }
        }
        attrs
    }

    /// Rebuild an operator from its type string and attribute view.
    pub fn from_attributes(op_type: &str, attrs: &Attributes) -> Result<Self, IrError> {
        if let Some(inner_type) = op_type.strip_prefix(QUANTIZED_PREFIX) {
            let inner = Self::from_attributes(inner_type, attrs)?;
            let output = if attrs.flag("enable_float_output") {
                QuantizedOutput::Float
            } else {
                let out_type: QuantDtype = attrs.require_str(op_type, "out_type")?.parse()?;
                if out_type == QuantDtype::Int32 {
                    QuantizedOutput::Int32
                } else {
                    QuantizedOutput::Requantized {
                        out_type,
                        range: parse_range(op_type, attrs)?,
                    }
                }
            };
            return Ok(Self::Quantized {
                inner: Box::new(inner),
                output,
            });
        }

        let op = match op_type {
            "Convolution" => Self::Convolution(parse_conv(op_type, attrs)?),
            "BatchNorm" => Self::BatchNorm(parse_bn(op_type, attrs)?),
            "Activation" => Self::Activation(attrs.require_str(op_type, "act_type")?.parse()?),
            "elemwise_add" => Self::ElemwiseAdd,
            "Pooling" => {
                let pool_type = match attrs.require_str(op_type, "pool_type")? {
                    "max" => PoolType::Max,
                    "avg" => PoolType::Avg,
                    other => {
                        return Err(IrError::InvalidAttribute {
                            op_type: op_type.into(),
                            attr: "pool_type".into(),
                            detail: format!("unknown pooling `{other}`"),
                        });
                    }
                };
                Self::Pooling(PoolParams {
                    pool_type,
                    kernel: attrs.require_pair(op_type, "kernel")?,
                    stride: attrs.require_pair(op_type, "stride")?,
                    pad: attrs.require_pair(op_type, "pad")?,
                    global_pool: attrs.flag("global_pool"),
                })
            }
            "Concat" => Self::Concat {
                axis: non_negative(op_type, "dim", attrs.require_int(op_type, "dim")?)?,
            },
            "FullyConnected" => Self::FullyConnected(parse_fc(op_type, attrs)?),
            "softmax" => Self::Softmax,
            "sg_conv" => Self::FusedConv(FusedConvParams {
                conv: parse_conv(op_type, attrs)?,
                bn: if attrs.flag("with_bn") {
                    Some(parse_bn(op_type, attrs)?)
                } else {
                    None
                },
                with_relu: attrs.flag("with_relu"),
                with_sum: attrs.flag("with_sum"),
                with_postsum_relu: attrs.flag("with_postsum_relu"),
            }),
            "sg_fully_connected" => Self::FusedFullyConnected(FusedFcParams {
                fc: parse_fc(op_type, attrs)?,
                with_relu: attrs.flag("with_relu"),
            }),
            "quantize" | "requantize" => {
                let out_type = attrs.require_str(op_type, "out_type")?.parse()?;
                let range = parse_range(op_type, attrs)?;
                if op_type == "quantize" {
                    Self::Quantize { out_type, range }
                } else {
                    Self::Requantize { out_type, range }
                }
            }
            "dequantize" => Self::Dequantize,
            other => return Err(IrError::UnknownOp(other.into())),
        };
        Ok(op)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.op_type())?;
        let attrs = self.attributes();
        if !attrs.is_empty() {
            write!(f, "(")?;
            for (i, (k, v)) in attrs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}={v}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

fn pair(v: [usize; 2]) -> AttrValue {
    AttrValue::Ints(vec![v[0] as i64, v[1] as i64])
}

fn conv_attrs(attrs: &mut Attributes, p: &ConvParams) {
    attrs.insert("kernel", pair(p.kernel));
    attrs.insert("stride", pair(p.stride));
    attrs.insert("pad", pair(p.pad));
    attrs.insert("num_filter", AttrValue::Int(p.num_filter as i64));
    attrs.insert("no_bias", AttrValue::Bool(p.no_bias));
}

fn bn_attrs(attrs: &mut Attributes, p: &BatchNormParams) {
    attrs.insert("eps", AttrValue::Float(p.eps));
    attrs.insert("fix_gamma", AttrValue::Bool(p.fix_gamma));
}

fn fc_attrs(attrs: &mut Attributes, p: &FcParams) {
    attrs.insert("num_hidden", AttrValue::Int(p.num_hidden as i64));
    attrs.insert("no_bias", AttrValue::Bool(p.no_bias));
    attrs.insert("flatten", AttrValue::Bool(p.flatten));
}

fn range_attrs(attrs: &mut Attributes, out_type: QuantDtype, range: &CalibRange) {
    attrs.insert("out_type", AttrValue::Str(out_type.as_str().into()));
    attrs.insert("min_calib_range", AttrValue::Float(range.min));
    attrs.insert("max_calib_range", AttrValue::Float(range.max));
}

fn non_negative(op_type: &str, attr: &str, v: i64) -> Result<usize, IrError> {
    usize::try_from(v).map_err(|_| IrError::InvalidAttribute {
        op_type: op_type.into(),
        attr: attr.into(),
        detail: format!("expected a non-negative integer, found {v}"),
    })
}

fn parse_conv(op_type: &str, attrs: &Attributes) -> Result<ConvParams, IrError> {
    Ok(ConvParams {
        kernel: attrs.require_pair(op_type, "kernel")?,
        stride: attrs.require_pair(op_type, "stride")?,
        pad: attrs.require_pair(op_type, "pad")?,
        num_filter: non_negative(op_type, "num_filter", attrs.require_int(op_type, "num_filter")?)?,
        no_bias: attrs.flag("no_bias"),
    })
}

fn parse_bn(op_type: &str, attrs: &Attributes) -> Result<BatchNormParams, IrError> {
    Ok(BatchNormParams {
        eps: attrs.require_float(op_type, "eps")?,
        fix_gamma: attrs.flag("fix_gamma"),
    })
}

fn parse_fc(op_type: &str, attrs: &Attributes) -> Result<FcParams, IrError> {
    Ok(FcParams {
        num_hidden: non_negative(op_type, "num_hidden", attrs.require_int(op_type, "num_hidden")?)?,
        no_bias: attrs.flag("no_bias"),
        flatten: attrs.flag("flatten"),
    })
}

fn parse_range(op_type: &str, attrs: &Attributes) -> Result<CalibRange, IrError> {
    Ok(CalibRange::new(
        attrs.require_float(op_type, "min_calib_range")?,
        attrs.require_float(op_type, "max_calib_range")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(op: &OpKind) -> OpKind {
        OpKind::from_attributes(&op.op_type(), &op.attributes()).unwrap()
    }

    #[test]
    fn fused_conv_flags_only_when_absorbed() {
        let mut p = FusedConvParams::plain(ConvParams::new([3, 3], 8));
        p.with_sum = true;
        let attrs = OpKind::FusedConv(p).attributes();
        assert!(attrs.flag("with_sum"));
        assert!(!attrs.contains_key("with_bn"));
        assert!(!attrs.contains_key("with_relu"));
        assert!(!attrs.contains_key("with_postsum_relu"));
    }

    #[test]
    fn fused_input_counts() {
        let mut p = FusedConvParams::plain(ConvParams::new([3, 3], 8));
        assert_eq!(OpKind::FusedConv(p.clone()).expected_inputs(), Some(3));
        p.bn = Some(BatchNormParams::default());
        p.with_sum = true;
        assert_eq!(OpKind::FusedConv(p.clone()).expected_inputs(), Some(8));
        assert_eq!(p.addend_index(), Some(7));
        p.conv.no_bias = true;
        assert_eq!(p.addend_index(), Some(6));
    }

    #[test]
    fn quantized_op_type_and_attrs() {
        let op = OpKind::Quantized {
            inner: Box::new(OpKind::FusedFullyConnected(FusedFcParams {
                fc: FcParams::new(10),
                with_relu: true,
            })),
            output: QuantizedOutput::Requantized {
                out_type: QuantDtype::Uint8,
                range: CalibRange::new(0.0, 4.0),
            },
        };
        assert_eq!(op.op_type(), "quantized_sg_fully_connected");
        let attrs = op.attributes();
        assert_eq!(attrs.get("out_type"), Some(&AttrValue::Str("uint8".into())));
        assert_eq!(attrs.get("max_calib_range"), Some(&AttrValue::Float(4.0)));
        assert!(attrs.flag("with_relu"));
    }

    #[test]
    fn float_output_has_no_calibration_range() {
        let op = OpKind::Quantized {
            inner: Box::new(OpKind::FullyConnected(FcParams::new(4))),
            output: QuantizedOutput::Float,
        };
        let attrs = op.attributes();
        assert!(attrs.flag("enable_float_output"));
        assert!(!attrs.contains_key("min_calib_range"));
        assert!(!attrs.contains_key("max_calib_range"));
    }

    #[test]
    fn attributes_rebuild_the_operator() {
        let ops = [
            OpKind::Convolution(ConvParams::new([3, 3], 16).with_pad([1, 1])),
            OpKind::BatchNorm(BatchNormParams::default()),
            OpKind::Activation(ActType::Sigmoid),
            OpKind::Pooling(PoolParams::new(PoolType::Avg, [4, 4]).with_stride([2, 2])),
            OpKind::Concat { axis: 1 },
            OpKind::FusedConv(FusedConvParams {
                conv: ConvParams::new([1, 1], 4).without_bias(),
                bn: Some(BatchNormParams {
                    eps: 1e-5,
                    fix_gamma: false,
                }),
                with_relu: false,
                with_sum: true,
                with_postsum_relu: true,
            }),
            OpKind::Quantize {
                out_type: QuantDtype::Int8,
                range: CalibRange::new(-1.5, 2.0),
            },
            OpKind::Quantized {
                inner: Box::new(OpKind::Convolution(ConvParams::new([3, 3], 2))),
                output: QuantizedOutput::Int32,
            },
        ];
        for op in &ops {
            assert_eq!(&roundtrip(op), op, "{op}");
        }
    }

    #[test]
    fn unknown_op_type_is_rejected() {
        let err = OpKind::from_attributes("Dropout", &Attributes::new()).unwrap_err();
        assert!(matches!(err, IrError::UnknownOp(ref t) if t == "Dropout"));
    }
}
