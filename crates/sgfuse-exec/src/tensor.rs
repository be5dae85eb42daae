//! Runtime tensor values.

use std::borrow::Cow;

use ndarray::ArrayD;
use sgfuse_ir::{CalibRange, QuantDtype, QuantizationParams, Scalar};

/// A fixed-point tensor with the parameters needed to recover real values.
///
/// Values are stored widened to `i32` regardless of `dtype`; `dtype` bounds
/// them.
#[derive(Clone, Debug, PartialEq)]
pub struct QTensor {
    /// Integer payload.
    pub data: ArrayD<i32>,
    /// Logical integer type.
    pub dtype: QuantDtype,
    /// Scale and zero point.
    pub params: QuantizationParams,
}

impl QTensor {
    /// Quantize `values` with explicit parameters, saturating to `dtype`.
    pub fn quantize(values: &ArrayD<f32>, dtype: QuantDtype, params: QuantizationParams) -> Self {
        Self {
            data: values.mapv(|v| params.quantize(v, dtype)),
            dtype,
            params,
        }
    }

    /// Quantize `values` so that `range` maps onto the full `dtype` range.
    pub fn from_range(values: &ArrayD<f32>, dtype: QuantDtype, range: CalibRange) -> Self {
        Self::quantize(values, dtype, QuantizationParams::for_range(dtype, range))
    }

    /// Symmetric int8 encoding over the observed extent of `values`.
    pub fn symmetric_int8(values: &ArrayD<f32>) -> Self {
        let range = values.iter().fold(CalibRange::new(0.0, 0.0), |r, &v| {
            CalibRange::new(r.min.min(v), r.max.max(v))
        });
        Self::from_range(values, QuantDtype::Int8, range)
    }

    /// Real values represented by this tensor.
    pub fn dequantize(&self) -> ArrayD<f32> {
        self.data.mapv(|q| self.params.dequantize(q))
    }

    /// The float range the encoding can represent.
    pub fn range(&self) -> CalibRange {
        self.params.range(self.dtype)
    }
}

/// A value flowing along a graph edge.
#[derive(Clone, Debug, PartialEq)]
pub enum Tensor {
    /// Full-precision data.
    Float(ArrayD<f32>),
    /// Fixed-point data.
    Quantized(QTensor),
}

impl Tensor {
    /// Dimensions of the tensor.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Float(a) => a.shape(),
            Self::Quantized(q) => q.data.shape(),
        }
    }

    /// Element type as seen by the graph.
    pub fn scalar(&self) -> Scalar {
        match self {
            Self::Float(_) => Scalar::F32,
            Self::Quantized(q) => q.dtype.scalar(),
        }
    }

    /// Whether the tensor holds fixed-point data.
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }

    /// Borrow the float payload, if any.
    pub fn as_float(&self) -> Option<&ArrayD<f32>> {
        match self {
            Self::Float(a) => Some(a),
            Self::Quantized(_) => None,
        }
    }

    /// Real values, dequantizing if needed.
    pub fn to_f32(&self) -> Cow<'_, ArrayD<f32>> {
        match self {
            Self::Float(a) => Cow::Borrowed(a),
            Self::Quantized(q) => Cow::Owned(q.dequantize()),
        }
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(a: ArrayD<f32>) -> Self {
        Self::Float(a)
    }
}

impl From<QTensor> for Tensor {
    fn from(q: QTensor) -> Self {
        Self::Quantized(q)
    }
}
