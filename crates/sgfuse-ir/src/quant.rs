//! Fixed-point encodings and the float <-> integer mapping they imply.

use std::fmt;
use std::str::FromStr;

use crate::error::IrError;
use crate::types::Scalar;

/// Integer element type of a quantized tensor.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum QuantDtype {
    Int8,
    Uint8,
    /// Accumulator type produced by quantized convolution / fully-connected.
    Int32,
}

impl QuantDtype {
    /// Smallest representable integer.
    pub fn qmin(self) -> i64 {
        match self {
            Self::Int8 => -127,
            Self::Uint8 => 0,
            Self::Int32 => -(i32::MAX as i64),
        }
    }

    /// Largest representable integer.
    pub fn qmax(self) -> i64 {
        match self {
            Self::Int8 => 127,
            Self::Uint8 => 255,
            Self::Int32 => i32::MAX as i64,
        }
    }

    pub fn scalar(self) -> Scalar {
        match self {
            Self::Int8 => Scalar::I8,
            Self::Uint8 => Scalar::U8,
            Self::Int32 => Scalar::I32,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Uint8 => "uint8",
            Self::Int32 => "int32",
        }
    }
}

impl fmt::Display for QuantDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantDtype {
    type Err = IrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int8" => Ok(Self::Int8),
            "uint8" => Ok(Self::Uint8),
            "int32" => Ok(Self::Int32),
            other => Err(IrError::InvalidAttribute {
                op_type: "quantize".into(),
                attr: "out_type".into(),
                detail: format!("unknown quantized type `{other}`"),
            }),
        }
    }
}

/// A frozen calibration range `[min, max]` for one tensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibRange {
    pub min: f32,
    pub max: f32,
}

impl CalibRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Finite bounds with `min <= max`.
    pub fn is_representable(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }

    /// Smallest range containing both.
    pub fn union(&self, other: &CalibRange) -> CalibRange {
        CalibRange {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn is_non_negative(&self) -> bool {
        self.min >= 0.0
    }

    /// Largest magnitude covered by the range.
    pub fn abs_max(&self) -> f32 {
        self.min.abs().max(self.max.abs())
    }
}

impl fmt::Display for CalibRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Parameters describing how floating-point values were quantized to integers.
///
/// `real = scale * (q - zero_point)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantizationParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantizationParams {
    /// Compute quantization parameters for `dtype` covering `range`.
    ///
    /// Signed types are symmetric around zero. `uint8` uses a zero point of 0
    /// for non-negative ranges and an affine mapping otherwise.
    pub fn for_range(dtype: QuantDtype, range: CalibRange) -> Self {
        match dtype {
            QuantDtype::Int8 | QuantDtype::Int32 => {
                let abs = range.abs_max();
                if abs < f32::EPSILON {
                    return Self::identity();
                }
                Self {
                    scale: abs / dtype.qmax() as f32,
                    zero_point: 0,
                }
            }
            QuantDtype::Uint8 => {
                let lo = range.min.min(0.0);
                let hi = range.max.max(0.0);
                let span = hi - lo;
                if span < f32::EPSILON {
                    return Self::identity();
                }
                let scale = span / 255.0;
                let zero_point = (-lo / scale).round().clamp(0.0, 255.0) as i32;
                Self { scale, zero_point }
            }
        }
    }

    fn identity() -> Self {
        Self {
            scale: 1.0,
            zero_point: 0,
        }
    }

    /// Quantize one value, saturating to the dtype's range.
    pub fn quantize(&self, value: f32, dtype: QuantDtype) -> i32 {
        let q = (value / self.scale).round() as i64 + self.zero_point as i64;
        q.clamp(dtype.qmin(), dtype.qmax()) as i32
    }

    pub fn dequantize(&self, q: i32) -> f32 {
        (q as i64 - self.zero_point as i64) as f32 * self.scale
    }

    /// The float range covered by `dtype` under these parameters.
    pub fn range(&self, dtype: QuantDtype) -> CalibRange {
        CalibRange {
            min: self.dequantize(dtype.qmin() as i32),
            max: self.dequantize(dtype.qmax() as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int8_is_symmetric() {
        let p = QuantizationParams::for_range(QuantDtype::Int8, CalibRange::new(-2.0, 1.0));
        assert_eq!(p.zero_point, 0);
        assert!((p.scale - 2.0 / 127.0).abs() < 1e-6);
        assert_eq!(p.quantize(-2.0, QuantDtype::Int8), -127);
        assert_eq!(p.quantize(100.0, QuantDtype::Int8), 127);
    }

    #[test]
    fn uint8_non_negative_has_zero_offset() {
        let p = QuantizationParams::for_range(QuantDtype::Uint8, CalibRange::new(0.5, 5.1));
        assert_eq!(p.zero_point, 0);
        assert!((p.scale - 0.02).abs() < 1e-6);
        assert_eq!(p.quantize(5.1, QuantDtype::Uint8), 255);
        assert_eq!(p.quantize(-1.0, QuantDtype::Uint8), 0);
    }

    #[test]
    fn uint8_affine_for_signed_range() {
        let p = QuantizationParams::for_range(QuantDtype::Uint8, CalibRange::new(-1.0, 3.0));
        assert!((p.scale - 4.0 / 255.0).abs() < 1e-6);
        assert_eq!(p.zero_point, 64);
        let back = p.dequantize(p.quantize(-1.0, QuantDtype::Uint8));
        assert!((back + 1.0).abs() <= p.scale);
    }

    #[test]
    fn degenerate_range_uses_unit_scale() {
        let p = QuantizationParams::for_range(QuantDtype::Int8, CalibRange::new(0.0, 0.0));
        assert_eq!(p.scale, 1.0);
        assert_eq!(p.zero_point, 0);
    }

    #[test]
    fn range_union_and_representability() {
        let a = CalibRange::new(-1.0, 2.0);
        let b = CalibRange::new(0.0, 5.0);
        assert_eq!(a.union(&b), CalibRange::new(-1.0, 5.0));
        assert!(a.is_representable());
        assert!(!CalibRange::new(f32::NAN, 1.0).is_representable());
        assert!(!CalibRange::new(1.0, -1.0).is_representable());
    }

    #[test]
    fn dtype_names_parse() {
        for dtype in [QuantDtype::Int8, QuantDtype::Uint8, QuantDtype::Int32] {
            assert_eq!(dtype.as_str().parse::<QuantDtype>().unwrap(), dtype);
        }
        assert!("int4".parse::<QuantDtype>().is_err());
    }
}
