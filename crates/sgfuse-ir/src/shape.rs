//! Output type and shape inference for every [`OpKind`].

use crate::error::IrError;
use crate::graph::TensorInfo;
use crate::op::{ConvParams, FcParams, OpKind, PoolParams, QuantizedOutput};
use crate::types::{Dimension, Scalar, TensorShape};

/// Infers the scalar type and shape produced by `op` applied to `inputs`.
///
/// `node` is only used for error messages.
pub fn infer_output(
    op: &OpKind,
    node: &str,
    inputs: &[&TensorInfo],
) -> Result<(Scalar, TensorShape), IrError> {
    check_arity(op, node, inputs.len())?;
    let scalar = infer_scalar(op, node, inputs)?;
    let shape = infer_shape(op, node, inputs)?;
    Ok((scalar, shape))
}

fn check_arity(op: &OpKind, node: &str, found: usize) -> Result<(), IrError> {
    let ok = match op.expected_inputs() {
        Some(expected) => expected == found,
        None => found > 0,
    };
    if ok {
        return Ok(());
    }
    Err(IrError::Arity {
        node: node.into(),
        expected: op.expected_inputs().unwrap_or(1),
        found,
    })
}

fn dtype_mismatch(node: &str, expected: impl ToString, found: Scalar) -> IrError {
    IrError::DtypeMismatch {
        node: node.into(),
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

fn shape_mismatch(node: &str, detail: impl Into<String>) -> IrError {
    IrError::ShapeMismatch {
        node: node.into(),
        detail: detail.into(),
    }
}

fn infer_scalar(op: &OpKind, node: &str, inputs: &[&TensorInfo]) -> Result<Scalar, IrError> {
    let data = inputs[0].scalar;
    match op {
        OpKind::Quantize { out_type, .. } => {
            if !data.is_float() {
                return Err(dtype_mismatch(node, Scalar::F32, data));
            }
            Ok(out_type.scalar())
        }
        OpKind::Dequantize => {
            if data.is_float() {
                return Err(dtype_mismatch(node, "a quantized type", data));
            }
            Ok(Scalar::F32)
        }
        OpKind::Requantize { out_type, .. } => {
            if data.is_float() {
                return Err(dtype_mismatch(node, "a quantized type", data));
            }
            Ok(out_type.scalar())
        }
        OpKind::Quantized { output, .. } => Ok(match output {
            QuantizedOutput::Int32 => Scalar::I32,
            QuantizedOutput::Requantized { out_type, .. } => out_type.scalar(),
            QuantizedOutput::Float => Scalar::F32,
        }),
        _ => {
            if !data.is_float() {
                return Err(dtype_mismatch(node, Scalar::F32, data));
            }
            if let Some(other) = inputs.iter().find(|t| t.scalar != data) {
                return Err(dtype_mismatch(node, data, other.scalar));
            }
            Ok(data)
        }
    }
}

fn infer_shape(op: &OpKind, node: &str, inputs: &[&TensorInfo]) -> Result<TensorShape, IrError> {
    let data = &inputs[0].shape;
    match op {
        OpKind::Convolution(p) => conv_shape(node, p, inputs),
        OpKind::FusedConv(p) => {
            let out = conv_shape(node, &p.conv, inputs)?;
            if let Some(idx) = p.addend_index() {
                check_same_shape(node, &out, &inputs[idx].shape)?;
            }
            if p.bn.is_some() {
                let first = p.conv.num_inputs();
                for t in &inputs[first..first + 4] {
                    check_channel_param(node, &t.shape, out.dims.get(1))?;
                }
            }
            Ok(out)
        }
        OpKind::BatchNorm(_) => {
            for t in &inputs[1..] {
                check_channel_param(node, &t.shape, data.dims.get(1))?;
            }
            Ok(data.clone())
        }
        OpKind::Activation(_) | OpKind::Softmax => Ok(data.clone()),
        OpKind::ElemwiseAdd => {
            check_same_shape(node, data, &inputs[1].shape)?;
            Ok(data.clone())
        }
        OpKind::Pooling(p) => pool_shape(node, p, data),
        OpKind::Concat { axis } => concat_shape(node, *axis, inputs),
        OpKind::FullyConnected(p) => fc_shape(node, p, inputs),
        OpKind::FusedFullyConnected(p) => fc_shape(node, &p.fc, inputs),
        OpKind::Quantize { .. } | OpKind::Dequantize | OpKind::Requantize { .. } => {
            Ok(data.clone())
        }
        OpKind::Quantized { inner, .. } => infer_shape(inner, node, inputs),
    }
}

fn check_same_shape(node: &str, a: &TensorShape, b: &TensorShape) -> Result<(), IrError> {
    let compatible = a.rank() == b.rank()
        && a.dims.iter().zip(&b.dims).all(|(x, y)| match (x.fixed(), y.fixed()) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        });
    if compatible {
        Ok(())
    } else {
        Err(shape_mismatch(
            node,
            format!("operand shapes {:?} and {:?} differ", a.to_fixed(), b.to_fixed()),
        ))
    }
}

fn check_channel_param(
    node: &str,
    param: &TensorShape,
    channels: Option<&Dimension>,
) -> Result<(), IrError> {
    if param.rank() != 1 {
        return Err(shape_mismatch(node, "per-channel parameter must be 1-D"));
    }
    if let (Some(c), Some(p)) = (channels.and_then(Dimension::fixed), param.dim(0))
        && c != p
    {
        return Err(shape_mismatch(
            node,
            format!("per-channel parameter has {p} entries for {c} channels"),
        ));
    }
    Ok(())
}

fn require_rank(node: &str, shape: &TensorShape, rank: usize) -> Result<(), IrError> {
    if shape.rank() != rank {
        return Err(shape_mismatch(
            node,
            format!("expected rank {rank}, found rank {}", shape.rank()),
        ));
    }
    Ok(())
}

fn spatial(
    node: &str,
    input: &Dimension,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<Dimension, IrError> {
    let Some(size) = input.fixed() else {
        return Ok(Dimension::Dynamic(None));
    };
    if stride == 0 {
        return Err(shape_mismatch(node, "stride must be positive"));
    }
    let padded = size + 2 * pad;
    if padded < kernel {
        return Err(shape_mismatch(
            node,
            format!("kernel {kernel} larger than padded input {padded}"),
        ));
    }
    Ok(Dimension::Fixed(((padded - kernel) / stride + 1) as u32))
}

fn conv_shape(node: &str, p: &ConvParams, inputs: &[&TensorInfo]) -> Result<TensorShape, IrError> {
    let data = &inputs[0].shape;
    let weight = &inputs[1].shape;
    require_rank(node, data, 4)?;
    require_rank(node, weight, 4)?;

    if let Some(w) = weight.to_fixed() {
        let expected_c = data.dim(1);
        if w[0] != p.num_filter
            || w[2] != p.kernel[0]
            || w[3] != p.kernel[1]
            || expected_c.is_some_and(|c| c != w[1])
        {
            return Err(shape_mismatch(
                node,
                format!(
                    "weight shape {w:?} does not match num_filter={} kernel={:?} channels={expected_c:?}",
                    p.num_filter, p.kernel
                ),
            ));
        }
    }
    if !p.no_bias {
        let bias = &inputs[2].shape;
        if bias.rank() != 1 || bias.dim(0).is_some_and(|b| b != p.num_filter) {
            return Err(shape_mismatch(node, "bias must be 1-D with num_filter entries"));
        }
    }

    Ok(TensorShape {
        dims: vec![
            data.dims[0].clone(),
            Dimension::Fixed(p.num_filter as u32),
            spatial(node, &data.dims[2], p.kernel[0], p.stride[0], p.pad[0])?,
            spatial(node, &data.dims[3], p.kernel[1], p.stride[1], p.pad[1])?,
        ],
    })
}

fn pool_shape(node: &str, p: &PoolParams, data: &TensorShape) -> Result<TensorShape, IrError> {
    require_rank(node, data, 4)?;
    let (h, w) = if p.global_pool {
        (Dimension::Fixed(1), Dimension::Fixed(1))
    } else {
        (
            spatial(node, &data.dims[2], p.kernel[0], p.stride[0], p.pad[0])?,
            spatial(node, &data.dims[3], p.kernel[1], p.stride[1], p.pad[1])?,
        )
    };
    Ok(TensorShape {
        dims: vec![data.dims[0].clone(), data.dims[1].clone(), h, w],
    })
}

fn concat_shape(node: &str, axis: usize, inputs: &[&TensorInfo]) -> Result<TensorShape, IrError> {
    let first = &inputs[0].shape;
    if axis >= first.rank() {
        return Err(shape_mismatch(
            node,
            format!("concat axis {axis} out of range for rank {}", first.rank()),
        ));
    }
    let mut total = Some(0usize);
    for t in inputs {
        let shape = &t.shape;
        require_rank(node, shape, first.rank())?;
        for (i, (a, b)) in first.dims.iter().zip(&shape.dims).enumerate() {
            if i != axis
                && let (Some(a), Some(b)) = (a.fixed(), b.fixed())
                && a != b
            {
                return Err(shape_mismatch(
                    node,
                    format!("`{}` differs on non-concat axis {i}: {b} vs {a}", t.name),
                ));
            }
        }
        total = total.zip(shape.dim(axis)).map(|(acc, d)| acc + d);
    }
    let mut dims = first.dims.clone();
    dims[axis] = match total {
        Some(n) => Dimension::Fixed(n as u32),
        None => Dimension::Dynamic(None),
    };
    Ok(TensorShape { dims })
}

fn fc_shape(node: &str, p: &FcParams, inputs: &[&TensorInfo]) -> Result<TensorShape, IrError> {
    let data = &inputs[0].shape;
    if data.rank() < 2 {
        return Err(shape_mismatch(node, "fully-connected input needs rank >= 2"));
    }
    let (mut dims, in_features) = if p.flatten {
        let features = data.dims[1..]
            .iter()
            .map(Dimension::fixed)
            .try_fold(1usize, |acc, d| d.map(|d| acc * d));
        (vec![data.dims[0].clone()], features)
    } else {
        let last = data.rank() - 1;
        (data.dims[..last].to_vec(), data.dim(last))
    };

    let weight = &inputs[1].shape;
    require_rank(node, weight, 2)?;
    if weight.dim(0).is_some_and(|h| h != p.num_hidden)
        || matches!((weight.dim(1), in_features), (Some(w), Some(f)) if w != f)
    {
        return Err(shape_mismatch(
            node,
            format!(
                "weight shape {:?} does not match num_hidden={} in_features={in_features:?}",
                weight.to_fixed(),
                p.num_hidden
            ),
        ));
    }

    dims.push(Dimension::Fixed(p.num_hidden as u32));
    Ok(TensorShape { dims })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{PoolType, QuantizedOutput};
    use crate::quant::{CalibRange, QuantDtype};

    fn info(name: &str, scalar: Scalar, dims: &[usize]) -> TensorInfo {
        TensorInfo {
            name: name.into(),
            scalar,
            shape: TensorShape::fixed(dims),
        }
    }

    #[test]
    fn conv_output_shape() {
        let data = info("data", Scalar::F32, &[4, 3, 10, 10]);
        let w = info("w", Scalar::F32, &[8, 3, 3, 3]);
        let b = info("b", Scalar::F32, &[8]);
        let op = OpKind::Convolution(ConvParams::new([3, 3], 8).with_pad([1, 1]));
        let (scalar, shape) = infer_output(&op, "conv", &[&data, &w, &b]).unwrap();
        assert_eq!(scalar, Scalar::F32);
        assert_eq!(shape.to_fixed(), Some(vec![4, 8, 10, 10]));
    }

    #[test]
    fn conv_rejects_wrong_weight() {
        let data = info("data", Scalar::F32, &[4, 3, 10, 10]);
        let w = info("w", Scalar::F32, &[8, 4, 3, 3]);
        let b = info("b", Scalar::F32, &[8]);
        let op = OpKind::Convolution(ConvParams::new([3, 3], 8));
        let err = infer_output(&op, "conv", &[&data, &w, &b]).unwrap_err();
        assert!(matches!(err, IrError::ShapeMismatch { ref node, .. } if node == "conv"));
    }

    #[test]
    fn pooling_and_concat() {
        let data = info("data", Scalar::F32, &[2, 4, 8, 8]);
        let pool = OpKind::Pooling(PoolParams::new(PoolType::Avg, [4, 4]));
        let (_, shape) = infer_output(&pool, "pool", &[&data]).unwrap();
        assert_eq!(shape.to_fixed(), Some(vec![2, 4, 5, 5]));

        let other = info("other", Scalar::F32, &[2, 6, 8, 8]);
        let concat = OpKind::Concat { axis: 1 };
        let (_, shape) = infer_output(&concat, "concat", &[&data, &other]).unwrap();
        assert_eq!(shape.to_fixed(), Some(vec![2, 10, 8, 8]));

        let bad = info("bad", Scalar::F32, &[2, 6, 7, 8]);
        assert!(infer_output(&concat, "concat", &[&data, &bad]).is_err());
    }

    #[test]
    fn fully_connected_flattens() {
        let data = info("data", Scalar::F32, &[2, 4, 3, 3]);
        let w = info("w", Scalar::F32, &[10, 36]);
        let b = info("b", Scalar::F32, &[10]);
        let op = OpKind::FullyConnected(FcParams::new(10));
        let (_, shape) = infer_output(&op, "fc", &[&data, &w, &b]).unwrap();
        assert_eq!(shape.to_fixed(), Some(vec![2, 10]));
    }

    #[test]
    fn add_rejects_mixed_dtypes() {
        let a = info("a", Scalar::F32, &[2, 3]);
        let b = info("b", Scalar::I8, &[2, 3]);
        let err = infer_output(&OpKind::ElemwiseAdd, "sum", &[&a, &b]).unwrap_err();
        assert!(matches!(err, IrError::DtypeMismatch { .. }));
    }

    #[test]
    fn quantize_changes_dtype_only() {
        let a = info("a", Scalar::F32, &[2, 3]);
        let op = OpKind::Quantize {
            out_type: QuantDtype::Uint8,
            range: CalibRange::new(0.0, 1.0),
        };
        let (scalar, shape) = infer_output(&op, "q", &[&a]).unwrap();
        assert_eq!(scalar, Scalar::U8);
        assert_eq!(shape.to_fixed(), Some(vec![2, 3]));

        let q = info("q", Scalar::U8, &[2, 3]);
        assert!(infer_output(&op, "q2", &[&q]).is_err());
        let (scalar, _) = infer_output(&OpKind::Dequantize, "dq", &[&q]).unwrap();
        assert_eq!(scalar, Scalar::F32);
    }

    #[test]
    fn quantized_conv_accepts_mixed_inputs() {
        let data = info("data", Scalar::U8, &[1, 2, 5, 5]);
        let w = info("w", Scalar::I8, &[3, 2, 3, 3]);
        let b = info("b", Scalar::F32, &[3]);
        let op = OpKind::Quantized {
            inner: Box::new(OpKind::Convolution(ConvParams::new([3, 3], 3))),
            output: QuantizedOutput::Int32,
        };
        let (scalar, shape) = infer_output(&op, "qconv", &[&data, &w, &b]).unwrap();
        assert_eq!(scalar, Scalar::I32);
        assert_eq!(shape.to_fixed(), Some(vec![1, 3, 3, 3]));
    }

    #[test]
    fn arity_is_checked() {
        let a = info("a", Scalar::F32, &[2, 3]);
        let err = infer_output(&OpKind::ElemwiseAdd, "sum", &[&a]).unwrap_err();
        assert!(matches!(err, IrError::Arity { expected: 2, found: 1, .. }));
    }
}
