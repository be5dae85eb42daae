//! Graph executors.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Debug;

use ndarray::ArrayD;
use sgfuse_ir::{ActType, ComputeGraph, EdgeId, OpKind, QuantDtype, QuantizationParams, QuantizedOutput};

use crate::error::{ExecError, KernelError};
use crate::kernels;
use crate::params::{Feeds, ParamSet};
use crate::tensor::{QTensor, Tensor};

/// Something that can bind parameters and run a graph on one batch.
///
/// Used both for full-precision reference runs and for calibration, where
/// the observer sees every tensor as it is produced.
pub trait Executor: Debug + Send + Sync {
    /// Human-readable name (e.g. "reference").
    fn name(&self) -> &str;

    /// Run `graph` on `feeds`, calling `observer(edge_name, value)` for every
    /// graph input and every node output. Returns the graph outputs in order.
    fn run_observed(
        &self,
        graph: &ComputeGraph,
        params: &ParamSet,
        feeds: &Feeds,
        observer: &mut dyn FnMut(&str, &Tensor),
    ) -> Result<Vec<Tensor>, ExecError>;

    /// Run `graph` on `feeds` and return the graph outputs in order.
    fn run(
        &self,
        graph: &ComputeGraph,
        params: &ParamSet,
        feeds: &Feeds,
    ) -> Result<Vec<Tensor>, ExecError> {
        self.run_observed(graph, params, feeds, &mut |_, _| {})
    }
}

/// Straightforward single-threaded CPU executor.
///
/// Quantized operators are simulated: operands are dequantized, the float
/// kernel runs, and the result is re-encoded as the operator declares.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceExecutor;

impl Executor for ReferenceExecutor {
    fn name(&self) -> &str {
        "reference"
    }

    fn run_observed(
        &self,
        graph: &ComputeGraph,
        params: &ParamSet,
        feeds: &Feeds,
        observer: &mut dyn FnMut(&str, &Tensor),
    ) -> Result<Vec<Tensor>, ExecError> {
        let order = graph.topological_order()?;
        let mut values: HashMap<EdgeId, Tensor> = HashMap::with_capacity(graph.edge_count());

        for &input in &graph.inputs {
            let name = graph.edge_name(input);
            let fed = feeds
                .get(name)
                .ok_or_else(|| ExecError::Unbound(name.to_string()))?;
            if let Some(expected) = graph.edge(input).and_then(|info| info.shape.to_fixed())
                && expected != fed.shape()
            {
                return Err(ExecError::FeedShape {
                    name: name.to_string(),
                    expected,
                    found: fed.shape().to_vec(),
                });
            }
            let value = Tensor::Float(fed.clone());
            observer(name, &value);
            values.insert(input, value);
        }

        log::debug!("{}: executing {} nodes", self.name(), order.len());

        for node in order {
            let out = {
                let args = node
                    .inputs
                    .iter()
                    .map(|&e| lookup(graph, params, &values, e))
                    .collect::<Result<Vec<_>, _>>()?;
                eval_node(&node.op, &args).map_err(|source| ExecError::Kernel {
                    node: node.name.clone(),
                    op_type: node.op.op_type(),
                    source,
                })?
            };
            log::trace!("{} -> {:?}", node.name, out.shape());
            observer(graph.edge_name(node.output()), &out);
            values.insert(node.output(), out);
        }

        graph
            .outputs
            .iter()
            .map(|&e| lookup(graph, params, &values, e).cloned())
            .collect()
    }
}

fn lookup<'a>(
    graph: &ComputeGraph,
    params: &'a ParamSet,
    values: &'a HashMap<EdgeId, Tensor>,
    edge: EdgeId,
) -> Result<&'a Tensor, ExecError> {
    let name = graph.edge_name(edge);
    values
        .get(&edge)
        .or_else(|| params.get(name))
        .ok_or_else(|| ExecError::Unbound(name.to_string()))
}

fn float_arg<'a>(args: &[&'a Tensor], index: usize) -> Result<&'a ArrayD<f32>, KernelError> {
    args[index]
        .as_float()
        .ok_or(KernelError::UnexpectedQuantized { index })
}

fn quantized_arg<'a>(args: &[&'a Tensor], index: usize) -> Result<&'a QTensor, KernelError> {
    match args[index] {
        Tensor::Quantized(q) => Ok(q),
        Tensor::Float(_) => Err(KernelError::ExpectedQuantized { index }),
    }
}

fn eval_node(op: &OpKind, args: &[&Tensor]) -> Result<Tensor, KernelError> {
    match op {
        OpKind::Quantize { out_type, range } => {
            let x = float_arg(args, 0)?;
            Ok(QTensor::from_range(x, *out_type, *range).into())
        }
        OpKind::Dequantize => Ok(quantized_arg(args, 0)?.dequantize().into()),
        OpKind::Requantize { out_type, range } => {
            let x = quantized_arg(args, 0)?.dequantize();
            Ok(QTensor::from_range(&x, *out_type, *range).into())
        }
        OpKind::Quantized { inner, output } => {
            let real: Vec<Cow<'_, ArrayD<f32>>> = args.iter().map(|t| t.to_f32()).collect();
            let refs: Vec<&ArrayD<f32>> = real.iter().map(|c| &**c).collect();
            let y = eval_float(inner, &refs)?;
            Ok(match output {
                QuantizedOutput::Float => y.into(),
                QuantizedOutput::Requantized { out_type, range } => {
                    QTensor::from_range(&y, *out_type, *range).into()
                }
                QuantizedOutput::Int32 => {
                    let params = QuantizationParams {
                        scale: accumulator_scale(inner, args, &y),
                        zero_point: 0,
                    };
                    QTensor::quantize(&y, QuantDtype::Int32, params).into()
                }
            })
        }
        _ => {
            let floats = (0..args.len())
                .map(|i| float_arg(args, i))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(eval_float(op, &floats)?.into())
        }
    }
}

/// Scale of the int32 accumulator: product of data and weight scales when
/// both are known, widened if the result would not fit.
fn accumulator_scale(inner: &OpKind, args: &[&Tensor], y: &ArrayD<f32>) -> f32 {
    let abs = y.iter().fold(0f32, |m, v| m.max(v.abs()));
    let fit = abs / QuantDtype::Int32.qmax() as f32;
    let scale_of = |t: &Tensor| match t {
        Tensor::Quantized(q) => q.params.scale,
        Tensor::Float(a) => QTensor::symmetric_int8(a).params.scale,
    };
    if let Some(w) = inner.weight_index()
        && let Tensor::Quantized(data) = args[0]
    {
        return (data.params.scale * scale_of(args[w])).max(fit);
    }
    if abs < f32::EPSILON { 1.0 } else { fit }
}

fn eval_float(op: &OpKind, args: &[&ArrayD<f32>]) -> Result<ArrayD<f32>, KernelError> {
    match op {
        OpKind::Convolution(p) => {
            let bias = (!p.no_bias).then(|| args[2]);
            kernels::conv2d(args[0], args[1], bias, p)
        }
        OpKind::BatchNorm(p) => kernels::batch_norm(args[0], args[1], args[2], args[3], args[4], p),
        OpKind::Activation(act) => Ok(kernels::activation(args[0], *act)),
        OpKind::ElemwiseAdd => kernels::add(args[0], args[1]),
        OpKind::Pooling(p) => kernels::pooling(args[0], p),
        OpKind::Concat { axis } => kernels::concat(args, *axis),
        OpKind::FullyConnected(p) => {
            let bias = (!p.no_bias).then(|| args[2]);
            kernels::fully_connected(args[0], args[1], bias, p)
        }
        OpKind::Softmax => kernels::softmax(args[0]),
        OpKind::FusedConv(p) => kernels::fused_conv(args, p),
        OpKind::FusedFullyConnected(p) => {
            let bias = (!p.fc.no_bias).then(|| args[2]);
            let y = kernels::fully_connected(args[0], args[1], bias, &p.fc)?;
            Ok(if p.with_relu {
                kernels::activation(&y, ActType::Relu)
            } else {
                y
            })
        }
        OpKind::Quantize { .. }
        | OpKind::Dequantize
        | OpKind::Requantize { .. }
        | OpKind::Quantized { .. } => Err(KernelError::Shape(format!(
            "`{}` has no float kernel",
            op.op_type()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use sgfuse_ir::{CalibRange, ConvParams, Scalar, TensorShape};

    fn arr(shape: &[usize], values: Vec<f32>) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(shape), values).unwrap()
    }

    fn tiny_conv_graph() -> (ComputeGraph, ParamSet) {
        let mut g = ComputeGraph::new();
        let data = g
            .add_input("data", Scalar::F32, TensorShape::fixed(&[1, 1, 2, 2]))
            .unwrap();
        let conv = g
            .convolution("conv", data, None, ConvParams::new([1, 1], 1))
            .unwrap();
        let out = g.relu("relu", conv).unwrap();
        g.set_outputs(vec![out]);

        let mut params = ParamSet::new();
        params.insert("conv_weight", arr(&[1, 1, 1, 1], vec![-2.0]));
        params.insert("conv_bias", arr(&[1], vec![1.0]));
        (g, params)
    }

    fn feeds(values: Vec<f32>) -> Feeds {
        Feeds::from([("data".to_string(), arr(&[1, 1, 2, 2], values))])
    }

    #[test]
    fn runs_and_observes_every_tensor() {
        let (g, params) = tiny_conv_graph();
        let mut seen = Vec::new();
        let out = ReferenceExecutor
            .run_observed(&g, &params, &feeds(vec![1.0, -1.0, 0.0, 2.0]), &mut |name, _| {
                seen.push(name.to_string())
            })
            .unwrap();
        assert_eq!(seen, vec!["data", "conv_output", "relu_output"]);
        let y = out[0].as_float().unwrap();
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![0.0, 3.0, 1.0, 0.0]);
    }

    #[test]
    fn missing_feed_and_param_are_reported() {
        let (g, params) = tiny_conv_graph();
        let err = ReferenceExecutor.run(&g, &params, &Feeds::new()).unwrap_err();
        assert!(matches!(err, ExecError::Unbound(ref n) if n == "data"));

        let err = ReferenceExecutor
            .run(&g, &ParamSet::new(), &feeds(vec![0.0; 4]))
            .unwrap_err();
        assert!(matches!(err, ExecError::Unbound(ref n) if n == "conv_weight"));
    }

    #[test]
    fn feed_shape_is_checked() {
        let (g, params) = tiny_conv_graph();
        let bad = Feeds::from([("data".to_string(), arr(&[1, 1, 1, 4], vec![0.0; 4]))]);
        let err = ReferenceExecutor.run(&g, &params, &bad).unwrap_err();
        assert!(matches!(err, ExecError::FeedShape { .. }));
    }

    #[test]
    fn quantize_dequantize_chain() {
        let mut g = ComputeGraph::new();
        let data = g.add_input("data", Scalar::F32, TensorShape::fixed(&[4])).unwrap();
        let q = g
            .add_op(
                OpKind::Quantize {
                    out_type: QuantDtype::Int8,
                    range: CalibRange::new(-1.0, 1.0),
                },
                vec![data],
                "q",
            )
            .unwrap();
        let dq = g.add_op(OpKind::Dequantize, vec![q], "dq").unwrap();
        g.set_outputs(vec![q, dq]);

        let x = arr(&[4], vec![-1.0, -0.5, 0.25, 3.0]);
        let out = ReferenceExecutor
            .run(&g, &ParamSet::new(), &Feeds::from([("data".to_string(), x)]))
            .unwrap();
        assert_eq!(out[0].scalar(), Scalar::I8);
        let back = out[1].as_float().unwrap();
        assert!((back[[0]] + 1.0).abs() < 1e-6);
        assert!((back[[2]] - 0.25).abs() < 1.0 / 127.0);
        // Saturated to the calibrated range.
        assert!((back[[3]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn float_kernel_rejects_quantized_operand() {
        let q = Tensor::from(QTensor::symmetric_int8(&arr(&[2], vec![1.0, 2.0])));
        let err = eval_node(&OpKind::Softmax, &[&q]).unwrap_err();
        assert!(matches!(err, KernelError::UnexpectedQuantized { index: 0 }));
    }

    #[test]
    fn int32_accumulator_scale_is_data_times_weight() {
        let data = Tensor::from(QTensor::from_range(
            &arr(&[1, 1, 1, 1], vec![1.0]),
            QuantDtype::Uint8,
            CalibRange::new(0.0, 2.55),
        ));
        let weight = Tensor::from(QTensor::symmetric_int8(&arr(&[1, 1, 1, 1], vec![1.27])));
        let bias = Tensor::from(arr(&[1], vec![0.0]));
        let op = OpKind::Quantized {
            inner: Box::new(OpKind::Convolution(ConvParams::new([1, 1], 1))),
            output: QuantizedOutput::Int32,
        };
        let Tensor::Quantized(acc) = eval_node(&op, &[&data, &weight, &bias]).unwrap() else {
            panic!("expected an int32 accumulator");
        };
        assert_eq!(acc.dtype, QuantDtype::Int32);
        assert!((acc.params.scale - 0.01 * 0.01).abs() < 1e-9);
        assert!((acc.dequantize()[[0, 0, 0, 0]] - 1.27).abs() < 1e-3);
    }
}
