//! Plain f32 reference kernels over NCHW tensors.
//!
//! These favour obviousness over speed; they are the ground truth the fused
//! and quantized graphs are compared against.

use ndarray::{Array1, Array2, Array4, ArrayD, ArrayView1, Axis, Ix1, Ix2, Ix4, IxDyn};
use sgfuse_ir::{
    ActType, BatchNormParams, ConvParams, FcParams, FusedConvParams, PoolParams, PoolType,
};

use crate::error::KernelError;

fn shape_err(msg: impl Into<String>) -> KernelError {
    KernelError::Shape(msg.into())
}

fn out_size(size: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize, KernelError> {
    let padded = size + 2 * pad;
    if stride == 0 || padded < kernel {
        return Err(shape_err(format!(
            "window {kernel} (stride {stride}) does not fit padded extent {padded}"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// Offset of window position `o * stride + k` in the unpadded input.
fn source_index(o: usize, stride: usize, k: usize, pad: usize, size: usize) -> Option<usize> {
    (o * stride + k).checked_sub(pad).filter(|&i| i < size)
}

fn vector<'a>(a: &'a ArrayD<f32>, len: usize, what: &str) -> Result<ArrayView1<'a, f32>, KernelError> {
    let v = a.view().into_dimensionality::<Ix1>()?;
    if v.len() != len {
        return Err(shape_err(format!("{what} has {} entries, expected {len}", v.len())));
    }
    Ok(v)
}

/// 2-D convolution, NCHW data and OIHW weights.
pub fn conv2d(
    x: &ArrayD<f32>,
    w: &ArrayD<f32>,
    bias: Option<&ArrayD<f32>>,
    p: &ConvParams,
) -> Result<ArrayD<f32>, KernelError> {
    let x = x.view().into_dimensionality::<Ix4>()?;
    let w = w.view().into_dimensionality::<Ix4>()?;
    let (n, c, h, wd) = x.dim();
    let (f, wc, kh, kw) = w.dim();
    if wc != c {
        return Err(shape_err(format!("weight expects {wc} channels, data has {c}")));
    }
    let bias = bias.map(|b| vector(b, f, "bias")).transpose()?;
    let oh = out_size(h, kh, p.stride[0], p.pad[0])?;
    let ow = out_size(wd, kw, p.stride[1], p.pad[1])?;

    let mut out = Array4::<f32>::zeros((n, f, oh, ow));
    for b in 0..n {
        for o in 0..f {
            let init = bias.as_ref().map_or(0.0, |bias| bias[o]);
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = init;
                    for ci in 0..c {
                        for ky in 0..kh {
                            let Some(iy) = source_index(oy, p.stride[0], ky, p.pad[0], h) else {
                                continue;
                            };
                            for kx in 0..kw {
                                if let Some(ix) = source_index(ox, p.stride[1], kx, p.pad[1], wd) {
                                    acc += x[[b, ci, iy, ix]] * w[[o, ci, ky, kx]];
                                }
                            }
                        }
                    }
                    out[[b, o, oy, ox]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

/// Inference batch normalization over axis 1.
pub fn batch_norm(
    x: &ArrayD<f32>,
    gamma: &ArrayD<f32>,
    beta: &ArrayD<f32>,
    mean: &ArrayD<f32>,
    var: &ArrayD<f32>,
    p: &BatchNormParams,
) -> Result<ArrayD<f32>, KernelError> {
    if x.ndim() < 2 {
        return Err(shape_err("batch-norm input needs a channel axis"));
    }
    let c = x.shape()[1];
    let gamma = vector(gamma, c, "gamma")?;
    let beta = vector(beta, c, "beta")?;
    let mean = vector(mean, c, "moving_mean")?;
    let var = vector(var, c, "moving_var")?;

    let scale: Array1<f32> = (0..c)
        .map(|i| {
            let g = if p.fix_gamma { 1.0 } else { gamma[i] };
            g / (var[i] + p.eps).sqrt()
        })
        .collect();

    let mut out = x.clone();
    for (idx, v) in out.indexed_iter_mut() {
        let ch = idx[1];
        *v = (*v - mean[ch]) * scale[ch] + beta[ch];
    }
    Ok(out)
}

pub fn activation(x: &ArrayD<f32>, act: ActType) -> ArrayD<f32> {
    match act {
        ActType::Relu => x.mapv(|v| v.max(0.0)),
        ActType::Sigmoid => x.mapv(|v| 1.0 / (1.0 + (-v).exp())),
        ActType::Tanh => x.mapv(f32::tanh),
    }
}

pub fn add(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, KernelError> {
    if a.shape() != b.shape() {
        return Err(shape_err(format!(
            "cannot add {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(a + b)
}

/// 2-D max/avg pooling. Average pooling divides by the full window area.
pub fn pooling(x: &ArrayD<f32>, p: &PoolParams) -> Result<ArrayD<f32>, KernelError> {
    let x = x.view().into_dimensionality::<Ix4>()?;
    let (n, c, h, w) = x.dim();
    let (kernel, stride, pad) = if p.global_pool {
        ([h, w], [1, 1], [0, 0])
    } else {
        (p.kernel, p.stride, p.pad)
    };
    let oh = out_size(h, kernel[0], stride[0], pad[0])?;
    let ow = out_size(w, kernel[1], stride[1], pad[1])?;
    let area = (kernel[0] * kernel[1]) as f32;

    let mut out = Array4::<f32>::zeros((n, c, oh, ow));
    for b in 0..n {
        for ch in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut max = f32::NEG_INFINITY;
                    let mut sum = 0.0;
                    for ky in 0..kernel[0] {
                        let Some(iy) = source_index(oy, stride[0], ky, pad[0], h) else {
                            continue;
                        };
                        for kx in 0..kernel[1] {
                            if let Some(ix) = source_index(ox, stride[1], kx, pad[1], w) {
                                let v = x[[b, ch, iy, ix]];
                                max = max.max(v);
                                sum += v;
                            }
                        }
                    }
                    out[[b, ch, oy, ox]] = match p.pool_type {
                        PoolType::Max => max,
                        PoolType::Avg => sum / area,
                    };
                }
            }
        }
    }
    Ok(out.into_dyn())
}

pub fn concat(inputs: &[&ArrayD<f32>], axis: usize) -> Result<ArrayD<f32>, KernelError> {
    let views: Vec<_> = inputs.iter().map(|a| a.view()).collect();
    Ok(ndarray::concatenate(Axis(axis), &views)?)
}

/// `y = x W^T + b`, collapsing non-batch axes when `flatten` is set.
pub fn fully_connected(
    x: &ArrayD<f32>,
    w: &ArrayD<f32>,
    bias: Option<&ArrayD<f32>>,
    p: &FcParams,
) -> Result<ArrayD<f32>, KernelError> {
    if x.ndim() < 2 {
        return Err(shape_err("fully-connected input needs rank >= 2"));
    }
    let (rows, features, mut out_dims) = if p.flatten {
        let rows = x.shape()[0];
        (rows, x.len() / rows.max(1), vec![rows])
    } else {
        let last = x.ndim() - 1;
        let features = x.shape()[last];
        (x.len() / features.max(1), features, x.shape()[..last].to_vec())
    };
    let x2 = Array2::from_shape_vec((rows, features), x.iter().copied().collect())?;
    let w2 = w.view().into_dimensionality::<Ix2>()?;
    if w2.dim() != (p.num_hidden, features) {
        return Err(shape_err(format!(
            "weight is {:?}, expected ({}, {features})",
            w2.dim(),
            p.num_hidden
        )));
    }

    let mut y = x2.dot(&w2.t());
    if let Some(b) = bias {
        y += &vector(b, p.num_hidden, "bias")?;
    }
    out_dims.push(p.num_hidden);
    Ok(ArrayD::from_shape_vec(IxDyn(&out_dims), y.iter().copied().collect())?)
}

/// Softmax over the last axis.
pub fn softmax(x: &ArrayD<f32>) -> Result<ArrayD<f32>, KernelError> {
    if x.ndim() == 0 {
        return Err(shape_err("softmax needs at least one axis"));
    }
    let mut out = x.clone();
    let last = Axis(x.ndim() - 1);
    for mut lane in out.lanes_mut(last) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(out)
}

/// Convolution followed by the absorbed batch-norm, relu, sum and
/// post-sum relu, in that order.
pub fn fused_conv(args: &[&ArrayD<f32>], p: &FusedConvParams) -> Result<ArrayD<f32>, KernelError> {
    let bias = (!p.conv.no_bias).then(|| args[2]);
    let mut y = conv2d(args[0], args[1], bias, &p.conv)?;
    let mut next = if p.conv.no_bias { 2 } else { 3 };
    if let Some(bn) = &p.bn {
        y = batch_norm(&y, args[next], args[next + 1], args[next + 2], args[next + 3], bn)?;
        next += 4;
    }
    if p.with_relu {
        y = activation(&y, ActType::Relu);
    }
    if p.with_sum {
        y = add(&y, args[next])?;
    }
    if p.with_postsum_relu {
        y = activation(&y, ActType::Relu);
    }
    Ok(y)
}
