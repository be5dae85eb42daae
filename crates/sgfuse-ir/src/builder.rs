//! Layer-level construction helpers.
//!
//! Each helper adds one operator and creates the parameters it needs
//! (`<name>_weight`, `<name>_bias`, `<name>_gamma`, ...) with shapes derived
//! from the data input, so a model can be described without spelling out
//! every weight.

use crate::error::IrError;
use crate::graph::{ComputeGraph, EdgeId};
use crate::op::{ActType, BatchNormParams, ConvParams, FcParams, OpKind, PoolParams};
use crate::types::{Scalar, TensorShape};

/// Suffixes of the per-channel parameters a batch-norm binds, in input order.
pub const BATCH_NORM_PARAMS: [&str; 4] = ["gamma", "beta", "moving_mean", "moving_var"];

impl ComputeGraph {
    fn data_shape(&self, data: EdgeId, node: &str) -> Result<&TensorShape, IrError> {
        self.edge(data)
            .map(|info| &info.shape)
            .ok_or_else(|| IrError::UnknownEdge {
                node: node.into(),
                edge: data.0,
            })
    }

    fn channels(&self, data: EdgeId, node: &str) -> Result<usize, IrError> {
        self.data_shape(data, node)?
            .dim(1)
            .ok_or_else(|| IrError::ShapeMismatch {
                node: node.into(),
                detail: "channel dimension must be fixed to create parameters".into(),
            })
    }

    /// Convolution; pass `weight` to share an existing weight parameter.
    pub fn convolution(
        &mut self,
        name: &str,
        data: EdgeId,
        weight: Option<EdgeId>,
        params: ConvParams,
    ) -> Result<EdgeId, IrError> {
        let weight = match weight {
            Some(w) => w,
            None => {
                let c = self.channels(data, name)?;
                self.add_param(
                    format!("{name}_weight"),
                    Scalar::F32,
                    TensorShape::fixed(&[params.num_filter, c, params.kernel[0], params.kernel[1]]),
                )?
            }
        };
        let mut inputs = vec![data, weight];
        if !params.no_bias {
            inputs.push(self.add_param(
                format!("{name}_bias"),
                Scalar::F32,
                TensorShape::fixed(&[params.num_filter]),
            )?);
        }
        self.add_op(OpKind::Convolution(params), inputs, name)
    }

    /// Inference-mode batch normalization with fresh per-channel parameters.
    pub fn batch_norm(
        &mut self,
        name: &str,
        data: EdgeId,
        params: BatchNormParams,
    ) -> Result<EdgeId, IrError> {
        let c = self.channels(data, name)?;
        let mut inputs = vec![data];
        for suffix in BATCH_NORM_PARAMS {
            inputs.push(self.add_param(
                format!("{name}_{suffix}"),
                Scalar::F32,
                TensorShape::fixed(&[c]),
            )?);
        }
        self.add_op(OpKind::BatchNorm(params), inputs, name)
    }

    pub fn activation(&mut self, name: &str, data: EdgeId, act: ActType) -> Result<EdgeId, IrError> {
        self.add_op(OpKind::Activation(act), vec![data], name)
    }

    pub fn relu(&mut self, name: &str, data: EdgeId) -> Result<EdgeId, IrError> {
        self.activation(name, data, ActType::Relu)
    }

    pub fn elemwise_add(&mut self, name: &str, lhs: EdgeId, rhs: EdgeId) -> Result<EdgeId, IrError> {
        self.add_op(OpKind::ElemwiseAdd, vec![lhs, rhs], name)
    }

    pub fn pooling(&mut self, name: &str, data: EdgeId, params: PoolParams) -> Result<EdgeId, IrError> {
        self.add_op(OpKind::Pooling(params), vec![data], name)
    }

    pub fn concat(&mut self, name: &str, inputs: Vec<EdgeId>, axis: usize) -> Result<EdgeId, IrError> {
        self.add_op(OpKind::Concat { axis }, inputs, name)
    }

    /// Fully-connected layer; pass `weight` to share an existing weight.
    pub fn fully_connected(
        &mut self,
        name: &str,
        data: EdgeId,
        weight: Option<EdgeId>,
        params: FcParams,
    ) -> Result<EdgeId, IrError> {
        let weight = match weight {
            Some(w) => w,
            None => {
                let shape = self.data_shape(data, name)?;
                let features = if params.flatten {
                    shape.to_fixed().map(|d| d[1..].iter().product::<usize>())
                } else {
                    shape.rank().checked_sub(1).and_then(|last| shape.dim(last))
                };
                let features = features.ok_or_else(|| IrError::ShapeMismatch {
                    node: name.into(),
                    detail: "input features must be fixed to create the weight".into(),
                })?;
                self.add_param(
                    format!("{name}_weight"),
                    Scalar::F32,
                    TensorShape::fixed(&[params.num_hidden, features]),
                )?
            }
        };
        let mut inputs = vec![data, weight];
        if !params.no_bias {
            inputs.push(self.add_param(
                format!("{name}_bias"),
                Scalar::F32,
                TensorShape::fixed(&[params.num_hidden]),
            )?);
        }
        self.add_op(OpKind::FullyConnected(params), inputs, name)
    }

    pub fn softmax(&mut self, name: &str, data: EdgeId) -> Result<EdgeId, IrError> {
        self.add_op(OpKind::Softmax, vec![data], name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::PoolType;

    #[test]
    fn conv_creates_weight_and_bias() {
        let mut g = ComputeGraph::new();
        let data = g.add_input("data", Scalar::F32, TensorShape::fixed(&[4, 4, 10, 10])).unwrap();
        let out = g
            .convolution("conv", data, None, ConvParams::new([3, 3], 8).with_pad([1, 1]))
            .unwrap();
        let w = g.edge_by_name("conv_weight").unwrap();
        assert_eq!(g.edge(w).unwrap().shape.to_fixed(), Some(vec![8, 4, 3, 3]));
        assert!(g.edge_by_name("conv_bias").is_some());
        assert_eq!(g.edge(out).unwrap().shape.to_fixed(), Some(vec![4, 8, 10, 10]));
        assert_eq!(g.params.len(), 2);
    }

    #[test]
    fn shared_weight_is_reused() {
        let mut g = ComputeGraph::new();
        let data = g.add_input("data", Scalar::F32, TensorShape::fixed(&[1, 2, 6, 6])).unwrap();
        let w = g.add_param("weight", Scalar::F32, TensorShape::fixed(&[4, 2, 3, 3])).unwrap();
        let p = ConvParams::new([3, 3], 4).without_bias();
        g.convolution("conv0", data, Some(w), p.clone()).unwrap();
        g.convolution("conv1", data, Some(w), p).unwrap();
        assert_eq!(g.params, vec![w]);
        assert_eq!(g.edge_consumers(w).len(), 2);
    }

    #[test]
    fn batch_norm_params_follow_channels() {
        let mut g = ComputeGraph::new();
        let data = g.add_input("data", Scalar::F32, TensorShape::fixed(&[2, 5, 3, 3])).unwrap();
        g.batch_norm("bn", data, BatchNormParams::default()).unwrap();
        for suffix in BATCH_NORM_PARAMS {
            let e = g.edge_by_name(&format!("bn_{suffix}")).unwrap();
            assert_eq!(g.edge(e).unwrap().shape.to_fixed(), Some(vec![5]));
        }
    }

    #[test]
    fn fully_connected_weight_from_flattened_input() {
        let mut g = ComputeGraph::new();
        let data = g.add_input("data", Scalar::F32, TensorShape::fixed(&[2, 3, 4, 4])).unwrap();
        let pooled = g
            .pooling("pool", data, PoolParams::new(PoolType::Max, [2, 2]).with_stride([2, 2]))
            .unwrap();
        let out = g.fully_connected("fc", pooled, None, FcParams::new(10)).unwrap();
        let w = g.edge_by_name("fc_weight").unwrap();
        assert_eq!(g.edge(w).unwrap().shape.to_fixed(), Some(vec![10, 12]));
        assert_eq!(g.edge(out).unwrap().shape.to_fixed(), Some(vec![2, 10]));
    }
}
