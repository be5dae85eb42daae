//! Bound parameter tensors, keyed by edge name.

use std::collections::BTreeMap;

use ndarray::ArrayD;

use crate::tensor::Tensor;

/// Data fed to graph inputs for one batch, keyed by input name.
pub type Feeds = BTreeMap<String, ArrayD<f32>>;

/// Named parameter tensors (weights, biases, batch-norm statistics).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamSet {
    tensors: BTreeMap<String, Tensor>,
}

impl ParamSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, tensor: impl Into<Tensor>) {
        self.tensors.insert(name.into(), tensor.into());
    }

    /// Look up a parameter.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Tensor)> for ParamSet {
    fn from_iter<T: IntoIterator<Item = (String, Tensor)>>(iter: T) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}
