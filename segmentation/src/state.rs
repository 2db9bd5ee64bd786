use std::collections::BTreeMap;

use crate::ModelError;

/// A component's snapshot: named tensors with explicit shapes.
///
/// Ordered so that serialization is deterministic across runs.
pub type StateDict = BTreeMap<String, TensorData>;

/// One flat `f32` tensor with its logical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    /// A rank-1 single-element tensor, used for counters and scales.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![1],
            data: vec![value],
        }
    }

    pub fn scalar_value(&self) -> Option<f32> {
        (self.data.len() == 1).then(|| self.data[0])
    }
}

/// Fetches `name` from `state`, shape-checked against `expected`.
pub(crate) fn fetch<'a>(
    state: &'a StateDict,
    name: &str,
    expected: &[usize],
) -> Result<&'a TensorData, ModelError> {
    let tensor = state
        .get(name)
        .ok_or_else(|| ModelError::MissingTensor(name.to_string()))?;

    if tensor.shape != expected {
        return Err(ModelError::ShapeMismatch {
            name: name.to_string(),
            got: tensor.shape.clone(),
            expected: expected.to_vec(),
        });
    }

    Ok(tensor)
}
