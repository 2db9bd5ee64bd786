use std::{error::Error, fmt};

/// Failures while constructing components or restoring their state.
#[derive(Debug)]
pub enum ModelError {
    /// The registry has no model under this name.
    UnknownModel(String),
    /// A state tensor required for restore is absent.
    MissingTensor(String),
    /// A state tensor's shape does not fit the component.
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownModel(name) => write!(f, "unknown model '{name}'"),
            ModelError::MissingTensor(name) => write!(f, "missing state tensor '{name}'"),
            ModelError::ShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for '{name}': got {got:?}, expected {expected:?}"
            ),
        }
    }
}

impl Error for ModelError {}
