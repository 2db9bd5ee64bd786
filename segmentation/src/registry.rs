//! Name-keyed model construction, resolved once from configuration.

use crate::{ModelError, NormLinearModel, SegModel};

/// Builds the model registered under `name`.
///
/// # Errors
/// `ModelError::UnknownModel` if no model is registered under `name`.
pub fn build_model(
    name: &str,
    in_channels: usize,
    num_classes: usize,
    seed: u64,
) -> Result<Box<dyn SegModel + Send>, ModelError> {
    match name {
        "norm_linear" => Ok(Box::new(NormLinearModel::new(in_channels, num_classes, seed))),
        other => Err(ModelError::UnknownModel(other.to_string())),
    }
}
