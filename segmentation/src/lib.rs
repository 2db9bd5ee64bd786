//! Capability providers for the training core: segmentation model,
//! pixel-wise criterion, optimizer, learning-rate schedule, metric and
//! palette decoding. The core consumes everything here through the
//! traits in [`model`], resolved once by name through [`registry`].

mod error;
mod loss;
pub mod metrics;
mod model;
mod norm_linear;
mod optim;
pub mod palette;
pub mod registry;
mod schedule;
mod state;

pub use error::ModelError;
pub use loss::CrossEntropyLoss;
pub use model::{Criterion, LrSchedule, Optimizer, SegModel};
pub use norm_linear::NormLinearModel;
pub use optim::Sgd;
pub use schedule::PolyLr;
pub use state::{StateDict, TensorData};
