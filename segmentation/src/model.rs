//! The seams between the training core and its numeric collaborators.
//!
//! All four traits are object-safe; the core holds boxed instances
//! resolved once from configuration and never inspects concrete types.

use ndarray::{Array3, Array4};

use crate::{ModelError, StateDict};

/// A trainable segmentation model over flat parameter/gradient buffers.
///
/// Images are `[N, C, H, W]`, logits `[N, K, H, W]`, targets `[N, H, W]`
/// class indices. Parameters and gradients are exposed as flat slices so
/// the optimizer step and the gradient all-reduce work on plain `f32`
/// memory without knowing the layout.
pub trait SegModel {
    /// Computes class logits; in train mode this also updates any
    /// normalization statistics that are not frozen.
    fn forward(&mut self, images: &Array4<f32>) -> Array4<f32>;

    /// Accumulates parameter gradients from the loss gradient of the
    /// most recent forward pass.
    fn backward(&mut self, images: &Array4<f32>, grad_logits: &Array4<f32>);

    fn zero_grad(&mut self);

    fn params(&self) -> &[f32];

    fn grads_mut(&mut self) -> &mut [f32];

    /// Splits the borrows so the optimizer can read gradients while
    /// writing parameters.
    fn params_and_grads_mut(&mut self) -> (&mut [f32], &[f32]);

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError>;

    /// Freezes normalization statistics; they stop updating even in
    /// train mode. Used by fine-tune resume.
    fn freeze_norm(&mut self);

    fn set_train(&mut self, train: bool);

    fn num_classes(&self) -> usize;
}

/// The loss function: a scalar plus its gradient with respect to logits.
pub trait Criterion {
    /// Returns the scalar loss and `d loss / d logits`.
    fn loss_grad(&self, logits: &Array4<f32>, targets: &Array3<i64>) -> (f32, Array4<f32>);

    fn loss(&self, logits: &Array4<f32>, targets: &Array3<i64>) -> f32 {
        self.loss_grad(logits, targets).0
    }
}

/// A first-order optimizer over flat buffers.
pub trait Optimizer {
    fn step(&mut self, params: &mut [f32], grads: &[f32], lr: f32);

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError>;
}

/// A per-iteration learning-rate schedule with an explicit counter.
///
/// The counter advances only through [`LrSchedule::step`]; a skipped
/// update (numeric overflow) simply does not call it.
pub trait LrSchedule {
    /// The learning rate for the current iteration.
    fn lr(&self) -> f32;

    /// Advances the schedule by one processed batch.
    fn step(&mut self);

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError>;
}
