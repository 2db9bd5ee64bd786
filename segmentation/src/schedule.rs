//! Polynomial learning-rate decay, stepped once per processed batch.

use crate::{
    state::{fetch, TensorData},
    ModelError, LrSchedule, StateDict,
};

/// `base_lr * (1 - iter / max_iters) ^ power`.
///
/// The iteration counter is explicit state: it only moves through
/// [`LrSchedule::step`], so a batch skipped for overflow leaves the
/// schedule exactly where it was.
pub struct PolyLr {
    base_lr: f32,
    power: f32,
    max_iters: u64,
    iter: u64,
}

impl PolyLr {
    pub fn new(base_lr: f32, power: f32, max_iters: u64) -> Self {
        assert!(max_iters > 0, "max_iters must be positive");
        Self {
            base_lr,
            power,
            max_iters,
            iter: 0,
        }
    }

    pub fn iter(&self) -> u64 {
        self.iter
    }
}

impl LrSchedule for PolyLr {
    fn lr(&self) -> f32 {
        let progress = (self.iter.min(self.max_iters)) as f32 / self.max_iters as f32;
        self.base_lr * (1.0 - progress).powf(self.power)
    }

    fn step(&mut self) {
        if self.iter < self.max_iters {
            self.iter += 1;
        }
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("iter".into(), TensorData::scalar(self.iter as f32));
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError> {
        let iter = fetch(state, "iter", &[1])?;
        self.iter = iter.data[0] as u64;
        Ok(())
    }
}
