use segmentation::{StateDict, TensorData};

const INITIAL_SCALE: f32 = 65536.0;
const GROWTH_FACTOR: f32 = 2.0;
const BACKOFF_FACTOR: f32 = 0.5;
const GROWTH_INTERVAL: u32 = 2000;

/// Dynamic loss scaler.
///
/// Losses are multiplied by the current scale before backward and the
/// resulting gradients divided by it afterwards. On overflow the scale
/// halves; after a run of clean steps it doubles. When disabled the scale
/// is pinned to one, but non-finite gradients still veto the step.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f32,
    growth_counter: u32,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: INITIAL_SCALE,
            growth_counter: 0,
        }
    }

    /// Factor to apply to the loss (and its gradient) before backward.
    #[inline]
    pub fn loss_scale(&self) -> f32 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Divides gradients back to their true magnitude and reports whether
    /// any of them is non-finite.
    pub fn unscale(&self, grads: &mut [f32]) -> bool {
        let inv = 1.0 / self.loss_scale();
        let mut found_inf = false;
        for g in grads.iter_mut() {
            *g *= inv;
            found_inf |= !g.is_finite();
        }
        found_inf
    }

    /// Adjusts the scale after a step attempt. Must be called exactly once
    /// per batch, with `found_inf` reflecting that batch's gradients.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= BACKOFF_FACTOR;
            self.growth_counter = 0;
        } else {
            self.growth_counter += 1;
            if self.growth_counter >= GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.growth_counter = 0;
            }
        }
    }

    pub fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("scale".into(), TensorData::scalar(self.scale));
        state.insert(
            "growth_counter".into(),
            TensorData::scalar(self.growth_counter as f32),
        );
        state
    }

    /// Restores scale and growth progress; the enabled flag always comes
    /// from configuration, not from the record.
    pub fn load_state_dict(&mut self, state: &StateDict) {
        if let Some(scale) = state.get("scale").and_then(TensorData::scalar_value) {
            self.scale = scale;
        }
        if let Some(counter) = state.get("growth_counter").and_then(TensorData::scalar_value) {
            self.growth_counter = counter as u32;
        }
    }
}
