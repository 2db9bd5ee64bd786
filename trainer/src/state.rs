/// Sentinel for "no validation loss seen yet". Any real loss below this
/// counts as an improvement on a fresh run.
pub const LOSS_SENTINEL: f32 = 100.0;

/// Progress of a run across epochs, including the best scores seen so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunState {
    /// Last completed epoch.
    pub epoch: usize,
    pub best_miou: f32,
    pub best_val_loss: f32,
}

/// Which best-model artifacts an evaluation result earned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestFlags {
    pub miou_improved: bool,
    pub val_loss_improved: bool,
}

impl RunState {
    pub fn fresh() -> Self {
        Self {
            epoch: 0,
            best_miou: 0.0,
            best_val_loss: LOSS_SENTINEL,
        }
    }

    pub fn resumed(last_epoch: usize, best_miou: f32, best_val_loss: f32) -> Self {
        Self {
            epoch: last_epoch,
            best_miou,
            best_val_loss,
        }
    }

    /// Folds one epoch's validation results into the best scores. The two
    /// criteria are tracked independently and ties never count as an
    /// improvement.
    pub fn observe(&mut self, miou: f32, val_loss: f32) -> BestFlags {
        let miou_improved = miou > self.best_miou;
        if miou_improved {
            self.best_miou = miou;
        }
        let val_loss_improved = val_loss < self.best_val_loss;
        if val_loss_improved {
            self.best_val_loss = val_loss;
        }
        BestFlags {
            miou_improved,
            val_loss_improved,
        }
    }
}
