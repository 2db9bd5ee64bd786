/// Counters accumulated over the lifetime of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainMetrics {
    /// Epochs fully trained, evaluated and checkpointed.
    pub epochs_completed: u64,
    /// Batches whose parameter update was applied.
    pub batches_applied: u64,
    /// Batches skipped because of non-finite gradients.
    pub overflow_skips: u64,
}

impl TrainMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump_epoch(&mut self) {
        self.epochs_completed += 1;
    }

    pub fn bump_batch(&mut self) {
        self.batches_applied += 1;
    }

    pub fn bump_overflow(&mut self) {
        self.overflow_skips += 1;
    }
}
