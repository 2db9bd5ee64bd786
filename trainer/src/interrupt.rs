use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative stop request, polled once per epoch boundary.
pub trait Interrupter {
    fn should_stop(&self) -> bool;
}

/// Never requests a stop.
pub struct Never;

impl Interrupter for Never {
    fn should_stop(&self) -> bool {
        false
    }
}

/// Stops once a marker file appears. Useful for detached runs where no
/// signal can be delivered.
pub struct StopFile {
    path: PathBuf,
}

impl StopFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Interrupter for StopFile {
    fn should_stop(&self) -> bool {
        self.path.exists()
    }
}

/// A shared flag, typically set from a signal handler task.
#[derive(Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Interrupter for Flag {
    fn should_stop(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
