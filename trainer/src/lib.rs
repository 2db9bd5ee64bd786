//! Distributed training driver for semantic segmentation runs.
//!
//! A run walks epochs from a configurable start to a configured end. Every
//! epoch trains over this rank's shard of the data, evaluates on the full
//! validation set, and lets rank 0 persist a resumable checkpoint plus
//! best-model artifacts. Gradients are averaged across the process group
//! once per surviving batch.

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod interrupt;
pub mod loop_;
pub mod metrics;
pub mod scaler;
pub mod sink;
pub mod state;

pub use builder::{Builder, Split};
pub use checkpoint::{CheckpointManager, Resumed};
pub use config::RunConfig;
pub use error::Error;
pub use interrupt::{Flag, Interrupter, Never, StopFile};
pub use loop_::{RunOutcome, TrainLoop};
pub use metrics::TrainMetrics;
pub use scaler::GradScaler;
pub use sink::{JsonlSink, NullSink, TrainSink};
pub use state::{BestFlags, RunState};

pub type Result<T> = std::result::Result<T, Error>;
