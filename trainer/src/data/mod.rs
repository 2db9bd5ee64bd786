mod dataset;
mod loader;
mod shard;

pub use dataset::InMemoryDataset;
pub use loader::{Batch, ShardedLoader};
pub use shard::ShardSpec;
