use std::num::NonZeroUsize;
use std::ops::Range;

use collective::ProcessTopology;

/// This rank's slice of a globally ordered dataset.
///
/// Samples are split into contiguous runs whose sizes differ by at most
/// one, so every sample belongs to exactly one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    rank: usize,
    world_size: NonZeroUsize,
}

impl ShardSpec {
    pub fn new(rank: usize, world_size: NonZeroUsize) -> Self {
        assert!(rank < world_size.get(), "rank out of range");
        Self { rank, world_size }
    }

    pub fn solo() -> Self {
        Self::new(0, NonZeroUsize::MIN)
    }

    pub fn from_topology(topology: ProcessTopology) -> Self {
        // world_size is always at least one.
        let world = NonZeroUsize::new(topology.world_size()).unwrap_or(NonZeroUsize::MIN);
        Self::new(topology.rank(), world)
    }

    /// Index range this shard owns within a dataset of `total` samples.
    /// The first `total % world_size` ranks take one extra sample.
    pub fn range(&self, total: usize) -> Range<usize> {
        let world = self.world_size.get();
        let base = total / world;
        let extra = total % world;
        let start = self.rank * base + self.rank.min(extra);
        let len = base + usize::from(self.rank < extra);
        start..start + len
    }
}
