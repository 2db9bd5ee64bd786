use std::num::NonZeroUsize;

/// This process's place in the group, fixed for the process lifetime.
///
/// Rank 0 is the designated writer of persisted state; all other ranks
/// must never write checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTopology {
    rank: usize,
    world_size: NonZeroUsize,
}

impl ProcessTopology {
    pub fn new(rank: usize, world_size: NonZeroUsize) -> Self {
        assert!(rank < world_size.get(), "rank out of range");
        Self { rank, world_size }
    }

    /// The single-process topology: rank 0 in a world of one.
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: NonZeroUsize::MIN,
        }
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size.get()
    }

    /// True for the rank that owns checkpoint writes and hub duties.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }
}
