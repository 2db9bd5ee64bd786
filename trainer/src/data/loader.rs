use ndarray::{Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{InMemoryDataset, ShardSpec};

/// One mini-batch: images `[N, C, H, W]` and class maps `[N, H, W]`.
pub struct Batch {
    pub images: Array4<f32>,
    pub targets: Array3<i64>,
}

/// Iterates one rank's shard of a dataset in mini-batches.
///
/// All ranks derive the same epoch permutation from `seed` and the epoch
/// number, then carve out their own contiguous slice of it. Calling
/// [`set_epoch`](Self::set_epoch) before each epoch therefore reshuffles
/// globally while keeping the shards disjoint.
pub struct ShardedLoader {
    dataset: InMemoryDataset,
    shard: ShardSpec,
    batch_size: usize,
    seed: u64,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
}

impl ShardedLoader {
    pub fn new(
        dataset: InMemoryDataset,
        shard: ShardSpec,
        batch_size: usize,
        seed: u64,
        shuffle: bool,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        let mut loader = Self {
            dataset,
            shard,
            batch_size,
            seed,
            shuffle,
            order: Vec::new(),
            cursor: 0,
        };
        loader.set_epoch(0);
        loader
    }

    /// Rebuilds this rank's sample order for `epoch` and rewinds iteration.
    pub fn set_epoch(&mut self, epoch: usize) {
        let total = self.dataset.len();
        let mut permutation: Vec<usize> = (0..total).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            permutation.shuffle(&mut rng);
        }
        self.order = permutation[self.shard.range(total)].to_vec();
        self.cursor = 0;
    }

    /// Rewinds to the start of the current epoch's order.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    #[inline]
    pub fn dataset(&self) -> &InMemoryDataset {
        &self.dataset
    }

    /// Next mini-batch, or `None` once the shard is exhausted. The last
    /// batch of an epoch may be short.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let (c, h, w) = self.dataset.sample(indices[0]).0.dim();
        let mut images = Array4::zeros((indices.len(), c, h, w));
        let mut targets = Array3::zeros((indices.len(), h, w));
        for (slot, &index) in indices.iter().enumerate() {
            let (image, target) = self.dataset.sample(index);
            images.index_axis_mut(Axis(0), slot).assign(image);
            targets.index_axis_mut(Axis(0), slot).assign(target);
        }
        Some(Batch { images, targets })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::num::NonZeroUsize;

    use super::*;

    fn dataset(len: usize) -> InMemoryDataset {
        InMemoryDataset::synthetic(len, 2, 3, 4, 4, 255, 11)
    }

    fn drain_targets(loader: &mut ShardedLoader) -> Vec<Array3<i64>> {
        let mut out = Vec::new();
        while let Some(batch) = loader.next_batch() {
            out.push(batch.targets);
        }
        out
    }

    #[test]
    fn epoch_permutations_differ_but_cover_the_shard() {
        let mut loader = ShardedLoader::new(dataset(10), ShardSpec::solo(), 4, 3, true);
        loader.set_epoch(0);
        let first: Vec<usize> = loader.order.clone();
        loader.set_epoch(1);
        let second: Vec<usize> = loader.order.clone();
        assert_ne!(first, second);
        let all: BTreeSet<usize> = second.iter().copied().collect();
        assert_eq!(all, (0..10).collect());
    }

    #[test]
    fn same_epoch_yields_same_order_on_every_rank() {
        let world = NonZeroUsize::new(3).unwrap();
        let mut union = BTreeSet::new();
        let mut count = 0;
        for rank in 0..3 {
            let shard = ShardSpec::new(rank, world);
            let mut loader = ShardedLoader::new(dataset(10), shard, 4, 3, true);
            loader.set_epoch(5);
            count += loader.order.len();
            union.extend(loader.order.iter().copied());
        }
        // Disjoint shards of one global permutation.
        assert_eq!(count, 10);
        assert_eq!(union, (0..10).collect());
    }

    #[test]
    fn last_batch_may_be_short() {
        let mut loader = ShardedLoader::new(dataset(10), ShardSpec::solo(), 4, 0, false);
        let batches = drain_targets(&mut loader);
        let sizes: Vec<usize> = batches.iter().map(|t| t.dim().0).collect();
        assert_eq!(sizes, [4, 4, 2]);
        assert_eq!(loader.batches_per_epoch(), 3);
    }

    #[test]
    fn reset_replays_the_same_epoch() {
        let mut loader = ShardedLoader::new(dataset(6), ShardSpec::solo(), 2, 9, true);
        let first = drain_targets(&mut loader);
        loader.reset();
        let second = drain_targets(&mut loader);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn unshuffled_loader_keeps_dataset_order() {
        let mut loader = ShardedLoader::new(dataset(5), ShardSpec::solo(), 2, 0, false);
        loader.set_epoch(3);
        assert_eq!(loader.order, vec![0, 1, 2, 3, 4]);
    }
}
