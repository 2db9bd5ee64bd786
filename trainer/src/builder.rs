use collective::ProcessTopology;
use segmentation::registry::build_model;
use segmentation::{Criterion, CrossEntropyLoss, LrSchedule, Optimizer, PolyLr, SegModel, Sgd};

use crate::config::RunConfig;
use crate::data::{InMemoryDataset, ShardSpec, ShardedLoader};
use crate::error::Error;

/// Which split of the data a loader serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

/// Resolves a run configuration into concrete training components.
pub struct Builder<'a> {
    cfg: &'a RunConfig,
}

impl<'a> Builder<'a> {
    pub fn new(cfg: &'a RunConfig) -> Self {
        Self { cfg }
    }

    /// Training data is sharded across the process group and reshuffled
    /// per epoch; validation data is evaluated whole, in order, on every
    /// rank.
    pub fn build_loader(&self, split: Split, topology: ProcessTopology) -> ShardedLoader {
        let data = &self.cfg.data;
        match split {
            Split::Train => {
                let dataset = InMemoryDataset::synthetic(
                    data.train_len,
                    data.channels,
                    data.classes,
                    data.height,
                    data.width,
                    data.ignore_index,
                    data.seed,
                );
                ShardedLoader::new(
                    dataset,
                    ShardSpec::from_topology(topology),
                    self.cfg.train.batch_size,
                    data.seed,
                    true,
                )
            }
            Split::Val => {
                // Offset the seed so the splits never share samples.
                let dataset = InMemoryDataset::synthetic(
                    data.val_len,
                    data.channels,
                    data.classes,
                    data.height,
                    data.width,
                    data.ignore_index,
                    data.seed.wrapping_add(0x5eed),
                );
                ShardedLoader::new(
                    dataset,
                    ShardSpec::solo(),
                    self.cfg.train.batch_size,
                    data.seed,
                    false,
                )
            }
        }
    }

    /// All ranks seed the model identically so replicas start in sync.
    pub fn build_model(&self) -> Result<Box<dyn SegModel + Send>, Error> {
        let data = &self.cfg.data;
        let model = build_model(
            &self.cfg.model.name,
            data.channels,
            data.classes,
            data.seed,
        )?;
        Ok(model)
    }

    pub fn build_criterion(&self) -> Box<dyn Criterion + Send> {
        Box::new(CrossEntropyLoss::new(self.cfg.data.ignore_index))
    }

    pub fn build_optimizer(&self) -> Box<dyn Optimizer + Send> {
        Box::new(Sgd::new(self.cfg.train.momentum, self.cfg.train.weight_decay))
    }

    /// The schedule spans the whole run, so it decays over
    /// `batches_per_epoch * epochs` iterations.
    pub fn build_schedule(&self, batches_per_epoch: usize) -> Box<dyn LrSchedule + Send> {
        let max_iters = (batches_per_epoch * self.cfg.train.epochs) as u64;
        Box::new(PolyLr::new(
            self.cfg.train.base_lr,
            self.cfg.train.poly_power,
            max_iters.max(1),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        serde_json::from_value(serde_json::json!({
            "run_name": "demo",
            "model": { "name": "norm_linear" },
            "train": { "epochs": 2, "batch_size": 4, "base_lr": 0.05 },
            "data": {
                "train_len": 10, "val_len": 6,
                "channels": 3, "classes": 4, "height": 6, "width": 6, "seed": 3
            }
        }))
        .unwrap()
    }

    #[test]
    fn train_loader_is_sharded_but_val_loader_is_not() {
        let cfg = config();
        let builder = Builder::new(&cfg);
        let topology = ProcessTopology::new(1, std::num::NonZeroUsize::new(2).unwrap());
        let train = builder.build_loader(Split::Train, topology);
        let val = builder.build_loader(Split::Val, topology);
        // 10 train samples over 2 ranks, 6 val samples on every rank.
        assert_eq!(train.batches_per_epoch(), 2);
        assert_eq!(val.batches_per_epoch(), 2);
        assert_eq!(val.dataset().len(), 6);
    }

    #[test]
    fn unknown_model_name_is_an_error() {
        let mut cfg = config();
        cfg.model.name = "transformer".into();
        let builder = Builder::new(&cfg);
        assert!(matches!(builder.build_model(), Err(Error::Model(_))));
    }
}
