//! Drives whole runs through the training state machine, solo and over
//! in-memory duplex links, checking epoch accounting, overflow skips and
//! interrupt handling.

use std::cell::Cell;
use std::collections::HashSet;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use ndarray::{Array3, Array4};
use tokio::io::{duplex, split, DuplexStream};

use collective::{link, ProcessGroup};
use segmentation::registry::build_model;
use segmentation::{
    Criterion, CrossEntropyLoss, ModelError, PolyLr, SegModel, Sgd, StateDict, TensorData,
};

use trainer::data::{InMemoryDataset, ShardSpec, ShardedLoader};
use trainer::{
    CheckpointManager, GradScaler, Interrupter, NullSink, RunOutcome, RunState, TrainLoop,
    TrainMetrics,
};

type SoloGroup = ProcessGroup<DuplexStream, DuplexStream>;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trainer-loop-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn loader(len: usize, batch: usize, shard: ShardSpec, shuffle: bool) -> ShardedLoader {
    let dataset = InMemoryDataset::synthetic(len, 3, 4, 4, 4, 255, 17);
    ShardedLoader::new(dataset, shard, batch, 17, shuffle)
}

/// Stops at the nth boundary poll.
struct StopAfter {
    polls: Cell<usize>,
    limit: usize,
}

impl StopAfter {
    fn new(limit: usize) -> Self {
        Self {
            polls: Cell::new(0),
            limit,
        }
    }
}

impl Interrupter for StopAfter {
    fn should_stop(&self) -> bool {
        let n = self.polls.get();
        self.polls.set(n + 1);
        n >= self.limit
    }
}

/// A model whose backward writes a constant gradient, poisoned with
/// infinity on chosen batches. Lets the tests force overflow skips and
/// predict parameter values exactly.
struct ToyModel {
    params: Vec<f32>,
    grads: Vec<f32>,
    classes: usize,
    poison: HashSet<usize>,
    backward_calls: usize,
}

impl ToyModel {
    fn new(len: usize, classes: usize, poison: HashSet<usize>) -> Self {
        Self {
            params: vec![0.0; len],
            grads: vec![0.0; len],
            classes,
            poison,
            backward_calls: 0,
        }
    }
}

impl SegModel for ToyModel {
    fn forward(&mut self, images: &Array4<f32>) -> Array4<f32> {
        let (n, _, h, w) = images.dim();
        Array4::zeros((n, self.classes, h, w))
    }

    fn backward(&mut self, _images: &Array4<f32>, grad_logits: &Array4<f32>) {
        let call = self.backward_calls;
        self.backward_calls += 1;
        let value = if self.poison.contains(&call) {
            f32::INFINITY
        } else {
            grad_logits.iter().sum()
        };
        self.grads.fill(value);
    }

    fn zero_grad(&mut self) {
        self.grads.fill(0.0);
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn grads_mut(&mut self) -> &mut [f32] {
        &mut self.grads
    }

    fn params_and_grads_mut(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.params, &self.grads)
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert(
            "params".into(),
            TensorData::new(vec![self.params.len()], self.params.clone()),
        );
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError> {
        let tensor = state
            .get("params")
            .ok_or_else(|| ModelError::MissingTensor("params".into()))?;
        self.params = tensor.data.clone();
        Ok(())
    }

    fn freeze_norm(&mut self) {}

    fn set_train(&mut self, _train: bool) {}

    fn num_classes(&self) -> usize {
        self.classes
    }
}

/// Unit loss whose gradient sums to exactly one per batch.
struct FlatLoss;

impl Criterion for FlatLoss {
    fn loss_grad(&self, logits: &Array4<f32>, _targets: &Array3<i64>) -> (f32, Array4<f32>) {
        let numel = logits.len() as f32;
        (1.0, Array4::from_elem(logits.raw_dim(), 1.0 / numel))
    }
}

fn solo_loop(
    dir: &std::path::Path,
    epochs: usize,
    interrupter: Box<dyn Interrupter + Send>,
) -> TrainLoop<DuplexStream, DuplexStream> {
    TrainLoop {
        group: SoloGroup::solo(),
        model: build_model("norm_linear", 3, 4, 5).unwrap(),
        criterion: Box::new(CrossEntropyLoss::new(255)),
        optimizer: Box::new(Sgd::new(0.9, 1e-4)),
        schedule: Box::new(PolyLr::new(0.05, 0.9, (4 * epochs) as u64)),
        scaler: GradScaler::new(false),
        train_loader: loader(8, 2, ShardSpec::solo(), true),
        val_loader: loader(4, 2, ShardSpec::solo(), false),
        checkpoint: CheckpointManager::new(dir.to_path_buf(), "demo".into()),
        state: RunState::fresh(),
        start_epoch: 0,
        epochs,
        sink: Box::new(NullSink),
        interrupter,
        model_tag: "norm_linear".into(),
        metrics: TrainMetrics::new(),
    }
}

fn resume_epoch(dir: &std::path::Path) -> usize {
    let manager = CheckpointManager::new(dir.to_path_buf(), "demo".into());
    let mut model = build_model("norm_linear", 3, 4, 5).unwrap();
    let mut optimizer = Sgd::new(0.9, 1e-4);
    let mut schedule = PolyLr::new(0.05, 0.9, 100);
    let mut scaler = GradScaler::new(false);
    CheckpointManager::resume(
        &manager.checkpoint_path(),
        model.as_mut(),
        &mut optimizer,
        &mut schedule,
        &mut scaler,
        false,
    )
    .unwrap()
    .start_epoch
}

#[tokio::test]
async fn solo_run_completes_and_is_resumable() {
    let dir = temp_dir("complete");
    let (outcome, metrics) = solo_loop(&dir, 2, Box::new(trainer::Never)).run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(metrics.epochs_completed, 2);
    // 8 samples in batches of 2, twice.
    assert_eq!(metrics.batches_applied, 8);
    assert_eq!(metrics.overflow_skips, 0);
    // Last completed epoch was 1, so a resume starts at 2.
    assert_eq!(resume_epoch(&dir), 2);
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn preset_interrupt_stops_before_any_work() {
    let dir = temp_dir("preset-stop");
    let flag = trainer::Flag::default();
    flag.set();
    let (outcome, metrics) = solo_loop(&dir, 3, Box::new(flag)).run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Stopped);
    assert_eq!(metrics.epochs_completed, 0);
    assert_eq!(metrics.batches_applied, 0);
    assert!(!dir.exists());
}

#[tokio::test]
async fn interrupt_lands_on_an_epoch_boundary() {
    let dir = temp_dir("boundary-stop");
    let (outcome, metrics) = solo_loop(&dir, 3, Box::new(StopAfter::new(1)))
        .run()
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Stopped);
    // Epoch 0 finished and was checkpointed; epoch 1 never started.
    assert_eq!(metrics.epochs_completed, 1);
    assert_eq!(metrics.batches_applied, 4);
    assert_eq!(resume_epoch(&dir), 1);
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn overflow_skips_update_schedule_and_backs_off_scale() {
    let dir = temp_dir("overflow");
    let lr = 0.05f32;
    let train_loop = TrainLoop {
        group: SoloGroup::solo(),
        // Poison the second of four batches.
        model: Box::new(ToyModel::new(3, 4, HashSet::from([1]))),
        criterion: Box::new(FlatLoss),
        optimizer: Box::new(Sgd::new(0.0, 0.0)),
        // Power zero keeps the rate constant so the expectation is exact.
        schedule: Box::new(PolyLr::new(lr, 0.0, 4)),
        scaler: GradScaler::new(true),
        train_loader: loader(8, 2, ShardSpec::solo(), false),
        val_loader: loader(4, 2, ShardSpec::solo(), false),
        checkpoint: CheckpointManager::new(dir.clone(), "demo".into()),
        state: RunState::fresh(),
        start_epoch: 0,
        epochs: 1,
        sink: Box::new(NullSink),
        interrupter: Box::new(trainer::Never),
        model_tag: "toy".into(),
        metrics: TrainMetrics::new(),
    };

    let (outcome, metrics) = train_loop.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(metrics.batches_applied, 3);
    assert_eq!(metrics.overflow_skips, 1);

    // Restore every component and check the skipped batch left no trace.
    let manager = CheckpointManager::new(dir.clone(), "demo".into());
    let mut model = ToyModel::new(3, 4, HashSet::new());
    let mut optimizer = Sgd::new(0.0, 0.0);
    let mut schedule = PolyLr::new(lr, 0.0, 4);
    let mut scaler = GradScaler::new(true);
    CheckpointManager::resume(
        &manager.checkpoint_path(),
        &mut model,
        &mut optimizer,
        &mut schedule,
        &mut scaler,
        false,
    )
    .unwrap();

    // FlatLoss gradients sum to one, so each applied batch moves every
    // parameter by exactly -lr.
    for &p in model.params() {
        assert!((p + 3.0 * lr).abs() < 1e-6, "unexpected parameter {p}");
    }
    assert_eq!(schedule.iter(), 3);
    assert_eq!(optimizer.steps(), 3);
    let scale = scaler.state_dict()["scale"].scalar_value().unwrap();
    assert_eq!(scale, 65536.0 * 0.5);
    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn two_rank_run_agrees_on_parameters() {
    let root_dir = temp_dir("pair-root");
    let leaf_dir = temp_dir("pair-leaf");
    let world = NonZeroUsize::new(2).unwrap();

    let (root_side, leaf_side) = duplex(1 << 16);
    let (root_rx, root_tx) = split(root_side);
    let (leaf_rx, leaf_tx) = split(leaf_side);
    let root_group = ProcessGroup::root_over(vec![link(root_rx, root_tx)]);
    let leaf_group = ProcessGroup::leaf_over(1, world, link(leaf_rx, leaf_tx));

    let make_loop = |group, rank: usize, dir: &std::path::Path| TrainLoop {
        group,
        model: Box::new(ToyModel::new(3, 4, HashSet::new())) as Box<dyn SegModel + Send>,
        criterion: Box::new(FlatLoss),
        optimizer: Box::new(Sgd::new(0.0, 0.0)),
        schedule: Box::new(PolyLr::new(0.1, 0.0, 4)),
        scaler: GradScaler::new(false),
        train_loader: loader(8, 2, ShardSpec::new(rank, world), true),
        val_loader: loader(4, 2, ShardSpec::solo(), false),
        checkpoint: CheckpointManager::new(dir.to_path_buf(), "demo".into()),
        state: RunState::fresh(),
        start_epoch: 0,
        epochs: 2,
        sink: Box::new(NullSink),
        interrupter: Box::new(trainer::Never),
        model_tag: "toy".into(),
        metrics: TrainMetrics::new(),
    };

    let root_loop = make_loop(root_group, 0, &root_dir);
    let leaf_loop = make_loop(leaf_group, 1, &leaf_dir);
    let (root_out, leaf_out) = tokio::join!(root_loop.run(), leaf_loop.run());
    let (root_outcome, root_metrics) = root_out.unwrap();
    let (leaf_outcome, leaf_metrics) = leaf_out.unwrap();

    assert_eq!(root_outcome, RunOutcome::Completed);
    assert_eq!(leaf_outcome, RunOutcome::Completed);
    // Each rank owns half the 8 samples: 2 batches per epoch, 2 epochs.
    assert_eq!(root_metrics.batches_applied, 4);
    assert_eq!(leaf_metrics.batches_applied, 4);

    // Only rank 0 persisted anything.
    assert!(root_dir.join("demo_checkpoint.safetensors").exists());
    assert!(!leaf_dir.exists());
    let _ = fs::remove_dir_all(&root_dir);
}
