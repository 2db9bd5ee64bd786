use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use collective::ProcessGroup;
use segmentation::metrics::argmax_classes;
use segmentation::palette::decode_segmap;
use segmentation::{Criterion, LrSchedule, Optimizer, SegModel};

use crate::checkpoint::CheckpointManager;
use crate::data::ShardedLoader;
use crate::error::Error;
use crate::eval;
use crate::interrupt::Interrupter;
use crate::metrics::TrainMetrics;
use crate::scaler::GradScaler;
use crate::sink::TrainSink;
use crate::state::RunState;

/// Color given to ignored pixels in rendered evaluation images.
const IGNORE_COLOR: [u8; 3] = [255, 255, 255];

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All configured epochs were trained.
    Completed,
    /// A cooperative stop request was honored at an epoch boundary.
    Stopped,
}

/// The epoch/batch state machine driving one rank of a training run.
///
/// Per batch: forward, loss, scaled backward, gradient unscale, then
/// either a skip (non-finite gradients) or all-reduce, optimizer step and
/// schedule step. Per epoch: a full validation pass and a checkpoint.
/// The interrupter is polled exactly once per epoch, before any of its
/// work starts, so a stop never tears a half-trained epoch.
pub struct TrainLoop<R, W> {
    pub group: ProcessGroup<R, W>,
    pub model: Box<dyn SegModel + Send>,
    pub criterion: Box<dyn Criterion + Send>,
    pub optimizer: Box<dyn Optimizer + Send>,
    pub schedule: Box<dyn LrSchedule + Send>,
    pub scaler: GradScaler,
    pub train_loader: ShardedLoader,
    pub val_loader: ShardedLoader,
    pub checkpoint: CheckpointManager,
    pub state: RunState,
    pub start_epoch: usize,
    pub epochs: usize,
    pub sink: Box<dyn TrainSink + Send>,
    pub interrupter: Box<dyn Interrupter + Send>,
    pub model_tag: String,
    pub metrics: TrainMetrics,
}

impl<R, W> TrainLoop<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Runs the configured epoch range to completion or until a stop
    /// request, then tears the process group down. Consumes the loop; a
    /// finished run cannot be restarted except through a checkpoint.
    pub async fn run(mut self) -> Result<(RunOutcome, TrainMetrics), Error> {
        let outcome = self.run_epochs().await;
        self.group.teardown().await;
        Ok((outcome?, self.metrics))
    }

    async fn run_epochs(&mut self) -> Result<RunOutcome, Error> {
        for epoch in self.start_epoch..self.epochs {
            if self.interrupter.should_stop() {
                info!("stop requested, halting before epoch {epoch}");
                return Ok(RunOutcome::Stopped);
            }
            self.train_epoch(epoch).await?;
            let (val_loss, miou) = self.eval_epoch(epoch)?;
            info!("epoch {epoch}: val_loss {val_loss:.4}, miou {miou:.4}");
            self.state.epoch = epoch;
            self.checkpoint.persist(
                self.group.topology(),
                &mut self.state,
                self.model.as_ref(),
                self.optimizer.as_ref(),
                self.schedule.as_ref(),
                &self.scaler,
                epoch,
                val_loss,
                miou,
            )?;
            self.metrics.bump_epoch();
        }
        Ok(RunOutcome::Completed)
    }

    async fn train_epoch(&mut self, epoch: usize) -> Result<(), Error> {
        self.model.set_train(true);
        self.train_loader.set_epoch(epoch);
        let batches_per_epoch = self.train_loader.batches_per_epoch();
        let mut batch_index = 0usize;

        while let Some(batch) = self.train_loader.next_batch() {
            let iteration = batches_per_epoch * epoch + batch_index;
            batch_index += 1;

            self.model.zero_grad();
            let logits = self.model.forward(&batch.images);
            let (loss, mut grad_logits) = self.criterion.loss_grad(&logits, &batch.targets);

            let scale = self.scaler.loss_scale();
            if scale != 1.0 {
                grad_logits.mapv_inplace(|g| g * scale);
            }
            self.model.backward(&batch.images, &grad_logits);

            let found_inf = self.scaler.unscale(self.model.grads_mut());
            if found_inf {
                // Skip the update entirely: no all-reduce, no optimizer
                // step, no schedule step.
                self.scaler.update(true);
                self.metrics.bump_overflow();
                warn!("non-finite gradients at iteration {iteration}, update skipped");
                continue;
            }

            self.group.all_reduce_mean(self.model.grads_mut()).await?;

            let lr = self.schedule.lr();
            let (params, grads) = self.model.params_and_grads_mut();
            self.optimizer.step(params, grads, lr);
            self.scaler.update(false);
            self.schedule.step();

            self.sink.add_scalar("loss/training", loss, iteration)?;
            self.sink.add_scalar("lr", lr, iteration)?;
            self.metrics.bump_batch();
            debug!("iteration {iteration}: loss {loss:.4}, lr {lr:.6}");
        }
        Ok(())
    }

    fn eval_epoch(&mut self, epoch: usize) -> Result<(f32, f32), Error> {
        self.model.set_train(false);
        let (val_loss, miou) = eval::evaluate(
            self.model.as_mut(),
            self.criterion.as_ref(),
            &mut self.val_loader,
        );
        self.sink.add_scalar("loss/validation", val_loss, epoch)?;
        self.sink.add_scalar("metrics/miou", miou, epoch)?;
        self.record_eval_images(epoch)?;
        self.model.set_train(true);
        Ok((val_loss, miou))
    }

    /// Renders a fixed window of the first validation batch. Ground truth
    /// is recorded once, at the first epoch; predictions every epoch.
    fn record_eval_images(&mut self, epoch: usize) -> Result<(), Error> {
        self.val_loader.reset();
        let Some(batch) = self.val_loader.next_batch() else {
            return Ok(());
        };
        self.val_loader.reset();

        let n = batch.images.dim().0;
        let (lo, hi) = if n >= 4 { (2, 4) } else { (0, n.min(2)) };
        if lo >= hi {
            return Ok(());
        }
        let images = batch
            .images
            .slice(ndarray::s![lo..hi, .., .., ..])
            .to_owned();
        let targets = batch.targets.slice(ndarray::s![lo..hi, .., ..]).to_owned();

        let palette = self.val_loader.dataset().palette().to_vec();
        let ignore_index = self.val_loader.dataset().ignore_index();

        if epoch == 0 {
            let truth = decode_segmap(&targets, &palette, ignore_index, IGNORE_COLOR);
            self.sink.add_images("eval/groundtruth", &truth, epoch)?;
        }
        let logits = self.model.forward(&images);
        let predictions = argmax_classes(&logits);
        let rendered = decode_segmap(&predictions, &palette, ignore_index, IGNORE_COLOR);
        let tag = format!("eval/{}", self.model_tag);
        self.sink.add_images(&tag, &rendered, epoch)?;
        Ok(())
    }
}
