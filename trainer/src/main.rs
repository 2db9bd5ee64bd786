use std::env;
use std::path::Path;
use std::process::ExitCode;

use log::{error, info};

use collective::TcpProcessGroup;
use trainer::{
    Builder, CheckpointManager, Error, Flag, GradScaler, Interrupter, JsonlSink, RunConfig,
    RunOutcome, RunState, Split, StopFile, TrainLoop, TrainMetrics, TrainSink,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    match run().await {
        Ok((outcome, metrics)) => {
            info!(
                "run {outcome:?}: {} epoch(s), {} batch(es) applied, {} overflow skip(s)",
                metrics.epochs_completed, metrics.batches_applied, metrics.overflow_skips
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(RunOutcome, TrainMetrics), Error> {
    let config_path = env::args()
        .nth(1)
        .ok_or_else(|| Error::Config("usage: trainer <config.json>".into()))?;
    let cfg = RunConfig::load(Path::new(&config_path))?;

    let mut group = TcpProcessGroup::init(cfg.ddp).await?;
    let topology = group.topology();
    info!(
        "run {} starting as rank {} of {}",
        cfg.run_name,
        topology.rank(),
        topology.world_size()
    );

    let builder = Builder::new(&cfg);
    let train_loader = builder.build_loader(Split::Train, topology);
    let val_loader = builder.build_loader(Split::Val, topology);
    let mut model = builder.build_model()?;
    let criterion = builder.build_criterion();
    let mut optimizer = builder.build_optimizer();
    let mut schedule = builder.build_schedule(train_loader.batches_per_epoch());
    let mut scaler = GradScaler::new(cfg.model.amp_enabled);

    let (state, start_epoch) = match &cfg.resume {
        Some(path) => {
            // Rank 0 may still be renaming the record it wrote; nobody
            // reads until everybody has arrived.
            if topology.world_size() > 1 {
                group.barrier().await?;
            }
            let resumed = CheckpointManager::resume(
                path,
                model.as_mut(),
                optimizer.as_mut(),
                schedule.as_mut(),
                &mut scaler,
                cfg.fine_tune_norm,
            )?;
            info!(
                "resuming from {} at epoch {} (best miou {:.4}, best val_loss {:.4})",
                path.display(),
                resumed.start_epoch,
                resumed.best_miou,
                resumed.best_val_loss
            );
            (
                RunState::resumed(
                    resumed.start_epoch.saturating_sub(1),
                    resumed.best_miou,
                    resumed.best_val_loss,
                ),
                resumed.start_epoch,
            )
        }
        None => (RunState::fresh(), 0),
    };

    let sink: Box<dyn TrainSink + Send> = Box::new(JsonlSink::create(&cfg.runs_dir, &cfg.run_name)?);
    let interrupter: Box<dyn Interrupter + Send> = match &cfg.stop_file {
        Some(path) => Box::new(StopFile::new(path.clone())),
        None => {
            let flag = Flag::default();
            let watcher = flag.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, will stop at the next epoch boundary");
                    watcher.set();
                }
            });
            Box::new(flag)
        }
    };

    let train_loop = TrainLoop {
        group,
        model,
        criterion,
        optimizer,
        schedule,
        scaler,
        train_loader,
        val_loader,
        checkpoint: CheckpointManager::new(cfg.weights_dir.clone(), cfg.run_name.clone()),
        state,
        start_epoch,
        epochs: cfg.train.epochs,
        sink,
        interrupter,
        model_tag: cfg.model.name.clone(),
        metrics: TrainMetrics::new(),
    };
    train_loop.run().await
}
