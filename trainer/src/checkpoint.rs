use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::info;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use collective::ProcessTopology;
use segmentation::{LrSchedule, Optimizer, SegModel, StateDict, TensorData};

use crate::error::Error;
use crate::scaler::GradScaler;
use crate::state::RunState;

const MODEL_PREFIX: &str = "model/";
const OPTIM_PREFIX: &str = "optim/";
const SCHED_PREFIX: &str = "sched/";
const SCALER_PREFIX: &str = "scaler/";

/// Outcome of restoring a checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resumed {
    /// First epoch the resumed run should execute.
    pub start_epoch: usize,
    pub best_miou: f32,
    pub best_val_loss: f32,
}

/// Writes and restores run checkpoints as safetensors files.
///
/// Only rank 0 persists anything. Every epoch overwrites one full record
/// (all component states plus progress metadata); epochs that improve a
/// best score additionally overwrite a model-only artifact for that
/// criterion. Files are written to a temp path and renamed into place so a
/// crash never leaves a half-written record behind.
pub struct CheckpointManager {
    weights_dir: PathBuf,
    run_name: String,
}

impl CheckpointManager {
    pub fn new(weights_dir: PathBuf, run_name: String) -> Self {
        Self {
            weights_dir,
            run_name,
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.weights_dir
            .join(format!("{}_checkpoint.safetensors", self.run_name))
    }

    pub fn best_miou_path(&self) -> PathBuf {
        self.weights_dir
            .join(format!("{}_best_miou.safetensors", self.run_name))
    }

    pub fn best_val_loss_path(&self) -> PathBuf {
        self.weights_dir
            .join(format!("{}_best_val_loss.safetensors", self.run_name))
    }

    /// Persists the end-of-epoch snapshot. Best tracking advances on
    /// every rank so replicas agree on state, but only rank 0 touches the
    /// filesystem. The full record is written unconditionally; best-model
    /// artifacts only when `state` reports an improvement.
    #[allow(clippy::too_many_arguments)]
    pub fn persist(
        &self,
        topology: ProcessTopology,
        state: &mut RunState,
        model: &dyn SegModel,
        optimizer: &dyn Optimizer,
        schedule: &dyn LrSchedule,
        scaler: &GradScaler,
        epoch: usize,
        val_loss: f32,
        miou: f32,
    ) -> Result<(), Error> {
        let flags = state.observe(miou, val_loss);
        if !topology.is_root() {
            return Ok(());
        }
        fs::create_dir_all(&self.weights_dir)?;

        let mut tensors: Vec<(String, TensorData)> = Vec::new();
        extend_prefixed(&mut tensors, MODEL_PREFIX, model.state_dict());
        extend_prefixed(&mut tensors, OPTIM_PREFIX, optimizer.state_dict());
        extend_prefixed(&mut tensors, SCHED_PREFIX, schedule.state_dict());
        extend_prefixed(&mut tensors, SCALER_PREFIX, scaler.state_dict());

        let mut metadata = HashMap::new();
        metadata.insert("epoch".to_string(), epoch.to_string());
        metadata.insert("miou".to_string(), miou.to_string());
        metadata.insert("val_loss".to_string(), val_loss.to_string());

        write_record(&self.checkpoint_path(), &tensors, Some(metadata))?;
        info!("saved checkpoint for epoch {epoch}");

        if flags.miou_improved || flags.val_loss_improved {
            let weights: Vec<(String, TensorData)> = model.state_dict().into_iter().collect();
            if flags.miou_improved {
                write_record(&self.best_miou_path(), &weights, None)?;
                info!("new best miou {miou:.4} at epoch {epoch}");
            }
            if flags.val_loss_improved {
                write_record(&self.best_val_loss_path(), &weights, None)?;
                info!("new best validation loss {val_loss:.4} at epoch {epoch}");
            }
        }
        Ok(())
    }

    /// Restores component states from a record written by [`persist`].
    ///
    /// With `fine_tune` set, only model weights are restored and the
    /// model's normalization statistics are frozen; optimizer, schedule and
    /// scaler keep their fresh configuration.
    ///
    /// [`persist`]: Self::persist
    pub fn resume(
        path: &Path,
        model: &mut dyn SegModel,
        optimizer: &mut dyn Optimizer,
        schedule: &mut dyn LrSchedule,
        scaler: &mut GradScaler,
        fine_tune: bool,
    ) -> Result<Resumed, Error> {
        let bytes = fs::read(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::CheckpointNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let record = SafeTensors::deserialize(&bytes).map_err(|e| corrupt(path, e))?;

        let model_state = strip_prefixed(&record, MODEL_PREFIX, path)?;
        model
            .load_state_dict(&model_state)
            .map_err(|e| corrupt(path, e))?;
        if fine_tune {
            model.freeze_norm();
        } else {
            let optim_state = strip_prefixed(&record, OPTIM_PREFIX, path)?;
            optimizer
                .load_state_dict(&optim_state)
                .map_err(|e| corrupt(path, e))?;
            let sched_state = strip_prefixed(&record, SCHED_PREFIX, path)?;
            schedule
                .load_state_dict(&sched_state)
                .map_err(|e| corrupt(path, e))?;
            scaler.load_state_dict(&strip_prefixed(&record, SCALER_PREFIX, path)?);
        }

        let (_, header) = SafeTensors::read_metadata(&bytes).map_err(|e| corrupt(path, e))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let epoch = parse_meta::<usize>(&metadata, "epoch", path)?;
        let best_miou = parse_meta::<f32>(&metadata, "miou", path)?;
        let best_val_loss = parse_meta::<f32>(&metadata, "val_loss", path)?;

        Ok(Resumed {
            start_epoch: epoch + 1,
            best_miou,
            best_val_loss,
        })
    }

    /// Loads a model-only artifact, e.g. a best-model file.
    pub fn load_weights(path: &Path, model: &mut dyn SegModel) -> Result<(), Error> {
        let bytes = fs::read(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::CheckpointNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let record = SafeTensors::deserialize(&bytes).map_err(|e| corrupt(path, e))?;
        let mut state = StateDict::new();
        for name in record.names() {
            state.insert(name.to_string(), decode_view(&record, name, path)?);
        }
        model.load_state_dict(&state).map_err(|e| corrupt(path, e))
    }
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> Error {
    Error::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn extend_prefixed(out: &mut Vec<(String, TensorData)>, prefix: &str, state: StateDict) {
    out.extend(
        state
            .into_iter()
            .map(|(name, tensor)| (format!("{prefix}{name}"), tensor)),
    );
}

fn strip_prefixed(record: &SafeTensors<'_>, prefix: &str, path: &Path) -> Result<StateDict, Error> {
    let mut state = StateDict::new();
    for name in record.names() {
        if let Some(stripped) = name.strip_prefix(prefix) {
            state.insert(stripped.to_string(), decode_view(record, name, path)?);
        }
    }
    Ok(state)
}

fn decode_view(record: &SafeTensors<'_>, name: &str, path: &Path) -> Result<TensorData, Error> {
    let view = record.tensor(name).map_err(|e| corrupt(path, e))?;
    if view.dtype() != Dtype::F32 {
        return Err(corrupt(path, format!("tensor {name} is not f32")));
    }
    let data = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(TensorData::new(view.shape().to_vec(), data))
}

fn write_record(
    path: &Path,
    tensors: &[(String, TensorData)],
    metadata: Option<HashMap<String, String>>,
) -> Result<(), Error> {
    let views: Vec<(&str, TensorView<'_>)> = tensors
        .iter()
        .map(|(name, t)| {
            let bytes = bytemuck::cast_slice::<f32, u8>(&t.data);
            let view = TensorView::new(Dtype::F32, t.shape.clone(), bytes)
                .map_err(|e| corrupt(path, e))?;
            Ok((name.as_str(), view))
        })
        .collect::<Result<_, Error>>()?;

    let serialized = safetensors::serialize(views, &metadata).map_err(|e| corrupt(path, e))?;

    // Write then rename, so readers only ever see complete records.
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serialized)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn parse_meta<T: std::str::FromStr>(
    metadata: &HashMap<String, String>,
    key: &str,
    path: &Path,
) -> Result<T, Error> {
    metadata
        .get(key)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| corrupt(path, format!("missing or invalid metadata key {key}")))
}
