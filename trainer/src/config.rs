use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;

/// Full description of a training run, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Name used for checkpoint files and logged events.
    pub run_name: String,
    pub model: ModelConfig,
    /// Whether to form a multi-process group. With `false` (or a world size
    /// of one) the run degrades to single-process training.
    #[serde(default)]
    pub ddp: bool,
    /// Path of a checkpoint record to resume from.
    #[serde(default)]
    pub resume: Option<PathBuf>,
    /// Resume model weights only and freeze normalization statistics.
    #[serde(default)]
    pub fine_tune_norm: bool,
    pub train: TrainConfig,
    pub data: DataConfig,
    #[serde(default = "default_weights_dir")]
    pub weights_dir: PathBuf,
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    /// When set, the run stops at the next epoch boundary once this file
    /// exists. When unset, Ctrl-C requests the same cooperative stop.
    #[serde(default)]
    pub stop_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Enables dynamic loss scaling for the backward pass.
    #[serde(default)]
    pub amp_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub base_lr: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_poly_power")]
    pub poly_power: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub train_len: usize,
    pub val_len: usize,
    pub channels: usize,
    pub classes: usize,
    pub height: usize,
    pub width: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_ignore_index")]
    pub ignore_index: i64,
}

fn default_weights_dir() -> PathBuf {
    PathBuf::from("weights")
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_momentum() -> f32 {
    0.9
}

fn default_poly_power() -> f32 {
    0.9
}

fn default_ignore_index() -> i64 {
    255
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.run_name.is_empty() {
            return Err(Error::Config("run_name must not be empty".into()));
        }
        if self.train.epochs == 0 {
            return Err(Error::Config("train.epochs must be positive".into()));
        }
        if self.train.batch_size == 0 {
            return Err(Error::Config("train.batch_size must be positive".into()));
        }
        if self.train.base_lr <= 0.0 {
            return Err(Error::Config("train.base_lr must be positive".into()));
        }
        if self.data.classes < 2 {
            return Err(Error::Config("data.classes must be at least 2".into()));
        }
        if self.data.train_len == 0 || self.data.val_len == 0 {
            return Err(Error::Config("data splits must not be empty".into()));
        }
        if self.fine_tune_norm && self.resume.is_none() {
            return Err(Error::Config(
                "fine_tune_norm requires a resume checkpoint".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "run_name": "demo",
            "model": { "name": "norm_linear" },
            "train": { "epochs": 3, "batch_size": 4, "base_lr": 0.01 },
            "data": {
                "train_len": 32, "val_len": 8,
                "channels": 3, "classes": 5, "height": 8, "width": 8
            }
        })
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: RunConfig = serde_json::from_value(minimal_json()).unwrap();
        cfg.validate().unwrap();
        assert!(!cfg.ddp);
        assert!(!cfg.model.amp_enabled);
        assert_eq!(cfg.data.ignore_index, 255);
        assert_eq!(cfg.train.momentum, 0.9);
        assert_eq!(cfg.weights_dir, PathBuf::from("weights"));
    }

    #[test]
    fn fine_tune_without_resume_is_rejected() {
        let mut raw = minimal_json();
        raw["fine_tune_norm"] = serde_json::json!(true);
        let cfg: RunConfig = serde_json::from_value(raw).unwrap();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_epochs_is_rejected() {
        let mut raw = minimal_json();
        raw["train"]["epochs"] = serde_json::json!(0);
        let cfg: RunConfig = serde_json::from_value(raw).unwrap();
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
