//! Trainer and run configuration.

use crate::metrics::DEFAULT_ACCURACY_THRESHOLD;
use crate::runs;
use candle::{Device, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub struct TrainerConfig {
    pub device: Device,
    pub log_every_n_steps: usize,
    pub accuracy_threshold: f64,
    pub lr_factor: f64,
    pub lr_patience: usize,
    pub min_lr: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            log_every_n_steps: 1,
            accuracy_threshold: DEFAULT_ACCURACY_THRESHOLD,
            lr_factor: 0.1,
            lr_patience: 10,
            min_lr: 1e-5,
        }
    }
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Log running metrics every `n` batches; `0` disables batch logging.
    pub fn log_every_n_steps(mut self, n: usize) -> Self {
        self.log_every_n_steps = n;
        self
    }

    pub fn accuracy_threshold(mut self, threshold: f64) -> Self {
        self.accuracy_threshold = threshold;
        self
    }

    pub fn lr_factor(mut self, factor: f64) -> Self {
        self.lr_factor = factor;
        self
    }

    pub fn lr_patience(mut self, patience: usize) -> Self {
        self.lr_patience = patience;
        self
    }

    pub fn min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }
}

/// Command-line level settings of a training run, stored as JSON next to the
/// checkpoint. Missing fields fall back to their defaults, so `{}` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model_name: String,
    /// Side length of the square input images.
    pub input_size: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub number_of_epochs: usize,
    pub accuracy_threshold: f64,
    pub dropout: f32,
    pub log_every_n_steps: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_name: "quasi-siamese".to_string(),
            input_size: 32,
            learning_rate: 1e-3,
            batch_size: 32,
            number_of_epochs: 100,
            accuracy_threshold: DEFAULT_ACCURACY_THRESHOLD,
            dropout: 0.2,
            log_every_n_steps: 1,
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).map_err(candle::Error::wrap)?;
        serde_json::from_str(&s).map_err(candle::Error::wrap)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(candle::Error::wrap)?;
        }
        let s = serde_json::to_string_pretty(self).map_err(candle::Error::wrap)?;
        std::fs::write(path, s).map_err(candle::Error::wrap)
    }

    /// Directory name encoding the hyper-parameters of this run.
    pub fn run_directory_name(&self) -> String {
        runs::run_directory_name(
            &self.model_name,
            self.input_size,
            self.learning_rate,
            self.batch_size,
        )
    }

    pub fn trainer_config(&self, device: Device) -> TrainerConfig {
        TrainerConfig::new()
            .device(device)
            .log_every_n_steps(self.log_every_n_steps)
            .accuracy_threshold(self.accuracy_threshold)
    }
}
