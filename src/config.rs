use crate::{
    layer::FreezeFlags,
    optimizer::Sgd,
    schedule::{LearningRatePolicy, ResizePolicy, SavePolicy},
    Error,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

/// Training configuration.
///
/// Every field has a default, so `{}` is a valid configuration.
///
/// ```
/// # use convgraph::config::TrainConfig;
/// let config = TrainConfig::from_json(r#"{
///     "mini_batch": 8,
///     "subdivisions": 2,
///     "max_batches": 500,
///     "learning_rate": {
///         "rate": 0.001,
///         "burn_in": 100,
///         "policy": { "steps": { "steps": [400], "scales": [0.1] } }
///     },
///     "resize": { "interval": 10, "min": 320, "max": 608 }
/// }"#)?;
/// assert_eq!(config.batch(), 16);
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    /// Samples per forward pass.
    pub mini_batch: usize,
    /// Forward / backward passes per update.
    pub subdivisions: usize,
    /// Truth slots per sample.
    pub max_truths: usize,
    /// Iterations after which training stops.
    pub max_batches: u32,
    /// Start counting from 0 even when resuming.
    pub restart: bool,
    /// Checkpoint to resume from.
    pub resume_from: Option<PathBuf>,
    pub freeze: FreezeFlags,
    pub learning_rate: LearningRatePolicy,
    pub momentum: f32,
    pub decay: f32,
    pub save: SavePolicy,
    /// Random input resizing, disabled by default.
    pub resize: Option<ResizePolicy>,
    /// Directory of the training log, no log is written if `None`.
    pub log_dir: Option<PathBuf>,
    /// Maximum workspace size in bytes.
    pub workspace_limit: Option<usize>,
    /// Seeds weight initialization and resizing.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            mini_batch: 1,
            subdivisions: 1,
            max_truths: 90,
            max_batches: 0,
            restart: false,
            resume_from: None,
            freeze: FreezeFlags::default(),
            learning_rate: LearningRatePolicy::default(),
            momentum: 0.9,
            decay: 0.0005,
            save: SavePolicy::default(),
            resize: None,
            log_dir: None,
            workspace_limit: None,
            seed: 0,
        }
    }
}

impl TrainConfig {
    /// Samples per update, `mini_batch * subdivisions`.
    pub fn batch(&self) -> usize {
        self.mini_batch * self.subdivisions
    }
    pub fn sgd(&self) -> Sgd {
        Sgd::builder()
            .momentum(self.momentum)
            .decay(self.decay)
            .build()
    }
    /// Parses and validates a configuration from json.
    ///
    /// **Errors**
    ///
    /// [`Error::Config`] if the json is malformed or the configuration is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("train config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
    /// Reads a configuration from a json file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read train config {path:?}!"))?;
        Self::from_json(&json)
    }
    /// Checks the configuration for values training cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mini_batch == 0 || self.subdivisions == 0 {
            return Err(Error::config(format!(
                "mini_batch ({}) and subdivisions ({}) must be positive",
                self.mini_batch, self.subdivisions
            ))
            .into());
        }
        if !(0. ..1.).contains(&self.momentum) || self.decay < 0. {
            return Err(Error::config(format!(
                "momentum {} must be in [0, 1), decay {} must not be negative",
                self.momentum, self.decay
            ))
            .into());
        }
        self.learning_rate.validate()?;
        if let Some(resize) = self.resize.as_ref() {
            resize.validate()?;
        }
        Ok(())
    }
}
