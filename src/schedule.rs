use crate::Error;
use anyhow::Result;
use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the learning rate decays after burn in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatePolicy {
    #[default]
    Constant,
    /// Multiplies the rate by `scales[i]` once the iteration reaches `steps[i]`.
    Steps { steps: Vec<u32>, scales: Vec<f32> },
    /// `rate * (1 - iteration / max_batches)^power`
    Poly { power: f32 },
    /// `rate * gamma^iteration`
    Exp { gamma: f32 },
}

/// The learning rate schedule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearningRatePolicy {
    /// The base rate.
    pub rate: f32,
    /// Iterations of warm up, during which the rate grows as `(iteration / burn_in)^4`.
    pub burn_in: u32,
    pub policy: RatePolicy,
}

impl Default for LearningRatePolicy {
    fn default() -> Self {
        Self {
            rate: 0.001,
            burn_in: 0,
            policy: RatePolicy::Constant,
        }
    }
}

impl LearningRatePolicy {
    /// The rate at `iteration`, counting from 0.
    pub fn rate(&self, iteration: u32, max_batches: u32) -> f32 {
        if iteration < self.burn_in {
            return self.rate * (iteration as f32 / self.burn_in as f32).powi(4);
        }
        match &self.policy {
            RatePolicy::Constant => self.rate,
            RatePolicy::Steps { steps, scales } => steps
                .iter()
                .zip(scales)
                .take_while(|(step, _)| iteration >= **step)
                .fold(self.rate, |rate, (_, scale)| rate * scale),
            RatePolicy::Poly { power } => {
                if max_batches == 0 {
                    return self.rate;
                }
                let progress = (iteration as f32 / max_batches as f32).min(1.);
                self.rate * (1. - progress).powf(*power)
            }
            RatePolicy::Exp { gamma } => self.rate * gamma.powf(iteration as f32),
        }
    }
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.rate >= 0.) {
            return Err(
                Error::config(format!("learning rate {} must not be negative", self.rate)).into(),
            );
        }
        if let RatePolicy::Steps { steps, scales } = &self.policy {
            if steps.len() != scales.len() {
                return Err(Error::config(format!(
                    "{} steps but {} scales",
                    steps.len(),
                    scales.len()
                ))
                .into());
            }
            if steps.windows(2).any(|w| w[0] > w[1]) {
                return Err(Error::config("steps must be ascending").into());
            }
        }
        Ok(())
    }
}

fn default_interval() -> u32 {
    10
}

fn default_min() -> usize {
    320
}

fn default_max() -> usize {
    608
}

fn default_step() -> usize {
    32
}

/// Trains at a random square resolution, chosen anew every `interval` iterations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResizePolicy {
    #[serde(default = "default_interval")]
    pub interval: u32,
    #[serde(default = "default_min")]
    pub min: usize,
    #[serde(default = "default_max")]
    pub max: usize,
    /// Resolutions are `min + k * step`.
    #[serde(default = "default_step")]
    pub step: usize,
}

impl Default for ResizePolicy {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            min: default_min(),
            max: default_max(),
            step: default_step(),
        }
    }
}

impl ResizePolicy {
    /// The resolution to train at after `completed` iterations, if one is due.
    pub fn next(&self, completed: u32, rng: &mut StdRng) -> Option<usize> {
        if completed == 0 || completed % self.interval != 0 {
            return None;
        }
        let count = (self.max - self.min) / self.step;
        Some(self.min + rng.gen_range(0..=count) * self.step)
    }
    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval == 0 || self.step == 0 || self.min == 0 || self.min > self.max {
            return Err(Error::config(format!(
                "resize policy needs a positive interval and step and 0 < min <= max, \
                 found {self:?}"
            ))
            .into());
        }
        Ok(())
    }
}

fn default_dir() -> PathBuf {
    PathBuf::from("backup")
}

fn default_prefix() -> String {
    "weights".into()
}

fn default_save_interval() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

/// Where and when checkpoints are written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SavePolicy {
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Iterations between checkpoints, 0 disables periodic checkpoints.
    #[serde(default = "default_save_interval")]
    pub interval: u32,
    /// Write `<prefix>_final.weights` when training ends.
    #[serde(default = "default_true")]
    pub save_final: bool,
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            prefix: default_prefix(),
            interval: default_save_interval(),
            save_final: true,
        }
    }
}

impl SavePolicy {
    /// Whether a checkpoint is due after `completed` iterations.
    pub fn due(&self, completed: u32) -> bool {
        self.interval > 0 && completed > 0 && completed % self.interval == 0
    }
    pub fn path(&self, completed: u32) -> PathBuf {
        self.dir.join(format!("{}_{completed}.weights", self.prefix))
    }
    pub fn final_path(&self) -> PathBuf {
        self.dir.join(format!("{}_final.weights", self.prefix))
    }
}
