use std::{fs, num::NonZeroUsize, path::Path};

use secure_ml::{optimization::AdamWConfig, reduction::ReduceMethod};
use serde::Deserialize;

use crate::error::{Result, WorkerErr};

/// When to prune and how many hidden channels survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PruneConfig {
    /// The global step after which the model is pruned, starting at 1.
    pub step: usize,
    /// The amount of hidden channels kept.
    pub keep: usize,
}

/// The training run of a worker, shared by every worker of the group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainConfig {
    pub optimizer: AdamWConfig,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub val_steps: usize,
    pub batch_size: usize,
    pub in_features: usize,
    pub hidden: usize,
    pub out_features: usize,
    pub reduce: ReduceMethod,
    pub encrypt: bool,
    pub meter_window: Option<NonZeroUsize>,
    /// Weight of the L1 penalty on the channel gates.
    pub gate_l1: f32,
    pub prune: Option<PruneConfig>,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            optimizer: AdamWConfig {
                lr: 1e-2,
                ..Default::default()
            },
            epochs: 3,
            steps_per_epoch: 50,
            val_steps: 5,
            batch_size: 32,
            in_features: 8,
            hidden: 16,
            out_features: 2,
            reduce: ReduceMethod::Avg,
            encrypt: false,
            meter_window: None,
            gate_l1: 1e-3,
            prune: None,
            seed: 0,
        }
    }
}

impl TrainConfig {
    /// Parses and validates a JSON config, missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the JSON config at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Checks the config for values no run could work with.
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;

        for (name, value) in [
            ("epochs", self.epochs),
            ("steps_per_epoch", self.steps_per_epoch),
            ("batch_size", self.batch_size),
            ("in_features", self.in_features),
            ("hidden", self.hidden),
            ("out_features", self.out_features),
        ] {
            if value == 0 {
                return Err(WorkerErr::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if !(self.gate_l1 >= 0.) {
            return Err(WorkerErr::InvalidConfig(format!(
                "gate_l1 ({}) must be non negative",
                self.gate_l1
            )));
        }

        let Some(total) = self.total_steps() else {
            return Err(WorkerErr::InvalidConfig(format!(
                "{} epochs of {} steps overflow the step counter",
                self.epochs, self.steps_per_epoch
            )));
        };

        if let Some(PruneConfig { step, keep }) = self.prune {
            if step == 0 || step > total {
                return Err(WorkerErr::InvalidConfig(format!(
                    "prune step ({step}) must be in 1..={total}"
                )));
            }

            if keep == 0 || keep >= self.hidden {
                return Err(WorkerErr::InvalidConfig(format!(
                    "prune keep ({keep}) must be in 1..{}",
                    self.hidden
                )));
            }
        }

        Ok(())
    }

    /// Returns the total amount of training steps, `None` if it overflows.
    pub fn total_steps(&self) -> Option<usize> {
        self.epochs.checked_mul(self.steps_per_epoch)
    }
}
