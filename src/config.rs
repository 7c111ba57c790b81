//! The configuration of a training run, read from JSON.

use std::{fs, num::NonZeroUsize, path::Path};

use runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TileErr},
    layer::ActKind,
    model::MlpConfig,
    optim::{AdamParams, SgdParams},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSection {
    pub nodes: NonZeroUsize,
    /// Defaults to the available parallelism.
    #[serde(default)]
    pub workers: Option<NonZeroUsize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActConfig {
    Relu,
    GeluTanh,
}

impl From<ActConfig> for ActKind {
    fn from(act: ActConfig) -> Self {
        match act {
            ActConfig::Relu => ActKind::Relu,
            ActConfig::GeluTanh => ActKind::GeluTanh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    pub input: NonZeroUsize,
    pub hidden: Vec<NonZeroUsize>,
    pub output: NonZeroUsize,
    /// The tile extent of every feature axis.
    pub tile: NonZeroUsize,
    pub act: ActConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        lr: f64,
        #[serde(default)]
        momentum: f64,
        #[serde(default)]
        weight_decay: f64,
    },
    Adam {
        lr: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        #[serde(default)]
        weight_decay: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingSection {
    pub batch: NonZeroUsize,
    pub minibatch: NonZeroUsize,
    pub epochs: usize,
    #[serde(default)]
    pub warmup_epochs: usize,
    /// The amount of synthetic samples.
    pub samples: NonZeroUsize,
    pub seed: u64,
    pub optimizer: OptimizerConfig,
}

/// A whole training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub runtime: RuntimeSection,
    pub model: ModelSection,
    pub training: TrainingSection,
}

impl RunConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the relations between fields serde can't.
    ///
    /// # Returns
    /// `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let TrainingSection {
            batch,
            minibatch,
            samples,
            optimizer,
            ..
        } = self.training;

        if batch.get() % minibatch.get() != 0 {
            return Err(TileErr::InvalidConfig(format!(
                "batch {batch} is not a multiple of minibatch {minibatch}"
            )));
        }

        if samples.get() % batch.get() != 0 {
            return Err(TileErr::InvalidConfig(format!(
                "{samples} samples don't fill whole batches of {batch}"
            )));
        }

        let lr = match optimizer {
            OptimizerConfig::Sgd { lr, .. } | OptimizerConfig::Adam { lr, .. } => lr,
        };
        if !(lr.is_finite() && lr > 0.) {
            return Err(TileErr::InvalidConfig(format!(
                "the learning rate must be positive, got {lr}"
            )));
        }

        if let OptimizerConfig::Adam { beta1, beta2, .. } = optimizer
            && !((0. ..1.).contains(&beta1) && (0. ..1.).contains(&beta2))
        {
            return Err(TileErr::InvalidConfig(format!(
                "adam betas must be in [0, 1), got {beta1} and {beta2}"
            )));
        }

        Ok(())
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::new(self.runtime.nodes, self.runtime.workers)
    }

    pub fn mlp_config(&self) -> MlpConfig {
        MlpConfig {
            hidden: self.model.hidden.iter().map(|h| h.get()).collect(),
            output: self.model.output.get(),
            tile: self.model.tile.get(),
            act: self.model.act.into(),
            seed: self.training.seed,
        }
    }
}

impl OptimizerConfig {
    pub fn sgd_params(&self) -> Option<SgdParams<f64>> {
        match *self {
            OptimizerConfig::Sgd {
                lr,
                momentum,
                weight_decay,
            } => Some(SgdParams {
                lr,
                momentum,
                weight_decay,
            }),
            OptimizerConfig::Adam { .. } => None,
        }
    }

    pub fn adam_params(&self) -> Option<AdamParams<f64>> {
        match *self {
            OptimizerConfig::Adam {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay,
            } => Some(AdamParams {
                lr,
                beta1,
                beta2,
                eps,
                weight_decay,
            }),
            OptimizerConfig::Sgd { .. } => None,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        let n = |v: usize| NonZeroUsize::new(v).unwrap_or(NonZeroUsize::MIN);

        Self {
            runtime: RuntimeSection {
                nodes: n(2),
                workers: None,
            },
            model: ModelSection {
                input: n(8),
                hidden: vec![n(16)],
                output: n(2),
                tile: n(4),
                act: ActConfig::Relu,
            },
            training: TrainingSection {
                batch: n(16),
                minibatch: n(8),
                epochs: 20,
                warmup_epochs: 1,
                samples: n(128),
                seed: 42,
                optimizer: OptimizerConfig::Sgd {
                    lr: 0.01,
                    momentum: 0.9,
                    weight_decay: 0.,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_json_run() {
        let raw = r#"{
            "runtime": { "nodes": 2 },
            "model": { "input": 4, "hidden": [8], "output": 1, "tile": 4, "act": "gelu_tanh" },
            "training": {
                "batch": 8, "minibatch": 4, "epochs": 3, "samples": 32, "seed": 1,
                "optimizer": { "adam": { "lr": 0.001, "beta1": 0.9, "beta2": 0.999, "eps": 1e-8 } }
            }
        }"#;

        let config = RunConfig::from_json(raw).unwrap();
        assert_eq!(config.runtime.workers, None);
        assert_eq!(config.training.warmup_epochs, 0);
        assert_eq!(config.model.act, ActConfig::GeluTanh);
        assert!(config.training.optimizer.adam_params().is_some());
    }

    #[test]
    fn rejects_uneven_batches() {
        let mut config = RunConfig::default();
        config.training.minibatch = NonZeroUsize::new(5).unwrap();
        assert!(matches!(config.validate(), Err(TileErr::InvalidConfig(_))));

        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        assert!(matches!(RunConfig::from_json("{"), Err(TileErr::Json(_))));
    }
}
