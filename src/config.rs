use burn::optim::AdamConfig;
use burn::prelude::*;
use std::path::Path;

use crate::distillation::ValidationAccuracy;
use crate::error::Error;
use crate::loss::DistillationLossConfig;
use crate::model::ClassifierConfig;
use crate::schedule::StepDecayConfig;

/// Everything a distillation run needs, passed explicitly to each component.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub optimizer: AdamConfig,

    /// Shared by the teacher and the student.
    #[config(default = "ClassifierConfig::new()")]
    pub model: ClassifierConfig,

    #[config(default = "DistillationLossConfig::new()")]
    pub distillation: DistillationLossConfig,

    #[config(default = 5)]
    pub num_epochs: usize,
    #[config(default = 2)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 1e-3)]
    pub lr: f64,
    /// Disabled unless set.
    #[config(default = "None")]
    pub lr_decay: Option<StepDecayConfig>,
    #[config(default = 0)]
    pub seed: u64,

    /// Supervised epochs for the teacher before distillation.
    /// With `0` the teacher keeps its random initialization.
    #[config(default = 0)]
    pub teacher_epochs: usize,

    #[config(default = "ValidationAccuracy::Measured")]
    pub validation_accuracy: ValidationAccuracy,

    /// Print a progress line every this many training batches.
    #[config(default = 100)]
    pub log_interval: usize,
}

/// Adam with the usual `β = (0.9, 0.999)` and `ε = 1e-8`, without weight decay.
pub fn optimizer_config() -> AdamConfig {
    AdamConfig::new()
        .with_beta_1(0.9)
        .with_beta_2(0.999)
        .with_epsilon(1e-8)
}

/// The default configuration.
pub fn training_config() -> TrainingConfig {
    TrainingConfig::new(optimizer_config())
}

impl TrainingConfig {
    /// Loads a json configuration file.
    pub fn load_file(path: &Path) -> crate::error::Result<Self> {
        println!("Loading training config from {path:?}");
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the training loop cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if self.num_epochs == 0 {
            return invalid("num_epochs must be at least 1".into());
        }
        if self.log_interval == 0 {
            return invalid("log_interval must be at least 1".into());
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return invalid(format!("lr must be positive, got {}", self.lr));
        }
        if let Some(decay) = &self.lr_decay {
            decay.validate()?;
        }
        self.distillation.try_init()?;
        Ok(())
    }
}
