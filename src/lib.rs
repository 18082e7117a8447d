pub mod backend;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod distillation;
pub mod error;
pub mod loss;
pub mod model;
pub mod schedule;
pub mod training;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::config::{TrainingConfig, training_config};
    pub use crate::dataset::{MnistBatch, MnistBatcher, MnistDataset, MnistItem};
    pub use crate::distillation::{
        DistillationOutput, KnowledgeDistillation, ValidationAccuracy, ValidationOutput,
    };
    pub use crate::loss::{DistillationLoss, DistillationLossConfig, KlReduction};
    pub use crate::model::{Classifier, ClassifierConfig, StudentNet, TeacherNet};
    pub use crate::schedule::StepDecayConfig;
}
