//! Teacher/student pairing with the training and validation step functions.
//!
//! Only the student is ever optimized. The teacher is frozen when the pair is built:
//! its parameters stop requiring gradients and its logits are detached from the graph.

use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::train::ClassificationOutput;

use crate::dataset::MnistBatch;
use crate::loss::DistillationLoss;
use crate::model::{StudentNet, TeacherNet};

/// What the validation step reports as accuracy.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ValidationAccuracy {
    /// Fraction of samples whose argmax prediction matches the label.
    #[default]
    Measured,
    /// Always `0`, whatever the predictions.
    ///
    /// Reproduces runs whose accuracy metric was overwritten before logging.
    Zeroed,
}

pub struct KnowledgeDistillation<B: Backend> {
    pub teacher: TeacherNet<B>,
    pub student: StudentNet<B>,
    pub loss: DistillationLoss,
    pub validation_accuracy: ValidationAccuracy,
}

/// Output of [`KnowledgeDistillation::training_step`].
#[derive(Clone, Debug)]
pub struct DistillationOutput<B: Backend> {
    /// Value to backpropagate.
    ///
    /// # Shape
    /// [1]
    pub loss: Tensor<B, 1>,
    pub hard_loss: Tensor<B, 1>,
    pub soft_loss: Tensor<B, 1>,
    /// Unscaled student logits.
    ///
    /// # Shape
    /// [batch_size, num_classes]
    pub output: Tensor<B, 2>,
    /// # Shape
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> DistillationOutput<B> {
    /// Adapts into burn's classification output, so the loss and accuracy metrics can consume it.
    pub fn classification(&self) -> ClassificationOutput<B> {
        ClassificationOutput::new(
            self.loss.clone(),
            self.output.clone(),
            self.targets.clone(),
        )
    }
}

/// Output of [`KnowledgeDistillation::validation_step`].
#[derive(Clone, Debug)]
pub struct ValidationOutput<B: Backend> {
    /// Cross entropy of the raw student logits.
    pub loss: Tensor<B, 1>,
    /// Reported accuracy, in between 0.0 and 1.0.
    pub accuracy: f64,
    pub output: Tensor<B, 2>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> KnowledgeDistillation<B> {
    /// Pairs the networks, freezing the teacher.
    pub fn new(teacher: TeacherNet<B>, student: StudentNet<B>, loss: DistillationLoss) -> Self {
        Self {
            teacher: teacher.no_grad(),
            student,
            loss,
            validation_accuracy: ValidationAccuracy::default(),
        }
    }

    pub fn with_validation_accuracy(mut self, validation_accuracy: ValidationAccuracy) -> Self {
        self.validation_accuracy = validation_accuracy;
        self
    }

    /// Student predictions.
    ///
    /// # Shapes
    ///   - Input [batch, 1, HEIGHT, WIDTH]
    ///   - Output [batch, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.student.forward(images)
    }

    /// Both networks see the same batch; the loss blends the hard-label and distillation terms.
    pub fn training_step(&self, batch: MnistBatch<B>) -> DistillationOutput<B> {
        let [batch_size, ..] = batch.images.dims();
        assert_eq!([batch_size], batch.targets.dims());

        let teacher_logits = self.teacher.forward(batch.images.clone()).detach();
        let student_logits = self.student.forward(batch.images);

        let terms = self.loss.forward(
            student_logits.clone(),
            teacher_logits,
            batch.targets.clone(),
        );

        DistillationOutput {
            loss: terms.total,
            hard_loss: terms.hard,
            soft_loss: terms.soft,
            output: student_logits,
            targets: batch.targets,
        }
    }

    pub fn validation_step(&self, batch: MnistBatch<B>) -> ValidationOutput<B> {
        let output = self.student.forward(batch.images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), batch.targets.clone());

        let accuracy = match self.validation_accuracy {
            ValidationAccuracy::Measured => accuracy(output.clone(), batch.targets.clone()),
            ValidationAccuracy::Zeroed => 0.0,
        };

        ValidationOutput {
            loss,
            accuracy,
            output,
            targets: batch.targets,
        }
    }
}

impl<B: AutodiffBackend> KnowledgeDistillation<B> {
    /// Copy of the pair on the inner backend, for validation.
    pub fn valid(&self) -> KnowledgeDistillation<B::InnerBackend> {
        KnowledgeDistillation {
            teacher: self.teacher.valid(),
            student: self.student.valid(),
            loss: self.loss.clone(),
            validation_accuracy: self.validation_accuracy,
        }
    }
}

/// Fraction of rows whose argmax matches the target.
///
/// # Shapes
///   - output [batch, num_classes]
///   - targets [batch]
pub fn accuracy<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> f64 {
    let [batch_size, _num_classes] = output.dims();
    if batch_size == 0 {
        return 0.0;
    }
    let predictions = output.argmax(1).squeeze_dim::<1>(1);
    debug_assert_eq!([batch_size], predictions.dims());

    let correct = predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<f64>();
    correct / batch_size as f64
}
