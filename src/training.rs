use burn::prelude::*;
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    nn::loss::CrossEntropyLossConfig,
    module::AutodiffModule,
    optim::{Adam, AdamConfig, GradientsParams, Optimizer, adaptor::OptimizerAdaptor},
    tensor::backend::AutodiffBackend,
    train::ClassificationOutput,
    train::metric::{AccuracyMetric, Adaptor, LossMetric, Metric, MetricMetadata, Numeric},
};
use burn_dataset::Dataset;
use std::path::Path;
use std::sync::Arc;

use crate::config::TrainingConfig;
use crate::dataset::{MnistBatch, MnistBatcher, MnistDataset, MnistItem};
use crate::distillation::KnowledgeDistillation;
use crate::error::Result;
use crate::model::{StudentNet, TeacherNet};
use crate::schedule::lr_at;

pub type Dataloader<B> = Arc<dyn DataLoader<B, MnistBatch<B>> + 'static>;

type Optim<AutoB, M> = OptimizerAdaptor<Adam, M, AutoB>;

/// Averaged metrics of a validation run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValidSummary {
    /// `NaN` when no validation batch was seen.
    pub loss: f64,
    /// In between 0.0 and 1.0.
    pub accuracy: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSummary {
    /// Average training loss of each epoch.
    pub train_losses: Vec<f64>,
    /// Full validation after each epoch.
    pub valid: Vec<ValidSummary>,
}

/// Training loader shuffles with the configured seed, validation loader keeps the dataset order.
pub fn dataloader<B: Backend, D>(
    dataset: D,
    config: &TrainingConfig,
    shuffle: bool,
) -> Dataloader<B>
where
    D: Dataset<MnistItem> + 'static,
{
    let mut builder =
        DataLoaderBuilder::new(MnistBatcher::default()).batch_size(config.batch_size);
    if shuffle {
        builder = builder.shuffle(config.seed);
    }
    if config.num_workers > 0 {
        builder = builder.num_workers(config.num_workers);
    }
    builder.build(dataset)
}

fn init_optim<AutoB: AutodiffBackend, M: AutodiffModule<AutoB>>(
    optimizer: &AdamConfig,
) -> Optim<AutoB, M> {
    optimizer.init::<AutoB, M>()
}

/// Downloads MNIST into `data_dir` (if missing) and distills a freshly initialized student.
///
/// Without `teacher`, a randomly initialized one is used, optionally pre-trained for
/// `config.teacher_epochs`.
pub fn train<AutoB: AutodiffBackend>(
    config: &TrainingConfig,
    data_dir: &Path,
    teacher: Option<TeacherNet<AutoB>>,
    training_device: AutoB::Device,
) -> Result<TrainingSummary> {
    config.validate()?;
    AutoB::seed(&training_device, config.seed);
    let loss = config.distillation.try_init()?;

    // Create the dataloaders
    let dataloader_train = dataloader::<AutoB, _>(MnistDataset::train(data_dir)?, config, true);
    let dataloader_valid =
        dataloader::<AutoB::InnerBackend, _>(MnistDataset::test(data_dir)?, config, false);

    let teacher = teacher.unwrap_or_else(|| {
        println!("Initializing new teacher");
        config.model.init(&training_device)
    });
    let teacher = if config.teacher_epochs > 0 {
        pretrain_teacher(teacher, Arc::clone(&dataloader_train), config)
    } else {
        teacher
    };
    let student = config.model.init(&training_device);

    let kd = KnowledgeDistillation::new(teacher, student, loss)
        .with_validation_accuracy(config.validation_accuracy);

    let (_kd, summary) = distill(kd, dataloader_train, dataloader_valid, config);
    Ok(summary)
}

/// Runs `config.num_epochs` epochs of distillation, each followed by a full validation.
pub fn distill<AutoB: AutodiffBackend>(
    mut kd: KnowledgeDistillation<AutoB>,
    dataloader_train: Dataloader<AutoB>,
    dataloader_valid: Dataloader<AutoB::InnerBackend>,
    config: &TrainingConfig,
) -> (KnowledgeDistillation<AutoB>, TrainingSummary) {
    // only the student is registered with the optimizer
    let mut optim = init_optim::<AutoB, StudentNet<AutoB>>(&config.optimizer);

    let training_num_items = dataloader_train.num_items();
    let mut metric_meta = MetricMetadata {
        progress: burn::data::dataloader::Progress::new(0, training_num_items),
        epoch: 1,
        epoch_total: config.num_epochs,
        iteration: 0,
        lr: Some(config.lr),
    };

    println!("running small initial validation...");
    epoch_valid::<AutoB::InnerBackend>(
        Arc::clone(&dataloader_valid),
        &kd.valid(),
        config,
        0,
        Some(10),
    );

    let mut summary = TrainingSummary {
        train_losses: Vec::with_capacity(config.num_epochs),
        valid: Vec::with_capacity(config.num_epochs),
    };

    println!("Starting training...");
    for epoch in 1..config.num_epochs + 1 {
        metric_meta.epoch = epoch;
        metric_meta.progress.items_processed = 0;

        let (kd_, train_loss) = epoch_train::<AutoB>(
            Arc::clone(&dataloader_train),
            kd,
            config,
            &mut optim,
            &mut metric_meta,
            None,
        );
        kd = kd_;
        summary.train_losses.push(train_loss);

        println!("running full validation...");
        let valid = epoch_valid::<AutoB::InnerBackend>(
            Arc::clone(&dataloader_valid),
            &kd.valid(),
            config,
            epoch,
            None,
        );
        summary.valid.push(valid);
    }
    println!("Training finished.");

    (kd, summary)
}

/// One pass over the training data. Returns the updated pair and the average loss.
pub fn epoch_train<AutoB: AutodiffBackend>(
    dataloader_train: Dataloader<AutoB>,
    mut kd: KnowledgeDistillation<AutoB>,
    config: &TrainingConfig,
    optim: &mut Optim<AutoB, StudentNet<AutoB>>,
    metric_meta: &mut MetricMetadata,
    training_loop_limit: Option<usize>,
) -> (KnowledgeDistillation<AutoB>, f64) {
    let training_loop_limit = training_loop_limit.unwrap_or(usize::MAX);
    let log_interval = config.log_interval.max(1);
    let num_batches = dataloader_train.num_items().div_ceil(config.batch_size);
    let mut loss_metric = LossMetric::<AutoB>::new();
    let mut acc_metric = AccuracyMetric::<AutoB>::new();

    // training loop
    for (mut b, batch) in dataloader_train
        .iter()
        .enumerate()
        .take(training_loop_limit)
    {
        b += 1;
        let [batch_size, ..] = batch.images.dims();

        let lr = lr_at(config.lr, config.lr_decay.as_ref(), metric_meta.iteration);
        metric_meta.iteration += 1;
        metric_meta.progress.items_processed += batch_size;
        metric_meta.lr = Some(lr);

        let output = kd.training_step(batch);
        let pre_metrics = output.classification();
        acc_metric.update(&pre_metrics.adapt(), metric_meta);
        loss_metric.update(&pre_metrics.adapt(), metric_meta);

        if b % log_interval == 0 || b == num_batches {
            println!(
                "Epoch {}/{}, Batch {b:0>5}/{num_batches}, train_loss {:.4} (hard {:.4}, soft {:.6}), Acc {:0>6.2}",
                metric_meta.epoch,
                metric_meta.epoch_total,
                loss_metric.value().current(),
                output.hard_loss.clone().into_scalar().elem::<f64>(),
                output.soft_loss.clone().into_scalar().elem::<f64>(),
                acc_metric.value().current(),
            );
        }

        let grads = output.loss.backward();
        let grads = GradientsParams::from_grads(grads, &kd.student);
        kd.student = optim.step(lr, kd.student, grads);
    }

    let avg_loss = loss_metric.running_value().current();
    println!(
        "Epoch {}/{}, Avg train_loss {:.4}, Avg Acc: {:.2}",
        metric_meta.epoch,
        metric_meta.epoch_total,
        avg_loss,
        acc_metric.running_value().current(),
    );

    (kd, avg_loss)
}

/// Student loss and accuracy over the validation data.
pub fn epoch_valid<B: Backend>(
    dataloader_valid: Dataloader<B>,
    kd: &KnowledgeDistillation<B>,
    config: &TrainingConfig,
    epoch: usize,
    valid_loop_limit: Option<usize>,
) -> ValidSummary {
    let valid_loop_limit = valid_loop_limit.unwrap_or(usize::MAX);
    let valid_num_items = dataloader_valid.num_items();
    let mut metric_meta = MetricMetadata {
        progress: burn::data::dataloader::Progress::new(0, valid_num_items),
        epoch,
        epoch_total: config.num_epochs,
        iteration: 0,
        lr: Some(config.lr),
    };

    let mut loss_metric = LossMetric::<B>::new();
    let mut correct = 0.0;
    let mut seen = 0;

    // validation loop
    for batch in dataloader_valid.iter().take(valid_loop_limit) {
        let [batch_size, ..] = batch.images.dims();
        metric_meta.iteration += 1;
        metric_meta.progress.items_processed += batch_size;

        let output = kd.validation_step(batch);
        correct += output.accuracy * batch_size as f64;
        seen += batch_size;

        let pre_metrics = ClassificationOutput::new(output.loss, output.output, output.targets);
        loss_metric.update(&pre_metrics.adapt(), &metric_meta);
    }

    let summary = if seen == 0 {
        ValidSummary {
            loss: f64::NAN,
            accuracy: 0.0,
        }
    } else {
        ValidSummary {
            loss: loss_metric.running_value().current(),
            accuracy: correct / seen as f64,
        }
    };

    println!(
        "Epoch {}/{}, Avg valid_loss {:.4}, val_acc {:.4}",
        metric_meta.epoch, metric_meta.epoch_total, summary.loss, summary.accuracy,
    );

    summary
}

/// Supervised cross-entropy training of the teacher, before it gets frozen for distillation.
pub fn pretrain_teacher<AutoB: AutodiffBackend>(
    mut teacher: TeacherNet<AutoB>,
    dataloader_train: Dataloader<AutoB>,
    config: &TrainingConfig,
) -> TeacherNet<AutoB> {
    let mut optim = init_optim::<AutoB, TeacherNet<AutoB>>(&config.optimizer);
    let mut metric_meta = MetricMetadata {
        progress: burn::data::dataloader::Progress::new(0, dataloader_train.num_items()),
        epoch: 1,
        epoch_total: config.teacher_epochs,
        iteration: 0,
        lr: Some(config.lr),
    };

    println!("Pre-training the teacher...");
    for epoch in 1..config.teacher_epochs + 1 {
        metric_meta.epoch = epoch;
        metric_meta.progress.items_processed = 0;
        let mut loss_metric = LossMetric::<AutoB>::new();
        let mut acc_metric = AccuracyMetric::<AutoB>::new();

        for batch in dataloader_train.iter() {
            let [batch_size, ..] = batch.images.dims();
            metric_meta.iteration += 1;
            metric_meta.progress.items_processed += batch_size;

            let output = teacher.forward(batch.images);
            let loss = CrossEntropyLossConfig::new()
                .init(&output.device())
                .forward(output.clone(), batch.targets.clone());

            let pre_metrics = ClassificationOutput::new(loss.clone(), output, batch.targets);
            acc_metric.update(&pre_metrics.adapt(), &metric_meta);
            loss_metric.update(&pre_metrics.adapt(), &metric_meta);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &teacher);
            teacher = optim.step(config.lr, teacher, grads);
        }

        println!(
            "Teacher epoch {}/{}, Avg Loss {:.4}, Avg Acc: {:.2}",
            metric_meta.epoch,
            metric_meta.epoch_total,
            loss_metric.running_value().current(),
            acc_metric.running_value().current(),
        );
    }

    teacher
}
