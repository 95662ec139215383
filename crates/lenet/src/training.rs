use std::path::Path;
use std::time::Instant;

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig,
    },
    prelude::*,
    record::{CompactRecorder, RecorderError},
    tensor::backend::AutodiffBackend,
    LearningRate,
};
use derive_new::new;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    data::{ClassificationBatch, ClassificationBatcher},
    dataset::{resolve_data_dir, Cifar100Dataset, DatasetError, ImageItem, LabelKind, IMAGE_SIDE},
    logger::{install_file_logger, log_epoch, ArtifactLayout},
    model::{count_model_params, LeNet, LeNetConfig},
};

const PROGRESS_TEMPLATE: &str =
    "{prefix} [{wide_bar:.cyan/blue}] {pos}/{len} items ({eta}) {msg}";

#[derive(Config)]
pub struct TrainingConfig {
    pub model: LeNetConfig,
    pub optimizer: SgdConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 0.01)]
    pub learning_rate: f64,
    #[config(default = "LabelKind::Fine")]
    pub label_kind: LabelKind,
}

impl TrainingConfig {
    /// SGD with momentum and weight decay on the fine CIFAR-100 labels.
    pub fn cifar100() -> Self {
        let optimizer = SgdConfig::new()
            .with_momentum(Some(MomentumConfig::new().with_momentum(0.9).with_dampening(0.0)))
            .with_weight_decay(Some(WeightDecayConfig::new(5e-4)));

        Self::new(LeNetConfig::new(), optimizer)
    }
}

/// Errors that abort an epoch.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EpochError {
    #[error("The data loader of epoch {epoch} is empty")]
    EmptyDataLoader { epoch: usize },

    #[error("Loss of batch {batch} is not finite ({loss})")]
    NonFiniteLoss { batch: usize, loss: f64 },
}

/// Errors raised by [run].
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("Failed to write artifacts: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to save the model: {0}")]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Epoch(#[from] EpochError),

    #[error("CIFAR images are {expected:?} but the model expects {found:?}")]
    InputShape {
        expected: [usize; 2],
        found: [usize; 2],
    },
}

/// Metrics of a single epoch.
#[derive(new, Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    /// Zero-based epoch index.
    pub epoch: usize,
    pub train_loss: f64,
    pub test_accuracy: f64,
}

/// Result of a full [run].
#[derive(new, Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Trainable parameters of the trained model, in millions.
    pub num_params: f64,
    pub history: Vec<EpochRecord>,
}

impl RunSummary {
    /// Epoch with the highest test accuracy.
    pub fn best(&self) -> Option<&EpochRecord> {
        self.history
            .iter()
            .max_by(|a, b| a.test_accuracy.total_cmp(&b.test_accuracy))
    }
}

/// Trains the model for one epoch and returns it along with the mean batch loss.
///
/// Each batch runs forward, computes `criterion(logits, targets)`, back-propagates and applies
/// one optimizer step. Gradients are never accumulated across batches: every backward pass
/// returns a fresh set. The model lives on an autodiff backend, which is what puts layers in
/// training mode.
///
/// `epoch` is zero-based and only used for reporting.
pub fn train_model<B, O, L>(
    mut model: LeNet<B>,
    dataloader: &dyn DataLoader<ClassificationBatch<B>>,
    optim: &mut O,
    criterion: L,
    lr: LearningRate,
    epoch: usize,
) -> Result<(LeNet<B>, f64), EpochError>
where
    B: AutodiffBackend,
    O: Optimizer<LeNet<B>, B>,
    L: Fn(Tensor<B, 2>, Tensor<B, 1, Int>) -> Tensor<B, 1>,
{
    let mut train_loss = 0.0;
    let mut num_batches = 0;

    let progress = progress_bar(dataloader.num_items(), format!("Train epoch {}", epoch + 1));
    let mut iterator = dataloader.iter();

    while let Some(batch) = iterator.next() {
        let (output, _) = model.forward(batch.images);
        let loss = criterion(output, batch.targets);

        // Detached from the graph.
        let loss_value = loss.clone().into_scalar().elem::<f64>();
        if !loss_value.is_finite() {
            progress.abandon();
            return Err(EpochError::NonFiniteLoss {
                batch: num_batches,
                loss: loss_value,
            });
        }

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(lr, model, grads);

        train_loss += loss_value;
        num_batches += 1;

        log::debug!("Epoch {} batch {num_batches}: loss {loss_value:.4}", epoch + 1);
        progress.set_position(iterator.progress().items_processed as u64);
        progress.set_message(format!("loss {loss_value:.4}"));
    }

    progress.finish();

    if num_batches == 0 {
        return Err(EpochError::EmptyDataLoader { epoch });
    }

    train_loss /= num_batches as f64;
    println!(
        "[Training set] Epoch: {}, Average loss: {:.4}",
        epoch + 1,
        train_loss
    );
    log::info!("[Training set] Epoch: {}, Average loss: {:.4}", epoch + 1, train_loss);

    Ok((model, train_loss))
}

/// Measures the classification accuracy of the model, as a fraction in [0, 1].
///
/// The forward passes run on [the inner backend](AutodiffModule::valid): no gradient is tracked
/// and the given model is left untouched.
pub fn test_model<B: AutodiffBackend>(
    model: &LeNet<B>,
    dataloader: &dyn DataLoader<ClassificationBatch<B::InnerBackend>>,
    epoch: usize,
) -> Result<f64, EpochError> {
    let model = model.valid();
    let num_items = dataloader.num_items();

    if num_items == 0 {
        return Err(EpochError::EmptyDataLoader { epoch });
    }

    let correct: usize = dataloader
        .iter()
        .map(|batch| {
            let (output, _) = model.forward(batch.images);
            num_correct(output, batch.targets)
        })
        .sum();

    let test_acc = correct as f64 / num_items as f64;
    println!(
        "[Test set] Epoch: {}, Accuracy: {:.2}%\n",
        epoch + 1,
        100. * test_acc
    );
    log::info!("[Test set] Epoch: {}, Accuracy: {:.2}%", epoch + 1, 100. * test_acc);

    Ok(test_acc)
}

/// Number of rows whose arg-max matches the target.
fn num_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predictions = output.argmax(1).squeeze::<1>(1);
    let correct = predictions.equal(targets).int().sum().into_scalar();

    correct.elem::<i64>() as usize
}

fn progress_bar(num_items: usize, prefix: String) -> ProgressBar {
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());

    ProgressBar::new(num_items as u64)
        .with_style(style)
        .with_prefix(prefix)
}

fn dataloader<B: Backend>(
    batcher: ClassificationBatcher<B>,
    dataset: Cifar100Dataset,
    config: &TrainingConfig,
    shuffle: bool,
) -> std::sync::Arc<dyn DataLoader<ClassificationBatch<B>>> {
    let mut builder = DataLoaderBuilder::<ImageItem, ClassificationBatch<B>>::new(batcher)
        .batch_size(config.batch_size);

    if shuffle {
        builder = builder.shuffle(config.seed);
    }
    if config.num_workers > 0 {
        builder = builder.num_workers(config.num_workers);
    }

    builder.build(dataset)
}

/// Trains a LeNet on CIFAR-100 and evaluates it after every epoch.
///
/// `data_dir` holds `train.bin` and `test.bin`, or is the `.tar.gz` archive. The config, the
/// experiment log and the final model are written to `artifact_dir`, laid out as
/// [ArtifactLayout] describes.
///
/// CIFAR images are 32x32: any other `input_shape` is rejected before anything is written.
pub fn run<B: AutodiffBackend>(
    artifact_dir: &Path,
    data_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<RunSummary, RunError> {
    if config.model.input_shape != [IMAGE_SIDE, IMAGE_SIDE] {
        return Err(RunError::InputShape {
            expected: [IMAGE_SIDE, IMAGE_SIDE],
            found: config.model.input_shape,
        });
    }

    let layout = ArtifactLayout::new(artifact_dir);
    layout.create()?;
    install_file_logger(&layout);
    config.save(layout.config())?;

    B::seed(config.seed);

    let data_dir = resolve_data_dir(data_dir)?;
    let dataset_train = Cifar100Dataset::train(&data_dir, config.label_kind)?;
    let dataset_test = Cifar100Dataset::test(&data_dir, config.label_kind)?;

    if config.model.num_classes != config.label_kind.num_classes() {
        log::warn!(
            "The model predicts {} classes but the dataset has {} labels",
            config.model.num_classes,
            config.label_kind.num_classes()
        );
    }

    let batcher_train = ClassificationBatcher::<B>::new(device.clone(), config.model.input_shape);
    let batcher_test =
        ClassificationBatcher::<B::InnerBackend>::new(device.clone(), config.model.input_shape);

    let dataloader_train = dataloader(batcher_train, dataset_train, &config, true);
    let dataloader_test = dataloader(batcher_test, dataset_test, &config, false);

    let mut model = config.model.init::<B>(&device);
    let num_params = model.num_params() as f64 / 1_000_000.0;
    log::info!(
        "LeNet with {num_params:.6}M trainable parameters ({:.6}M for the default model)",
        count_model_params()
    );

    let mut optim = config.optimizer.init();
    let criterion = CrossEntropyLossConfig::new().init(&device);

    let now = Instant::now();
    let mut history = Vec::with_capacity(config.num_epochs);

    for epoch in 0..config.num_epochs {
        let (trained, train_loss) = train_model(
            model,
            dataloader_train.as_ref(),
            &mut optim,
            |output, targets| criterion.forward(output, targets),
            config.learning_rate,
            epoch,
        )?;
        model = trained;

        let test_accuracy = test_model(&model, dataloader_test.as_ref(), epoch)?;
        let record = EpochRecord::new(epoch, train_loss, test_accuracy);
        log_epoch(&record);
        history.push(record);
    }

    let elapsed = now.elapsed().as_secs();
    println!("Training completed in {}m{}s", (elapsed / 60), elapsed % 60);

    model.save_file(layout.model(), &CompactRecorder::new())?;

    let summary = RunSummary::new(num_params, history);
    if let Some(best) = summary.best() {
        log::info!(
            "Best accuracy {:.2}% at epoch {}",
            100. * best.test_accuracy,
            best.epoch + 1
        );
    }

    Ok(summary)
}
