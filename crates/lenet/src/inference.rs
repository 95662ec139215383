use std::path::Path;

use burn::{
    config::ConfigError,
    data::dataloader::batcher::Batcher,
    prelude::*,
    record::{CompactRecorder, Recorder, RecorderError},
};

use crate::{
    data::ClassificationBatcher,
    dataset::ImageItem,
    logger::ArtifactLayout,
    model::{LeNet, LeNetRecord},
    training::TrainingConfig,
};

#[derive(thiserror::Error, Debug)]
pub enum InferenceError {
    #[error("Failed to load the training config: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to load the trained model: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Failed to read predictions: {0}")]
    Data(String),
}

/// Predicted class of an item, next to its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub predicted: usize,
    pub expected: usize,
}

impl Prediction {
    pub fn is_correct(&self) -> bool {
        self.predicted == self.expected
    }
}

/// Loads the model trained in `artifact_dir`.
pub fn load_model<B: Backend>(
    artifact_dir: &Path,
    device: &B::Device,
) -> Result<(TrainingConfig, LeNet<B>), InferenceError> {
    let layout = ArtifactLayout::new(artifact_dir);
    let config = TrainingConfig::load(layout.config())?;
    let record: LeNetRecord<B> = CompactRecorder::new().load(layout.model(), device)?;

    let model = config.model.init::<B>(device).load_record(record);

    Ok((config, model))
}

/// Predicts the class of every item with the model trained in `artifact_dir`.
pub fn infer<B: Backend>(
    artifact_dir: &Path,
    device: B::Device,
    items: Vec<ImageItem>,
) -> Result<Vec<Prediction>, InferenceError> {
    let (config, model) = load_model::<B>(artifact_dir, &device)?;

    if items.is_empty() {
        return Ok(Vec::new());
    }

    let expected: Vec<usize> = items.iter().map(|item| item.label as usize).collect();
    let batcher = ClassificationBatcher::<B>::new(device, config.model.input_shape);
    let batch = batcher.batch(items);

    let (output, _) = model.forward(batch.images);
    let predicted = output
        .argmax(1)
        .squeeze::<1>(1)
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| InferenceError::Data(format!("{err:?}")))?;

    Ok(predicted
        .into_iter()
        .zip(expected)
        .map(|(predicted, expected)| Prediction {
            predicted: predicted as usize,
            expected,
        })
        .collect())
}
