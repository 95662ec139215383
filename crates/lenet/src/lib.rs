//! LeNet image classifier for CIFAR-100, trained with a hand-written epoch loop.

pub mod data;
pub mod dataset;
pub mod inference;
pub mod logger;
pub mod model;
pub mod training;

pub use model::{count_model_params, LeNet, LeNetConfig, ShapeTrace};
pub use training::{run, test_model, train_model, TrainingConfig};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
