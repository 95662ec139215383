use std::path::PathBuf;

use anyhow::Context;
use burn::{backend::Autodiff, config::Config, data::dataset::Dataset};
use clap::{Parser, Subcommand};
use lenet::{
    count_model_params,
    dataset::{resolve_data_dir, Cifar100Dataset, LabelKind},
    inference::infer,
    logger::ArtifactLayout,
    training::{run, TrainingConfig},
};

#[cfg(not(feature = "wgpu"))]
mod backend {
    pub type Backend = burn::backend::NdArray;
    pub fn device() -> burn::backend::ndarray::NdArrayDevice {
        burn::backend::ndarray::NdArrayDevice::Cpu
    }
}

#[cfg(feature = "wgpu")]
mod backend {
    pub type Backend = burn::backend::Wgpu;
    pub fn device() -> burn::backend::wgpu::WgpuDevice {
        burn::backend::wgpu::WgpuDevice::default()
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the number of trainable parameters of the default model, in millions
    Params,
    /// Train on CIFAR-100 and evaluate after every epoch
    Train {
        /// Directory with `train.bin` and `test.bin`, or the `.tar.gz` archive
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long, default_value = "/tmp/lenet")]
        artifact_dir: PathBuf,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Train on the 20 super-classes instead of the 100 classes
        #[arg(long)]
        coarse: bool,
    },
    /// Predict test images with a trained model
    Predict {
        #[arg(long)]
        data_dir: PathBuf,
        #[arg(long, default_value = "/tmp/lenet")]
        artifact_dir: PathBuf,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Params => {
            println!("{:.6}", count_model_params());
        }
        Command::Train {
            data_dir,
            artifact_dir,
            epochs,
            batch_size,
            learning_rate,
            seed,
            coarse,
        } => {
            let mut config = TrainingConfig::cifar100();
            if let Some(epochs) = epochs {
                config = config.with_num_epochs(epochs);
            }
            if let Some(batch_size) = batch_size {
                config = config.with_batch_size(batch_size);
            }
            if let Some(learning_rate) = learning_rate {
                config = config.with_learning_rate(learning_rate);
            }
            if let Some(seed) = seed {
                config = config.with_seed(seed);
            }
            if coarse {
                config.label_kind = LabelKind::Coarse;
                config.model.num_classes = LabelKind::Coarse.num_classes();
            }

            let summary = run::<Autodiff<backend::Backend>>(
                &artifact_dir,
                &data_dir,
                config,
                backend::device(),
            )
            .context("Training failed")?;

            if let Some(best) = summary.best() {
                println!(
                    "Best accuracy: {:.2}% (epoch {})",
                    100. * best.test_accuracy,
                    best.epoch + 1
                );
            }
        }
        Command::Predict {
            data_dir,
            artifact_dir,
            count,
        } => {
            let config = TrainingConfig::load(ArtifactLayout::new(&artifact_dir).config())
                .context("No trained model found, run `train` first")?;
            let data_dir = resolve_data_dir(&data_dir)?;
            let dataset = Cifar100Dataset::test(&data_dir, config.label_kind)?;

            let items = (0..count.min(dataset.len()))
                .filter_map(|index| dataset.get(index))
                .collect();
            let predictions = infer::<backend::Backend>(&artifact_dir, backend::device(), items)?;

            for (index, prediction) in predictions.iter().enumerate() {
                println!(
                    "#{index}: predicted {} expected {}",
                    prediction.predicted, prediction.expected
                );
            }
            let correct = predictions.iter().filter(|p| p.is_correct()).count();
            println!("{correct}/{} correct", predictions.len());
        }
    }

    Ok(())
}
