use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing_core::{Level, LevelFilter};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

use crate::training::EpochRecord;

const CONFIG_FILE: &str = "config.json";
const MODEL_FILE: &str = "model";
const LOG_FILE: &str = "experiment.log";

/// Files written by a training run, all under one artifact directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Training config, as JSON.
    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Model record; the recorder appends its own extension.
    pub fn model(&self) -> PathBuf {
        self.root.join(MODEL_FILE)
    }

    pub fn log(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    /// Empties the artifact directory, creating it when missing.
    pub fn create(&self) -> io::Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)
    }
}

/// Sends this crate's `info` records, and everything at `warn` or above, to the run's log file.
///
/// Only the first call of a process installs the logger; later calls return `false` and leave
/// the existing subscriber in place.
pub fn install_file_logger(layout: &ArtifactLayout) -> bool {
    let writer = tracing_appender::rolling::never(layout.root(), LOG_FILE);
    let targets = Targets::new()
        .with_target("lenet", Level::INFO)
        .with_default(LevelFilter::WARN);
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(targets);

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        return false;
    }

    log::info!(
        "Artifacts: config {}, model {}, log {}",
        layout.config().display(),
        layout.model().display(),
        layout.log().display()
    );
    report_panics(layout.log());

    true
}

/// Logs the metrics of a finished epoch.
pub fn log_epoch(record: &EpochRecord) {
    log::info!(
        "epoch={} train_loss={:.6} test_accuracy={:.6}",
        record.epoch + 1,
        record.train_loss,
        record.test_accuracy
    );
}

fn report_panics(log_file: PathBuf) {
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("Training aborted: {info}");
        eprintln!("Training aborted, details in '{}'", log_file.display());
        previous(info);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_live_under_root() {
        let layout = ArtifactLayout::new("/tmp/lenet-run");

        assert_eq!(layout.root(), Path::new("/tmp/lenet-run"));
        assert_eq!(layout.config(), Path::new("/tmp/lenet-run/config.json"));
        assert_eq!(layout.model(), Path::new("/tmp/lenet-run/model"));
        assert_eq!(layout.log(), Path::new("/tmp/lenet-run/experiment.log"));
    }

    #[test]
    fn create_clears_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path().join("run"));

        layout.create().unwrap();
        fs::write(layout.config(), "{}").unwrap();
        layout.create().unwrap();

        assert!(layout.root().is_dir());
        assert!(!layout.config().exists());
    }

    // The only test of this binary installing a global subscriber.
    #[test]
    fn installs_once_and_writes_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let other = ArtifactLayout::new(dir.path().join("other"));
        fs::create_dir_all(other.root()).unwrap();

        assert!(install_file_logger(&layout));
        assert!(!install_file_logger(&other));

        log_epoch(&EpochRecord::new(2, 1.5, 0.25));

        let content = fs::read_to_string(layout.log()).unwrap();
        assert!(content.contains("Artifacts: config"));
        assert!(content.contains("epoch=3 train_loss=1.500000 test_accuracy=0.250000"));
    }
}
