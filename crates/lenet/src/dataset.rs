use std::fs::{self, File};
use std::path::{Path, PathBuf};

use burn::data::dataset::{Dataset, InMemDataset};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

/// Image height and width of CIFAR images.
pub const IMAGE_SIDE: usize = 32;

/// Number of bytes of a single CIFAR image (3 channels of 32x32).
pub const IMAGE_BYTES: usize = 3 * IMAGE_SIDE * IMAGE_SIDE;

/// A CIFAR-100 record: coarse label, fine label, then the image.
const RECORD_BYTES: usize = 2 + IMAGE_BYTES;

const TRAIN_FILE: &str = "train.bin";
const TEST_FILE: &str = "test.bin";

/// Directory created when unpacking the official binary archive.
const ARCHIVE_DIR: &str = "cifar-100-binary";

/// Image classification item.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ImageItem {
    /// Pixels in channel-major order (all red, then green, then blue values).
    pub image: Vec<u8>,

    /// Class of the image.
    pub label: u8,
}

/// Which CIFAR-100 label to use as the target.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelKind {
    /// 100 fine-grained classes.
    #[default]
    Fine,
    /// 20 super-classes.
    Coarse,
}

impl LabelKind {
    /// Number of distinct labels.
    pub fn num_classes(&self) -> usize {
        match self {
            LabelKind::Fine => 100,
            LabelKind::Coarse => 20,
        }
    }
}

/// Errors raised while loading a dataset from disk.
#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dataset file is {len} bytes, which is not a multiple of the {record} bytes record")]
    Truncated { len: usize, record: usize },

    #[error("Dataset split not found at '{0}'")]
    MissingSplit(PathBuf),
}

/// The CIFAR-100 dataset: 60,000 32x32 colour images in 100 classes grouped into 20
/// super-classes. There are 50,000 training images and 10,000 test images.
///
/// Reads the official binary version (`train.bin` / `test.bin`). The whole split is kept in
/// memory (150MB for the training split).
pub struct Cifar100Dataset {
    dataset: InMemDataset<ImageItem>,
}

impl Dataset<ImageItem> for Cifar100Dataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl Cifar100Dataset {
    /// Creates the train dataset from the directory holding `train.bin`.
    pub fn train<P: AsRef<Path>>(root: P, labels: LabelKind) -> Result<Self, DatasetError> {
        Self::read(root.as_ref().join(TRAIN_FILE), labels)
    }

    /// Creates the test dataset from the directory holding `test.bin`.
    pub fn test<P: AsRef<Path>>(root: P, labels: LabelKind) -> Result<Self, DatasetError> {
        Self::read(root.as_ref().join(TEST_FILE), labels)
    }

    fn read(file: PathBuf, labels: LabelKind) -> Result<Self, DatasetError> {
        if !file.is_file() {
            return Err(DatasetError::MissingSplit(file));
        }

        let bytes = fs::read(&file)?;
        let dataset = Self::from_bytes(&bytes, labels)?;
        log::info!("Loaded {} images from {}", dataset.len(), file.display());

        Ok(dataset)
    }

    /// Parses consecutive binary records.
    pub fn from_bytes(bytes: &[u8], labels: LabelKind) -> Result<Self, DatasetError> {
        if bytes.len() % RECORD_BYTES != 0 {
            return Err(DatasetError::Truncated {
                len: bytes.len(),
                record: RECORD_BYTES,
            });
        }

        let items = bytes
            .chunks_exact(RECORD_BYTES)
            .map(|record| ImageItem {
                label: match labels {
                    LabelKind::Coarse => record[0],
                    LabelKind::Fine => record[1],
                },
                image: record[2..].to_vec(),
            })
            .collect();

        Ok(Self {
            dataset: InMemDataset::new(items),
        })
    }
}

/// Unpacks `cifar-100-binary.tar.gz` into `dest` and returns the directory holding the split
/// files. Already extracted archives are not unpacked again.
pub fn extract_archive<P: AsRef<Path>, Q: AsRef<Path>>(
    archive: P,
    dest: Q,
) -> Result<PathBuf, DatasetError> {
    let root = dest.as_ref().join(ARCHIVE_DIR);

    if root.join(TRAIN_FILE).is_file() && root.join(TEST_FILE).is_file() {
        return Ok(root);
    }

    fs::create_dir_all(dest.as_ref())?;
    log::info!(
        "Extracting {} to {}",
        archive.as_ref().display(),
        dest.as_ref().display()
    );

    let gz = GzDecoder::new(File::open(archive.as_ref())?);
    tar::Archive::new(gz).unpack(dest.as_ref())?;

    if !root.is_dir() {
        return Err(DatasetError::MissingSplit(root));
    }

    Ok(root)
}

/// Resolves a data location to a directory with the split files.
///
/// Archives (`.tar.gz`, `.tgz`) are extracted next to themselves.
pub fn resolve_data_dir<P: AsRef<Path>>(path: P) -> Result<PathBuf, DatasetError> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();

    if path.is_file() && (name.ends_with(".tar.gz") || name.ends_with(".tgz")) {
        // A bare file name has an empty parent.
        let dest = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        return extract_archive(path, dest);
    }

    if path.join(ARCHIVE_DIR).join(TRAIN_FILE).is_file() {
        return Ok(path.join(ARCHIVE_DIR));
    }

    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(coarse: u8, fine: u8, pixel: u8) -> Vec<u8> {
        let mut record = vec![coarse, fine];
        record.extend(std::iter::repeat(pixel).take(IMAGE_BYTES));
        record
    }

    #[test]
    fn parses_fine_and_coarse_labels() {
        let bytes = [record(3, 42, 7), record(19, 99, 200)].concat();

        let fine = Cifar100Dataset::from_bytes(&bytes, LabelKind::Fine).unwrap();
        let coarse = Cifar100Dataset::from_bytes(&bytes, LabelKind::Coarse).unwrap();

        assert_eq!(fine.len(), 2);
        assert_eq!(fine.get(0).unwrap().label, 42);
        assert_eq!(fine.get(1).unwrap().label, 99);
        assert_eq!(coarse.get(0).unwrap().label, 3);
        assert_eq!(coarse.get(1).unwrap().label, 19);

        let item = fine.get(1).unwrap();
        assert_eq!(item.image.len(), IMAGE_BYTES);
        assert!(item.image.iter().all(|pixel| *pixel == 200));
        assert!(fine.get(2).is_none());
    }

    #[test]
    fn rejects_partial_records() {
        let mut bytes = record(0, 0, 0);
        bytes.pop();

        let result = Cifar100Dataset::from_bytes(&bytes, LabelKind::Fine);

        assert!(matches!(
            result,
            Err(DatasetError::Truncated { len, record }) if len == RECORD_BYTES - 1 && record == RECORD_BYTES
        ));
    }

    #[test]
    fn missing_split_is_reported() {
        let dir = tempfile::tempdir().unwrap();

        let result = Cifar100Dataset::test(dir.path(), LabelKind::Fine);

        assert!(matches!(result, Err(DatasetError::MissingSplit(path)) if path.ends_with(TEST_FILE)));
    }

    #[test]
    fn reads_splits_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join(TRAIN_FILE)).unwrap();
        file.write_all(&[record(1, 2, 3), record(4, 5, 6), record(7, 8, 9)].concat())
            .unwrap();

        let dataset = Cifar100Dataset::train(dir.path(), LabelKind::Fine).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.get(2).unwrap().label, 8);
    }

    fn write_archive(archive_path: &Path) {
        let encoder = flate2::write::GzEncoder::new(
            File::create(archive_path).unwrap(),
            flate2::Compression::fast(),
        );
        let mut builder = tar::Builder::new(encoder);
        for (name, bytes) in [
            (TRAIN_FILE, [record(1, 10, 0), record(2, 20, 0)].concat()),
            (TEST_FILE, record(3, 30, 0)),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{ARCHIVE_DIR}/{name}"), bytes.as_slice())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extracts_archive_once() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("cifar-100-binary.tar.gz");
        write_archive(&archive_path);

        let root = resolve_data_dir(&archive_path).unwrap();
        assert_eq!(root, dir.path().join(ARCHIVE_DIR));
        assert_eq!(Cifar100Dataset::train(&root, LabelKind::Fine).unwrap().len(), 2);
        assert_eq!(Cifar100Dataset::test(&root, LabelKind::Fine).unwrap().get(0).unwrap().label, 30);

        // Already extracted: the parent directory resolves to the same root.
        assert_eq!(resolve_data_dir(dir.path()).unwrap(), root);
        assert_eq!(extract_archive(&archive_path, dir.path()).unwrap(), root);
    }

    #[test]
    fn extracts_archive_given_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        write_archive(&dir.path().join("cifar-100-binary.tar.gz"));

        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let result = resolve_data_dir("cifar-100-binary.tar.gz");
        std::env::set_current_dir(previous).unwrap();

        let root = result.unwrap();
        assert_eq!(root, Path::new(".").join(ARCHIVE_DIR));
        assert!(dir.path().join(ARCHIVE_DIR).join(TRAIN_FILE).is_file());
        assert!(dir.path().join(ARCHIVE_DIR).join(TEST_FILE).is_file());
    }

    #[test]
    fn label_kind_cardinality() {
        assert_eq!(LabelKind::default(), LabelKind::Fine);
        assert_eq!(LabelKind::Fine.num_classes(), 100);
        assert_eq!(LabelKind::Coarse.num_classes(), 20);
    }
}
