//! Batch sizing and the dataloader.

use crate::args::{Args, ArgsInput};
use crate::dataset::{DatasetItem, ImageDataset};
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Upper bound on the logging interval in steps.
pub const MAX_LOG_EVERY_N_STEPS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderArgs {
    /// Per-device batch size. Overrides the top-level global batch size.
    pub batch_size: Option<usize>,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl Default for LoaderArgs {
    fn default() -> Self {
        Self { batch_size: None, shuffle: true, drop_last: true }
    }
}

impl Args for LoaderArgs {
    const FIELD: &'static str = "loader_args";

    fn check(&self) -> TrainingResult<()> {
        if self.batch_size == Some(0) {
            return Err(TrainingError::config("loader_args.batch_size", "must be >= 1"));
        }
        Ok(())
    }
}

pub fn get_loader_args(input: Option<ArgsInput<LoaderArgs>>) -> TrainingResult<LoaderArgs> {
    crate::args::resolve_args(&LoaderArgs::default(), input)
}

/// Steps between metric logs: one epoch, capped at [`MAX_LOG_EVERY_N_STEPS`].
pub fn get_logging_interval(dataset_size: usize, batch_size: usize) -> TrainingResult<usize> {
    if dataset_size == 0 {
        return Err(TrainingError::resolution("cannot derive a logging interval for an empty dataset"));
    }
    if batch_size == 0 {
        return Err(TrainingError::config("batch_size", "must be >= 1"));
    }
    Ok((dataset_size / batch_size).clamp(1, MAX_LOG_EVERY_N_STEPS))
}

/// Global batch size across all devices.
///
/// A per-device `loader_args.batch_size` wins over `batch_size`. A dataset
/// smaller than the batch shrinks it to the largest multiple of the device
/// count that still fits.
pub fn get_global_batch_size(
    batch_size: usize,
    loader_args: &LoaderArgs,
    dataset_size: usize,
    total_num_devices: usize,
) -> TrainingResult<usize> {
    if total_num_devices == 0 {
        return Err(TrainingError::resolution("total number of devices must be >= 1"));
    }
    let mut global = match loader_args.batch_size {
        Some(per_device) => per_device
            .checked_mul(total_num_devices)
            .ok_or_else(|| TrainingError::resolution("global batch size overflows"))?,
        None => batch_size,
    };
    if global == 0 {
        return Err(TrainingError::config("batch_size", "must be >= 1"));
    }

    if dataset_size < global {
        let shrunk = dataset_size - dataset_size % total_num_devices;
        if shrunk == 0 {
            return Err(TrainingError::resolution(format!(
                "dataset has {dataset_size} images, fewer than the {total_num_devices} devices in use"
            )));
        }
        warn!(
            dataset_size,
            requested = global,
            batch_size = shrunk,
            "dataset is smaller than the batch size, reducing the batch size"
        );
        global = shrunk;
    }

    if global % total_num_devices != 0 {
        return Err(TrainingError::resolution(format!(
            "batch size {global} must be divisible by the total number of devices ({total_num_devices})"
        )));
    }
    Ok(global)
}

/// A batch of dataset indices for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub indices: Vec<usize>,
}

/// Iterates the dataset in per-device batches.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<ImageDataset>,
    batch_size: usize,
    num_workers: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<ImageDataset>,
        global_batch_size: usize,
        total_num_devices: usize,
        num_workers: usize,
        loader_args: &LoaderArgs,
        seed: u64,
    ) -> TrainingResult<Self> {
        if total_num_devices == 0 || global_batch_size % total_num_devices != 0 {
            return Err(TrainingError::resolution(format!(
                "batch size {global_batch_size} is not divisible by {total_num_devices} devices"
            )));
        }
        Ok(Self {
            dataset,
            batch_size: global_batch_size / total_num_devices,
            num_workers,
            shuffle: loader_args.shuffle,
            drop_last: loader_args.drop_last,
            seed,
        })
    }

    #[must_use]
    pub fn dataset(&self) -> &Arc<ImageDataset> {
        &self.dataset
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    #[must_use]
    pub fn num_batches(&self) -> usize {
        let len = self.dataset.len();
        if self.drop_last { len / self.batch_size } else { len.div_ceil(self.batch_size) }
    }

    /// Batches for `epoch`. Shuffling is seeded by the run seed and the epoch.
    #[must_use]
    pub fn batches(&self, epoch: usize) -> Vec<Batch> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == self.batch_size)
            .map(|chunk| Batch { indices: chunk.to_vec() })
            .collect()
    }

    pub fn load(&self, batch: &Batch) -> TrainingResult<Vec<DatasetItem>> {
        batch.indices.iter().map(|&i| self.dataset.get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::TempIndexFile;
    use crate::method::MethodKind;
    use crate::transform::{get_transform_args, MethodTransform};
    use std::path::PathBuf;

    #[test]
    fn test_logging_interval() {
        assert_eq!(get_logging_interval(10, 20).unwrap(), 1);
        assert_eq!(get_logging_interval(100, 10).unwrap(), 10);
        assert_eq!(get_logging_interval(100_000, 10).unwrap(), MAX_LOG_EVERY_N_STEPS);
        assert!(get_logging_interval(0, 10).is_err());
    }

    #[test]
    fn test_global_batch_size_from_per_device() {
        let args = LoaderArgs { batch_size: Some(16), ..LoaderArgs::default() };
        assert_eq!(get_global_batch_size(128, &args, 1000, 4).unwrap(), 64);
    }

    #[test]
    fn test_global_batch_size_shrinks_for_small_dataset() {
        assert_eq!(get_global_batch_size(128, &LoaderArgs::default(), 10, 4).unwrap(), 8);
        assert_eq!(get_global_batch_size(128, &LoaderArgs::default(), 10, 1).unwrap(), 10);
        assert!(get_global_batch_size(128, &LoaderArgs::default(), 3, 4).unwrap_err().is_resolution());
    }

    #[test]
    fn test_global_batch_size_must_divide() {
        let err = get_global_batch_size(30, &LoaderArgs::default(), 1000, 4).unwrap_err();
        assert!(err.is_resolution());
    }

    #[test]
    fn test_unknown_loader_key_rejected() {
        let mut map = serde_json::Map::new();
        map.insert("prefetch".to_string(), serde_json::json!(2));
        assert!(get_loader_args(Some(ArgsInput::Partial(map))).unwrap_err().is_config_validation());
    }

    #[test]
    fn test_batches_are_seeded_and_drop_last() {
        let paths: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("/{i}.png"))).collect();
        let index = TempIndexFile::create(&paths).unwrap();
        let transform = MethodTransform::new(MethodKind::Simclr, get_transform_args(MethodKind::Simclr, None).unwrap());
        let dataset = Arc::new(ImageDataset::new(index.path(), transform).unwrap());
        let loader = DataLoader::new(dataset, 8, 2, 0, &LoaderArgs::default(), 3).unwrap();

        assert_eq!(loader.batch_size(), 4);
        assert_eq!(loader.num_batches(), 2);
        let epoch0 = loader.batches(0);
        assert_eq!(epoch0.len(), 2);
        assert_eq!(epoch0, loader.batches(0));
        assert_eq!(loader.load(&epoch0[0]).unwrap().len(), 4);
    }
}
