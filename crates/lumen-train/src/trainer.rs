use crate::auto::Auto;
use crate::callbacks::Callback;
use crate::checkpoint::CheckpointModels;
use crate::error::TrainingResult;
use crate::hardware::{Accelerator, Precision, Strategy};
use crate::loader::DataLoader;
use crate::loggers::{Metrics, TrainLogger};
use crate::method::MethodInstance;
use crate::transform::NormalizeArgs;
use async_trait::async_trait;
use rand::rngs::StdRng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where `fit` starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    Fresh,
    /// Continue epoch and step counters from this checkpoint.
    Checkpoint(PathBuf),
}

/// Settings a trainer is constructed with.
#[derive(Debug, Clone, Serialize)]
pub struct TrainerSpec {
    pub out_dir: PathBuf,
    pub epochs: usize,
    pub accelerator: Accelerator,
    pub strategy: Auto<Strategy>,
    pub devices_per_node: usize,
    pub num_nodes: usize,
    pub precision: Precision,
    pub log_every_n_steps: usize,
}

/// Everything `fit` drives.
pub struct FitInputs<'a> {
    pub method: &'a MethodInstance,
    pub dataloader: &'a DataLoader,
    pub callbacks: &'a [Arc<dyn Callback>],
    pub loggers: &'a [Arc<dyn TrainLogger>],
    pub rng: &'a mut StdRng,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FitSummary {
    pub epochs_completed: usize,
    pub global_step: u64,
    pub stopped_early: bool,
    pub final_metrics: Metrics,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    /// Accelerator after the trainer applied its own defaults.
    fn accelerator(&self) -> Accelerator;

    /// Strategy after the trainer applied its own defaults.
    fn strategy(&self) -> Strategy;

    fn num_devices(&self) -> usize;

    fn num_nodes(&self) -> usize;

    async fn fit(&self, inputs: FitInputs<'_>, resume: &ResumeFrom) -> TrainingResult<FitSummary>;

    /// Write a checkpoint of `models` at the trainer's current epoch and step.
    async fn save_checkpoint(&self, path: &Path, models: &CheckpointModels, normalize: &NormalizeArgs) -> TrainingResult<()>;
}

/// Builds the trainer for a run from its spec and the raw `trainer_args`.
pub trait TrainerFactory: Send + Sync {
    fn create(&self, spec: &TrainerSpec, trainer_args: Option<&Map<String, Value>>) -> TrainingResult<Box<dyn Trainer>>;
}
