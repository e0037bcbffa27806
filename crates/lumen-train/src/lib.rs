//! Lumen Train
//!
//! Orchestration for self-supervised training runs:
//! - Validating loosely typed run configs (`TrainConfig`)
//! - Resolving `auto` fields and method, optimizer, transform, logger and
//!   callback args against the dataset, model and hardware
//! - Executing a run through a pluggable `Trainer` and exporting the model
//!
//! The reference trainer and model package let a run execute end to end
//! without an external framework.

pub mod args;
pub mod artifacts;
pub mod auto;
pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod layout;
pub mod loader;
pub mod local_trainer;
pub mod loggers;
pub mod logging;
pub mod method;
pub mod model;
pub mod optim;
pub mod progress;
pub mod trainer;
pub mod transform;

pub use args::{Args, ArgsInput};
pub use artifacts::{ArtifactKind, RunArtifact, RunManifest, RunMetrics};
pub use auto::Auto;
pub use callbacks::{Callback, CallbackArgs, CallbackKind};
pub use checkpoint::{Checkpoint, CheckpointModels};
pub use config::{apply_overrides, load_config_file, validate_config, ConfigInput, TrainConfig};
pub use dataset::{DataSource, DatasetId, ImageDataset, ScalingInfo};
pub use error::{TrainingError, TrainingResult};
pub use executor::{train_from_config, RunOptions, RunReport};
pub use hardware::{Accelerator, Devices, HardwareInfo, Precision, Strategy};
pub use layout::{LocalRank, RunLayout, SyncPolicy};
pub use local_trainer::{LocalTrainer, LocalTrainerFactory};
pub use loggers::{LoggerArgs, TrainLogger};
pub use method::{MethodArgs, MethodKind};
pub use model::{EmbeddingModel, ModelSource, ModelWrapper, Module, PackageRegistry};
pub use optim::{OptimizerArgs, OptimizerType};
pub use progress::{ProgressEvent, ProgressSink, RunId, RunState, TracingProgressSink};
pub use trainer::{FitInputs, FitSummary, ResumeFrom, Trainer, TrainerFactory, TrainerSpec};
