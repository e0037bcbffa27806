//! Run executor.
//!
//! Validates the config, walks the resolver chain in dependency order,
//! calls the trainer's `fit` and exports the result. Each resolved value
//! replaces its unresolved counterpart in the `TrainConfig`, so the config
//! returned in the [`RunReport`] is fully resolved and validating it again
//! is a no-op.

use crate::args::ArgsInput;
use crate::artifacts::{make_artifact, ArtifactKind, RunManifest, RunMetrics};
use crate::auto::Auto;
use crate::callbacks::{get_callback_args, get_callbacks, CallbackDeps};
use crate::checkpoint::{load_checkpoint_weights, resolve_checkpoint_source, CheckpointModels};
use crate::config::{validate_config, ConfigInput, TrainConfig};
use crate::dataset::{get_scaling_info, list_image_files, DatasetId, ImageDataset, TempIndexFile};
use crate::error::{TrainingError, TrainingResult};
use crate::hardware::{
    get_system_information, log_system_information, resolve_accelerator, resolve_devices_per_node, resolve_num_workers,
    resolve_strategy, total_num_devices, Devices, HardwareInfo,
};
use crate::layout::{prepare_out_dir, LocalRank, OutDirSync, RunLayout, SyncPolicy};
use crate::loader::{get_global_batch_size, get_loader_args, get_logging_interval, DataLoader};
use crate::local_trainer::LocalTrainerFactory;
use crate::loggers::{get_logger_args, get_loggers};
use crate::logging::{pretty_format_args, run_dispatch};
use crate::method::{get_method_args, MethodArgsContext, MethodInstance, MethodKind};
use crate::model::{EmbeddingModel, ModelFormat, PackageRegistry};
use crate::optim::get_optimizer_args;
use crate::progress::{ProgressEvent, ProgressSink, RunId, RunState, TracingProgressSink};
use crate::trainer::{FitInputs, FitSummary, ResumeFrom, Trainer, TrainerFactory, TrainerSpec};
use crate::transform::{get_transform_args, MethodTransform, NormalizeArgs};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing::instrument::WithSubscriber;

/// Environment a run executes in.
#[derive(Clone)]
pub struct RunOptions {
    pub hardware: HardwareInfo,
    pub registry: PackageRegistry,
    pub trainer_factory: Arc<dyn TrainerFactory>,
    pub progress: Arc<dyn ProgressSink>,
    /// `EnvFilter` directive for the run's log output.
    pub log_filter: String,
    /// Also log to stderr, not only to `out/train.log`.
    pub log_to_console: bool,
    pub local_rank: LocalRank,
    pub sync_policy: SyncPolicy,
    /// Directory for the temporary dataset index. Defaults to the system temp dir.
    pub index_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            hardware: HardwareInfo::detect(),
            registry: PackageRegistry::default(),
            trainer_factory: Arc::new(LocalTrainerFactory),
            progress: Arc::new(TracingProgressSink),
            log_filter: "info".to_string(),
            log_to_console: true,
            local_rank: LocalRank::default(),
            sync_policy: SyncPolicy::default(),
            index_dir: None,
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    pub out_dir: PathBuf,
    pub exported_model: PathBuf,
    /// Fully resolved config as JSON.
    pub config: Value,
    pub summary: FitSummary,
    /// `None` when the manifest could not be written. The run still succeeded.
    pub manifest: Option<RunManifest>,
}

/// Emits `RunState` transitions and refuses illegal ones.
struct RunStateTracker {
    run_id: RunId,
    sink: Arc<dyn ProgressSink>,
    state: RunState,
}

impl RunStateTracker {
    fn new(run_id: RunId, sink: Arc<dyn ProgressSink>) -> Self {
        Self { run_id, sink, state: RunState::Unvalidated }
    }

    fn advance(&mut self, next: RunState) -> TrainingResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TrainingError::Other(anyhow::anyhow!("illegal run state transition {} -> {next}", self.state)));
        }
        self.state = next;
        self.sink.on_event(ProgressEvent::State { run_id: self.run_id.clone(), state: next });
        Ok(())
    }

    fn fail(&mut self, error: &TrainingError) {
        if self.state.can_transition_to(RunState::Failed) {
            self.sink.on_event(ProgressEvent::Message { run_id: self.run_id.clone(), message: error.to_string() });
            self.state = RunState::Failed;
            self.sink.on_event(ProgressEvent::State { run_id: self.run_id.clone(), state: RunState::Failed });
        }
    }
}

/// Validate `input`, resolve it and run training to completion.
///
/// The temporary dataset index is removed on every exit path. The final
/// model is always exported to `out/exported_models/exported_last.pt`, and
/// the export completes the run. The `training_manifest.json` written after
/// it is best effort.
pub async fn train_from_config(input: impl Into<ConfigInput>, options: RunOptions) -> TrainingResult<RunReport> {
    let mut tracker = RunStateTracker::new(RunId::new(), options.progress.clone());
    let result = run(input.into(), &options, &mut tracker).await;
    if let Err(e) = &result {
        tracker.fail(e);
    }
    result
}

async fn run(input: ConfigInput, options: &RunOptions, tracker: &mut RunStateTracker) -> TrainingResult<RunReport> {
    let config = validate_config(input)?;
    tracker.advance(RunState::Validated)?;

    let layout = prepare_out_dir(&config.out, config.resume, config.overwrite, options.local_rank)?;
    let dispatch = run_dispatch(&layout.train_log_path(), &options.log_filter, options.log_to_console)?;
    execute(config, layout, options, tracker).with_subscriber(dispatch).await
}

/// What survives the resolution scope once the dataset is gone.
struct Fitted {
    trainer: Box<dyn Trainer>,
    models: CheckpointModels,
    normalize: NormalizeArgs,
    method: MethodKind,
    dataset_id: DatasetId,
    summary: FitSummary,
}

async fn execute(
    mut config: TrainConfig,
    layout: RunLayout,
    options: &RunOptions,
    tracker: &mut RunStateTracker,
) -> TrainingResult<RunReport> {
    tracker.advance(RunState::Resolving)?;
    info!("args:\n{}", pretty_format_args(&config.to_value()?));
    info!(out = %layout.root().display(), "using output directory");
    log_system_information(&get_system_information(&options.hardware));

    let mut rng = StdRng::seed_from_u64(config.seed);
    let method = config.method_kind()?;
    let transform_args = get_transform_args(method, config.transform_args.take())?;
    config.transform_args = Some(ArgsInput::Typed(transform_args.clone()));
    let transform = MethodTransform::new(method, transform_args);

    let _sync = OutDirSync::acquire(&layout, options.local_rank, options.sync_policy).await?;
    let image_paths = list_image_files(&config.data)?;
    let index = match &options.index_dir {
        Some(dir) => TempIndexFile::create_in(dir, &image_paths)?,
        None => TempIndexFile::create(&image_paths)?,
    };
    let fitted = resolve_and_fit(&mut config, &layout, options, tracker, transform, index.path(), &mut rng).await;
    // Release before looking at the fit result so a failure still removes the index.
    let released = index.release();
    let fitted = match fitted {
        Ok(fitted) => fitted,
        Err(e) => {
            if let Err(release_error) = &released {
                warn!(error = %release_error, "failed to release dataset index after a failed run");
            }
            return Err(e);
        }
    };
    released?;

    if config.epochs == 0 {
        fitted.trainer.save_checkpoint(&layout.last_checkpoint_path(), &fitted.models, &fitted.normalize).await?;
    }

    let wrapped_model = fitted.models.wrapped_model.as_ref();
    let package = options.registry.get_package_from_model(wrapped_model, true)?;
    let exported_model = layout.exported_model_path();
    package.export_model(wrapped_model, &exported_model, ModelFormat::PackageDefault)?;
    info!(path = %exported_model.display(), package = package.name(), "exported model");

    let resolved = config.to_value()?;
    tracker.advance(RunState::Exported)?;
    let manifest = match write_manifest(&layout, &config, &fitted, tracker.run_id.clone()) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!(error = %e, "failed to write training manifest");
            None
        }
    };

    Ok(RunReport {
        run_id: tracker.run_id.clone(),
        state: tracker.state,
        out_dir: layout.root().to_path_buf(),
        exported_model,
        config: resolved,
        summary: fitted.summary,
        manifest,
    })
}

async fn resolve_and_fit(
    config: &mut TrainConfig,
    layout: &RunLayout,
    options: &RunOptions,
    tracker: &mut RunStateTracker,
    transform: MethodTransform,
    index_path: &Path,
    rng: &mut StdRng,
) -> TrainingResult<Fitted> {
    let method = transform.method();
    let dataset = Arc::new(ImageDataset::new(index_path, transform)?);
    let scaling = get_scaling_info(&dataset, config.epochs);
    info!(dataset_size = scaling.dataset_size, epochs = scaling.epochs, "scaling info");

    let wrapped_model = options.registry.get_wrapped_model(&config.model, config.model_args.as_ref())?;
    let embedding_model = Arc::new(EmbeddingModel::new(wrapped_model.clone(), config.embed_dim)?);
    let log_every_n_steps = get_logging_interval(scaling.dataset_size, config.batch_size)?;

    let logger_args = get_logger_args(config.loggers.take())?;
    let loggers = get_loggers(&logger_args, layout.root())?;
    config.loggers = Some(ArgsInput::Typed(logger_args));

    let models = CheckpointModels { wrapped_model: wrapped_model.clone(), embedding_model: embedding_model.clone() };
    let normalize = dataset.transform().normalize().clone();
    let callback_args = get_callback_args(config.callbacks.take())?;
    let callbacks = get_callbacks(
        &callback_args,
        CallbackDeps {
            run_id: tracker.run_id.clone(),
            progress: options.progress.clone(),
            models: &models,
            package: options.registry.get_package_from_model(wrapped_model.as_ref(), true)?,
            normalize: &normalize,
            exported_models_dir: layout.exported_models_dir(),
            checkpoints_dir: layout.checkpoints_dir(),
        },
    );
    config.callbacks = Some(ArgsInput::Typed(callback_args));

    let accelerator = resolve_accelerator(&config.accelerator, &options.hardware)?;
    let devices_per_node = resolve_devices_per_node(&config.devices, accelerator, &options.hardware)?;
    let strategy = resolve_strategy(&config.strategy, devices_per_node, config.num_nodes);
    let spec = TrainerSpec {
        out_dir: layout.root().to_path_buf(),
        epochs: config.epochs,
        accelerator,
        strategy,
        devices_per_node,
        num_nodes: config.num_nodes,
        precision: config.precision,
        log_every_n_steps,
    };
    let trainer = options.trainer_factory.create(&spec, config.trainer_args.as_ref())?;
    // The trainer may apply its own defaults, read them back.
    config.accelerator = Auto::Explicit(trainer.accelerator());
    config.strategy = Auto::Explicit(trainer.strategy());
    if config.devices.is_auto() {
        config.devices = Auto::Explicit(Devices::Count(trainer.num_devices()));
    }
    info!(
        trainer = trainer.id(),
        accelerator = %trainer.accelerator(),
        strategy = %trainer.strategy(),
        devices = trainer.num_devices(),
        nodes = trainer.num_nodes(),
        "created trainer"
    );

    let total_devices = total_num_devices(trainer.num_nodes(), trainer.num_devices())?;
    let loader_args = get_loader_args(config.loader_args.take())?;
    let global_batch_size = get_global_batch_size(config.batch_size, &loader_args, scaling.dataset_size, total_devices)?;
    config.batch_size = global_batch_size;
    let num_workers = resolve_num_workers(&config.num_workers, options.hardware.cpu_count, trainer.num_devices());
    config.num_workers = Auto::Explicit(num_workers);
    let dataloader =
        DataLoader::new(dataset.clone(), global_batch_size, total_devices, num_workers, &loader_args, config.seed)?;
    config.loader_args = Some(ArgsInput::Typed(loader_args));

    let optimizer_args = get_optimizer_args(&config.optim, config.optim_args.take(), method)?;
    config.optim = Auto::Explicit(optimizer_args.optimizer_type());
    config.optim_args = Some(ArgsInput::Typed(optimizer_args.clone()));

    let context = MethodArgsContext {
        scaling: &scaling,
        optimizer: &optimizer_args,
        feature_dim: wrapped_model.feature_dim(),
        embed_dim: embedding_model.embed_dim(),
    };
    let method_args = get_method_args(method, config.method_args.take(), &context)?;
    config.method_args = Some(ArgsInput::Typed(method_args.clone()));
    let method_instance = MethodInstance::new(
        method_args,
        optimizer_args,
        embedding_model,
        global_batch_size,
        dataset.transform().num_views(),
    )?;

    let checkpoint_source =
        resolve_checkpoint_source(&layout.checkpoints_dir(), config.resume, config.checkpoint.as_deref())?;
    if let Some(path) = &checkpoint_source {
        load_checkpoint_weights(path, &models)?;
    }
    let resume = match checkpoint_source {
        Some(path) if config.resume => ResumeFrom::Checkpoint(path),
        _ => ResumeFrom::Fresh,
    };

    let resolved = config.to_value()?;
    info!("resolved config:\n{}", pretty_format_args(&resolved));
    for logger in &loggers {
        logger.log_hyperparams(&resolved)?;
    }

    tracker.advance(RunState::Ready)?;
    tracker.advance(RunState::Fitting)?;
    let inputs = FitInputs { method: &method_instance, dataloader: &dataloader, callbacks: &callbacks, loggers: &loggers, rng };
    let summary = trainer.fit(inputs, &resume).await?;
    info!(
        epochs = summary.epochs_completed,
        steps = summary.global_step,
        stopped_early = summary.stopped_early,
        "training finished"
    );

    Ok(Fitted { trainer, models, normalize, method, dataset_id: dataset.id().clone(), summary })
}

fn write_manifest(layout: &RunLayout, config: &TrainConfig, fitted: &Fitted, run_id: RunId) -> TrainingResult<RunManifest> {
    let mut artifacts = vec![make_artifact(ArtifactKind::ExportedModel, layout.exported_model_path())?];
    if layout.last_checkpoint_path().is_file() {
        artifacts.push(make_artifact(ArtifactKind::Checkpoint, layout.last_checkpoint_path())?);
    }
    if layout.train_log_path().is_file() {
        artifacts.push(make_artifact(ArtifactKind::TrainLog, layout.train_log_path())?);
    }
    let manifest = RunManifest {
        run_id,
        created_at: Utc::now(),
        method: fitted.method,
        model: config.model.describe(),
        dataset_id: fitted.dataset_id.clone(),
        metrics: RunMetrics::from(&fitted.summary),
        artifacts,
    };
    manifest.write(&layout.manifest_path())?;
    Ok(manifest)
}
