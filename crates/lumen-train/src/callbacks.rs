//! Training callbacks and their argument records.
//!
//! The progress bar is always installed. Every other callback has an entry in
//! [`CallbackArgs`]: a missing entry keeps the callback with default settings,
//! an explicit `null` removes it.

use crate::args::{resolve_args, Args, ArgsInput};
use crate::checkpoint::{last_checkpoint_path, Checkpoint, CheckpointModels};
use crate::error::{TrainingError, TrainingResult};
use crate::loggers::{Metrics, TrainLogger};
use crate::model::{ModelFormat, Package};
use crate::progress::{ProgressEvent, ProgressSink, RunId};
use crate::transform::NormalizeArgs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

pub const EXPORTED_MODEL_NAME: &str = "exported_last.pt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingInterval {
    Step,
    Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearningRateMonitorArgs {
    pub logging_interval: LoggingInterval,
}

impl Default for LearningRateMonitorArgs {
    fn default() -> Self {
        Self { logging_interval: LoggingInterval::Step }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceStatsMonitorArgs {
    pub cpu_stats: bool,
}

impl Default for DeviceStatsMonitorArgs {
    fn default() -> Self {
        Self { cpu_stats: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EarlyStoppingArgs {
    pub monitor: String,
    pub patience: u64,
    pub mode: MonitorMode,
    pub min_delta: f64,
    /// Stop as soon as the monitored value is NaN or infinite.
    pub check_finite: bool,
    /// Fail when the monitored metric is missing.
    pub strict: bool,
}

impl Default for EarlyStoppingArgs {
    fn default() -> Self {
        Self {
            monitor: "train_loss".to_string(),
            // Effectively never stops on patience, only on non-finite losses.
            patience: 1_000_000_000_000,
            mode: MonitorMode::Min,
            min_delta: 0.0,
            check_finite: true,
            strict: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelExportArgs {
    pub every_n_epochs: usize,
}

impl Default for ModelExportArgs {
    fn default() -> Self {
        Self { every_n_epochs: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelCheckpointArgs {
    pub every_n_epochs: usize,
    pub save_last: bool,
}

impl Default for ModelCheckpointArgs {
    fn default() -> Self {
        Self { every_n_epochs: 1, save_last: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallbackArgs {
    pub learning_rate_monitor: Option<LearningRateMonitorArgs>,
    pub device_stats_monitor: Option<DeviceStatsMonitorArgs>,
    pub early_stopping: Option<EarlyStoppingArgs>,
    pub model_export: Option<ModelExportArgs>,
    pub model_checkpoint: Option<ModelCheckpointArgs>,
}

impl Default for CallbackArgs {
    fn default() -> Self {
        Self {
            learning_rate_monitor: Some(LearningRateMonitorArgs::default()),
            device_stats_monitor: Some(DeviceStatsMonitorArgs::default()),
            early_stopping: Some(EarlyStoppingArgs::default()),
            model_export: Some(ModelExportArgs::default()),
            model_checkpoint: Some(ModelCheckpointArgs::default()),
        }
    }
}

impl Args for CallbackArgs {
    const FIELD: &'static str = "callbacks";

    fn check(&self) -> TrainingResult<()> {
        if let Some(early_stopping) = &self.early_stopping {
            if early_stopping.monitor.trim().is_empty() {
                return Err(TrainingError::config("callbacks.early_stopping.monitor", "must not be empty"));
            }
            if early_stopping.min_delta < 0.0 {
                return Err(TrainingError::config("callbacks.early_stopping.min_delta", "must be >= 0"));
            }
        }
        if self.model_export.as_ref().is_some_and(|a| a.every_n_epochs == 0) {
            return Err(TrainingError::config("callbacks.model_export.every_n_epochs", "must be >= 1"));
        }
        if self.model_checkpoint.as_ref().is_some_and(|a| a.every_n_epochs == 0) {
            return Err(TrainingError::config("callbacks.model_checkpoint.every_n_epochs", "must be >= 1"));
        }
        Ok(())
    }
}

pub fn get_callback_args(input: Option<ArgsInput<CallbackArgs>>) -> TrainingResult<CallbackArgs> {
    resolve_args(&CallbackArgs::default(), input)
}

/// Trainer state visible to callbacks.
#[derive(Debug, Clone, Default)]
pub struct TrainStatus {
    pub epoch: usize,
    pub max_epochs: usize,
    pub global_step: u64,
    pub total_steps: u64,
    pub log_every_n_steps: u64,
    pub lr: f64,
    /// Latest value of every metric, e.g. `train_loss`.
    pub metrics: Metrics,
    pub optimizer_state: Value,
}

impl TrainStatus {
    #[must_use]
    pub fn should_log_step(&self) -> bool {
        self.log_every_n_steps > 0 && self.global_step % self.log_every_n_steps == 0
    }
}

pub struct CallbackContext<'a> {
    pub status: &'a TrainStatus,
    pub loggers: &'a [Arc<dyn TrainLogger>],
}

impl CallbackContext<'_> {
    fn log_metrics(&self, metrics: &Metrics) -> TrainingResult<()> {
        for logger in self.loggers {
            logger.log_metrics(metrics, self.status.global_step)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    ProgressBar,
    LearningRateMonitor,
    DeviceStatsMonitor,
    EarlyStopping,
    ModelExport,
    ModelCheckpoint,
}

pub trait Callback: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> CallbackKind;

    fn on_fit_start(&self, _ctx: &CallbackContext<'_>) -> TrainingResult<()> {
        Ok(())
    }

    fn on_train_batch_end(&self, _ctx: &CallbackContext<'_>) -> TrainingResult<()> {
        Ok(())
    }

    fn on_train_epoch_end(&self, _ctx: &CallbackContext<'_>) -> TrainingResult<Flow> {
        Ok(Flow::Continue)
    }

    fn on_fit_end(&self, _ctx: &CallbackContext<'_>) -> TrainingResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

pub struct ProgressBar {
    run_id: RunId,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ProgressBar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressBar").field("run_id", &self.run_id).finish_non_exhaustive()
    }
}

impl ProgressBar {
    #[must_use]
    pub fn new(run_id: RunId, sink: Arc<dyn ProgressSink>) -> Self {
        Self { run_id, sink }
    }
}

impl Callback for ProgressBar {
    fn kind(&self) -> CallbackKind {
        CallbackKind::ProgressBar
    }

    fn on_train_batch_end(&self, ctx: &CallbackContext<'_>) -> TrainingResult<()> {
        let status = ctx.status;
        self.sink.on_event(ProgressEvent::Step {
            run_id: self.run_id.clone(),
            epoch: status.epoch,
            step: status.global_step,
            total: Some(status.total_steps),
            loss: status.metrics.get("train_loss").copied(),
        });
        Ok(())
    }

    fn on_train_epoch_end(&self, ctx: &CallbackContext<'_>) -> TrainingResult<Flow> {
        let status = ctx.status;
        let loss = status.metrics.get("train_loss").map_or_else(|| "n/a".to_string(), |l| format!("{l:.4}"));
        self.sink.on_event(ProgressEvent::Message {
            run_id: self.run_id.clone(),
            message: format!("epoch {}/{} done, train_loss={loss}", status.epoch + 1, status.max_epochs),
        });
        Ok(Flow::Continue)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct LearningRateMonitor {
    args: LearningRateMonitorArgs,
}

impl LearningRateMonitor {
    fn log_lr(ctx: &CallbackContext<'_>) -> TrainingResult<()> {
        ctx.log_metrics(&Metrics::from([("lr".to_string(), ctx.status.lr)]))
    }
}

impl Callback for LearningRateMonitor {
    fn kind(&self) -> CallbackKind {
        CallbackKind::LearningRateMonitor
    }

    fn on_train_batch_end(&self, ctx: &CallbackContext<'_>) -> TrainingResult<()> {
        if self.args.logging_interval == LoggingInterval::Step && ctx.status.should_log_step() {
            Self::log_lr(ctx)?;
        }
        Ok(())
    }

    fn on_train_epoch_end(&self, ctx: &CallbackContext<'_>) -> TrainingResult<Flow> {
        if self.args.logging_interval == LoggingInterval::Epoch {
            Self::log_lr(ctx)?;
        }
        Ok(Flow::Continue)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct DeviceStatsMonitor {
    args: DeviceStatsMonitorArgs,
    epoch_start: Mutex<Option<Instant>>,
}

impl DeviceStatsMonitor {
    fn mark_start(&self) -> TrainingResult<()> {
        *self.epoch_start.lock().map_err(|_| poisoned("device stats"))? = Some(Instant::now());
        Ok(())
    }
}

impl Callback for DeviceStatsMonitor {
    fn kind(&self) -> CallbackKind {
        CallbackKind::DeviceStatsMonitor
    }

    fn on_fit_start(&self, _ctx: &CallbackContext<'_>) -> TrainingResult<()> {
        self.mark_start()
    }

    fn on_train_epoch_end(&self, ctx: &CallbackContext<'_>) -> TrainingResult<Flow> {
        let started = self.epoch_start.lock().map_err(|_| poisoned("device stats"))?.take();
        let mut stats = Metrics::new();
        if let Some(started) = started {
            stats.insert("device_stats/epoch_time_s".to_string(), started.elapsed().as_secs_f64());
        }
        if self.args.cpu_stats {
            let cpus = std::thread::available_parallelism().map_or(0, std::num::NonZero::get);
            stats.insert("device_stats/cpu_count".to_string(), cpus as f64);
        }
        ctx.log_metrics(&stats)?;
        self.mark_start()?;
        Ok(Flow::Continue)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
struct EarlyStoppingState {
    best: Option<f64>,
    wait: u64,
}

#[derive(Debug)]
pub struct EarlyStopping {
    args: EarlyStoppingArgs,
    state: Mutex<EarlyStoppingState>,
}

impl EarlyStopping {
    #[must_use]
    pub fn new(args: EarlyStoppingArgs) -> Self {
        Self { args, state: Mutex::new(EarlyStoppingState::default()) }
    }

    fn improved(&self, current: f64, best: f64) -> bool {
        match self.args.mode {
            MonitorMode::Min => current < best - self.args.min_delta,
            MonitorMode::Max => current > best + self.args.min_delta,
        }
    }
}

impl Callback for EarlyStopping {
    fn kind(&self) -> CallbackKind {
        CallbackKind::EarlyStopping
    }

    fn on_train_epoch_end(&self, ctx: &CallbackContext<'_>) -> TrainingResult<Flow> {
        let Some(current) = ctx.status.metrics.get(&self.args.monitor).copied() else {
            if self.args.strict {
                return Err(TrainingError::Trainer(format!(
                    "early stopping monitors `{}` but that metric was not logged",
                    self.args.monitor
                )));
            }
            return Ok(Flow::Continue);
        };
        if self.args.check_finite && !current.is_finite() {
            info!(monitor = %self.args.monitor, value = current, "stopping early on non-finite metric");
            return Ok(Flow::Stop);
        }

        let mut state = self.state.lock().map_err(|_| poisoned("early stopping"))?;
        match state.best {
            Some(best) if !self.improved(current, best) => {
                state.wait += 1;
                if state.wait >= self.args.patience {
                    info!(monitor = %self.args.monitor, patience = self.args.patience, "stopping early");
                    return Ok(Flow::Stop);
                }
            }
            _ => {
                state.best = Some(current);
                state.wait = 0;
            }
        }
        Ok(Flow::Continue)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct ModelExport {
    args: ModelExportArgs,
    models: CheckpointModels,
    package: Arc<dyn Package>,
    out_dir: PathBuf,
}

impl std::fmt::Debug for ModelExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelExport")
            .field("args", &self.args)
            .field("package", &self.package.name())
            .field("out_dir", &self.out_dir)
            .finish_non_exhaustive()
    }
}

impl Callback for ModelExport {
    fn kind(&self) -> CallbackKind {
        CallbackKind::ModelExport
    }

    fn on_train_epoch_end(&self, ctx: &CallbackContext<'_>) -> TrainingResult<Flow> {
        if (ctx.status.epoch + 1) % self.args.every_n_epochs == 0 {
            let out = self.out_dir.join(EXPORTED_MODEL_NAME);
            self.package.export_model(self.models.wrapped_model.as_ref(), &out, ModelFormat::PackageDefault)?;
        }
        Ok(Flow::Continue)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct ModelCheckpoint {
    args: ModelCheckpointArgs,
    models: CheckpointModels,
    normalize: NormalizeArgs,
    dirpath: PathBuf,
}

impl ModelCheckpoint {
    #[must_use]
    pub fn args(&self) -> &ModelCheckpointArgs {
        &self.args
    }

    #[must_use]
    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }
}

impl Callback for ModelCheckpoint {
    fn kind(&self) -> CallbackKind {
        CallbackKind::ModelCheckpoint
    }

    fn on_train_epoch_end(&self, ctx: &CallbackContext<'_>) -> TrainingResult<Flow> {
        let status = ctx.status;
        let periodic = (status.epoch + 1) % self.args.every_n_epochs == 0;
        if !periodic && !self.args.save_last {
            return Ok(Flow::Continue);
        }

        let checkpoint =
            Checkpoint::capture(&self.models, &self.normalize, status.epoch, status.global_step, status.optimizer_state.clone())?;
        if periodic {
            let name = format!("epoch={}-step={}.ckpt", status.epoch, status.global_step);
            checkpoint.save(&self.dirpath.join(name))?;
        }
        if self.args.save_last {
            checkpoint.save(&last_checkpoint_path(&self.dirpath))?;
        }
        debug!(epoch = status.epoch, step = status.global_step, "saved checkpoint");
        Ok(Flow::Continue)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn poisoned(what: &str) -> TrainingError {
    TrainingError::Trainer(format!("{what} callback lock poisoned"))
}

/// What callbacks need from the rest of the run.
pub struct CallbackDeps<'a> {
    pub run_id: RunId,
    pub progress: Arc<dyn ProgressSink>,
    pub models: &'a CheckpointModels,
    pub package: Arc<dyn Package>,
    pub normalize: &'a NormalizeArgs,
    pub exported_models_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
}

#[must_use]
pub fn get_callbacks(args: &CallbackArgs, deps: CallbackDeps<'_>) -> Vec<Arc<dyn Callback>> {
    let mut callbacks: Vec<Arc<dyn Callback>> = vec![Arc::new(ProgressBar::new(deps.run_id, deps.progress))];
    if let Some(lr) = &args.learning_rate_monitor {
        callbacks.push(Arc::new(LearningRateMonitor { args: lr.clone() }));
    }
    if let Some(stats) = &args.device_stats_monitor {
        callbacks.push(Arc::new(DeviceStatsMonitor { args: stats.clone(), epoch_start: Mutex::new(None) }));
    }
    if let Some(early_stopping) = &args.early_stopping {
        callbacks.push(Arc::new(EarlyStopping::new(early_stopping.clone())));
    }
    if let Some(export) = &args.model_export {
        callbacks.push(Arc::new(ModelExport {
            args: export.clone(),
            models: deps.models.clone(),
            package: deps.package,
            out_dir: deps.exported_models_dir,
        }));
    }
    if let Some(checkpoint) = &args.model_checkpoint {
        callbacks.push(Arc::new(ModelCheckpoint {
            args: checkpoint.clone(),
            models: deps.models.clone(),
            normalize: deps.normalize.clone(),
            dirpath: deps.checkpoints_dir,
        }));
    }
    callbacks
}
