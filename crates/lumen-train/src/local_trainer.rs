//! Single-process reference trainer.
//!
//! Walks the dataloader, drives callbacks and loggers, honours early stopping
//! and resume. It computes a loss through the method but never updates
//! weights; frameworks that do real optimisation plug in through
//! [`TrainerFactory`].

use crate::args::{resolve_args, Args, ArgsInput};
use crate::auto::Auto;
use crate::callbacks::{CallbackContext, Flow, TrainStatus};
use crate::checkpoint::{Checkpoint, CheckpointModels};
use crate::error::{TrainingError, TrainingResult};
use crate::hardware::{Accelerator, Strategy};
use crate::loggers::Metrics;
use crate::trainer::{FitInputs, FitSummary, ResumeFrom, Trainer, TrainerFactory, TrainerSpec};
use crate::transform::NormalizeArgs;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalTrainerArgs {
    /// Stop after this many optimizer steps in total.
    pub max_steps: Option<u64>,
    /// Only use the first N batches of every epoch.
    pub limit_train_batches: Option<usize>,
}

impl Args for LocalTrainerArgs {
    const FIELD: &'static str = "trainer_args";

    fn check(&self) -> TrainingResult<()> {
        if self.limit_train_batches == Some(0) {
            return Err(TrainingError::config("trainer_args.limit_train_batches", "must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Position {
    /// Last finished epoch, if any.
    epoch: Option<usize>,
    global_step: u64,
}

#[derive(Debug)]
pub struct LocalTrainer {
    spec: TrainerSpec,
    args: LocalTrainerArgs,
    strategy: Strategy,
    position: Mutex<Position>,
    optimizer_state: Mutex<Value>,
}

impl LocalTrainer {
    pub fn new(spec: TrainerSpec, args: LocalTrainerArgs) -> TrainingResult<Self> {
        args.check()?;
        let total_devices = spec.devices_per_node * spec.num_nodes;
        let strategy = match spec.strategy {
            Auto::Explicit(strategy) => strategy,
            Auto::Auto if total_devices > 1 => Strategy::Ddp,
            Auto::Auto => Strategy::SingleDevice,
        };
        if total_devices > 1 {
            warn!(devices = total_devices, %strategy, "local trainer runs all devices in a single process");
        }
        Ok(Self {
            spec,
            args,
            strategy,
            position: Mutex::new(Position::default()),
            optimizer_state: Mutex::new(Value::Null),
        })
    }

    fn position(&self) -> TrainingResult<Position> {
        Ok(*self.position.lock().map_err(|_| poisoned())?)
    }

    fn set_position(&self, position: Position, optimizer_state: Value) -> TrainingResult<()> {
        *self.position.lock().map_err(|_| poisoned())? = position;
        *self.optimizer_state.lock().map_err(|_| poisoned())? = optimizer_state;
        Ok(())
    }
}

fn poisoned() -> TrainingError {
    TrainingError::Trainer("local trainer state lock poisoned".to_string())
}

#[async_trait]
impl Trainer for LocalTrainer {
    fn id(&self) -> &'static str {
        "local"
    }

    fn accelerator(&self) -> Accelerator {
        self.spec.accelerator
    }

    fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn num_devices(&self) -> usize {
        self.spec.devices_per_node
    }

    fn num_nodes(&self) -> usize {
        self.spec.num_nodes
    }

    async fn fit(&self, inputs: FitInputs<'_>, resume: &ResumeFrom) -> TrainingResult<FitSummary> {
        let FitInputs { method, dataloader, callbacks, loggers, rng } = inputs;

        let (start_epoch, mut global_step, optimizer_state) = match resume {
            ResumeFrom::Fresh => (0, 0, Value::Null),
            ResumeFrom::Checkpoint(path) => {
                let checkpoint = Checkpoint::load(path)?;
                info!(path = %path.display(), epoch = checkpoint.epoch, "resuming from checkpoint");
                // Saving before the first resumed epoch finishes must keep these counters.
                let position = Position { epoch: Some(checkpoint.epoch), global_step: checkpoint.global_step };
                self.set_position(position, checkpoint.optimizer_state.clone())?;
                (checkpoint.epoch + 1, checkpoint.global_step, checkpoint.optimizer_state)
            }
        };

        let batches_per_epoch = self
            .args
            .limit_train_batches
            .map_or(dataloader.num_batches(), |limit| limit.min(dataloader.num_batches()));
        let mut total_steps = (self.spec.epochs * batches_per_epoch) as u64;
        if let Some(max_steps) = self.args.max_steps {
            total_steps = total_steps.min(max_steps);
        }

        let mut status = TrainStatus {
            epoch: start_epoch,
            max_epochs: self.spec.epochs,
            global_step,
            total_steps,
            log_every_n_steps: self.spec.log_every_n_steps as u64,
            lr: method.lr_at(global_step, total_steps),
            optimizer_state,
            ..TrainStatus::default()
        };
        for callback in callbacks {
            callback.on_fit_start(&CallbackContext { status: &status, loggers })?;
        }

        let mut summary = FitSummary { global_step, ..FitSummary::default() };
        'epochs: for epoch in start_epoch..self.spec.epochs {
            status.epoch = epoch;
            let mut epoch_loss = 0.0;
            let mut epoch_batches = 0usize;

            for batch in dataloader.batches(epoch).iter().take(batches_per_epoch) {
                if self.args.max_steps.is_some_and(|max| global_step >= max) {
                    info!(global_step, "reached max_steps");
                    break 'epochs;
                }
                let items = dataloader.load(batch)?;
                let output = method.training_step(&items, global_step, total_steps, rng)?;
                global_step += 1;
                epoch_loss += output.loss;
                epoch_batches += 1;

                status.global_step = global_step;
                status.lr = output.lr;
                status.metrics.insert("train_loss".to_string(), output.loss);
                status.optimizer_state = json!({
                    "optimizer": method.optimizer_args().optimizer_type(),
                    "lr": output.lr,
                    "step": global_step,
                });
                if status.should_log_step() {
                    let metrics = Metrics::from([
                        ("train_loss".to_string(), output.loss),
                        ("epoch".to_string(), epoch as f64),
                    ]);
                    for logger in loggers {
                        logger.log_metrics(&metrics, global_step)?;
                    }
                }
                for callback in callbacks {
                    callback.on_train_batch_end(&CallbackContext { status: &status, loggers })?;
                }
            }

            if epoch_batches > 0 {
                status.metrics.insert("train_loss".to_string(), epoch_loss / epoch_batches as f64);
            }
            let mut stop = false;
            for callback in callbacks {
                stop |= callback.on_train_epoch_end(&CallbackContext { status: &status, loggers })? == Flow::Stop;
            }
            summary.epochs_completed += 1;
            self.set_position(Position { epoch: Some(epoch), global_step }, status.optimizer_state.clone())?;
            if stop {
                summary.stopped_early = true;
                break;
            }
            tokio::task::yield_now().await;
        }

        for callback in callbacks {
            callback.on_fit_end(&CallbackContext { status: &status, loggers })?;
        }
        for logger in loggers {
            logger.finalize()?;
        }

        summary.global_step = global_step;
        summary.final_metrics = status.metrics;
        Ok(summary)
    }

    async fn save_checkpoint(&self, path: &Path, models: &CheckpointModels, normalize: &NormalizeArgs) -> TrainingResult<()> {
        let position = self.position()?;
        let optimizer_state = self.optimizer_state.lock().map_err(|_| poisoned())?.clone();
        let checkpoint =
            Checkpoint::capture(models, normalize, position.epoch.unwrap_or(0), position.global_step, optimizer_state)?;
        checkpoint.save(path)?;
        info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LocalTrainerFactory;

impl TrainerFactory for LocalTrainerFactory {
    fn create(&self, spec: &TrainerSpec, trainer_args: Option<&Map<String, Value>>) -> TrainingResult<Box<dyn Trainer>> {
        let args = resolve_args(&LocalTrainerArgs::default(), trainer_args.map(|m| ArgsInput::Partial(m.clone())))?;
        Ok(Box::new(LocalTrainer::new(spec.clone(), args)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Precision;
    use std::path::PathBuf;

    fn spec(devices_per_node: usize, strategy: Auto<Strategy>) -> TrainerSpec {
        TrainerSpec {
            out_dir: PathBuf::from("out"),
            epochs: 1,
            accelerator: Accelerator::Cpu,
            strategy,
            devices_per_node,
            num_nodes: 1,
            precision: Precision::default(),
            log_every_n_steps: 1,
        }
    }

    #[test]
    fn test_strategy_defaults() {
        let single = LocalTrainer::new(spec(1, Auto::Auto), LocalTrainerArgs::default()).unwrap();
        assert_eq!(single.strategy(), Strategy::SingleDevice);
        let multi = LocalTrainer::new(spec(2, Auto::Auto), LocalTrainerArgs::default()).unwrap();
        assert_eq!(multi.strategy(), Strategy::Ddp);
        let explicit = LocalTrainer::new(spec(2, Auto::Explicit(Strategy::Fsdp)), LocalTrainerArgs::default()).unwrap();
        assert_eq!(explicit.strategy(), Strategy::Fsdp);
    }

    #[test]
    fn test_factory_rejects_unknown_trainer_args() {
        let mut args = Map::new();
        args.insert("gradient_clip_val".to_string(), json!(1.0));
        let err = LocalTrainerFactory.create(&spec(1, Auto::Auto), Some(&args)).err().unwrap();
        assert!(err.is_config_validation());
    }
}
