//! Checkpoint files and weight restoration.

use crate::error::{TrainingError, TrainingResult};
use crate::model::{EmbeddingModel, ModelWrapper, StateDict};
use crate::transform::NormalizeArgs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const LAST_CHECKPOINT_NAME: &str = "last.ckpt";

/// Live models whose weights go into a checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointModels {
    pub wrapped_model: Arc<dyn ModelWrapper>,
    pub embedding_model: Arc<EmbeddingModel>,
}

/// Named weight maps stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointWeights {
    pub model: StateDict,
    pub embedding_model: StateDict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub epoch: usize,
    pub global_step: u64,
    pub models: CheckpointWeights,
    pub normalize: NormalizeArgs,
    /// Trainer-owned state. Never read back when loading weights.
    #[serde(default)]
    pub optimizer_state: Value,
}

impl Checkpoint {
    pub fn capture(
        models: &CheckpointModels,
        normalize: &NormalizeArgs,
        epoch: usize,
        global_step: u64,
        optimizer_state: Value,
    ) -> TrainingResult<Self> {
        Ok(Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            epoch,
            global_step,
            models: CheckpointWeights {
                model: models.wrapped_model.model().state_dict()?,
                embedding_model: models.embedding_model.state_dict()?,
            },
            normalize: normalize.clone(),
            optimizer_state,
        })
    }

    /// Write atomically: a sibling temp file is renamed over `path`.
    pub fn save(&self, path: &Path) -> TrainingResult<()> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let tmp = path.with_extension("ckpt.tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| TrainingError::Checkpoint(format!("failed to read checkpoint {}: {e}", path.display())))?;
        let checkpoint: Self = serde_json::from_slice(&bytes)
            .map_err(|e| TrainingError::Checkpoint(format!("invalid checkpoint {}: {e}", path.display())))?;
        if checkpoint.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(TrainingError::Checkpoint(format!(
                "unsupported checkpoint format version {} in {}",
                checkpoint.format_version,
                path.display()
            )));
        }
        Ok(checkpoint)
    }
}

#[must_use]
pub fn last_checkpoint_path(checkpoints_dir: &Path) -> PathBuf {
    checkpoints_dir.join(LAST_CHECKPOINT_NAME)
}

/// Which checkpoint, if any, to take weights from.
///
/// `resume` reads the run's own last checkpoint. An explicit `checkpoint`
/// path is used for fresh runs. Setting both fails.
pub fn resolve_checkpoint_source(
    checkpoints_dir: &Path,
    resume: bool,
    checkpoint: Option<&Path>,
) -> TrainingResult<Option<PathBuf>> {
    let path = match (resume, checkpoint) {
        (true, Some(path)) => {
            return Err(TrainingError::resolution(format!(
                "resume=true and checkpoint={} cannot be set at the same time, use resume to continue an \
                 interrupted run or checkpoint to start a new run from existing weights",
                path.display()
            )));
        }
        (true, None) => last_checkpoint_path(checkpoints_dir),
        (false, Some(path)) => path.to_path_buf(),
        (false, None) => return Ok(None),
    };
    if !path.is_file() {
        return Err(TrainingError::resolution(format!("checkpoint file does not exist: {}", path.display())));
    }
    Ok(Some(path))
}

/// Load model and embedding weights from `path`. Epoch counters and
/// optimizer state are ignored.
pub fn load_checkpoint_weights(path: &Path, models: &CheckpointModels) -> TrainingResult<()> {
    let checkpoint = Checkpoint::load(path)?;
    models.wrapped_model.model().load_state_dict(&checkpoint.models.model)?;
    models.embedding_model.load_state_dict(&checkpoint.models.embedding_model)?;
    info!(path = %path.display(), epoch = checkpoint.epoch, "loaded weights from checkpoint");
    Ok(())
}
