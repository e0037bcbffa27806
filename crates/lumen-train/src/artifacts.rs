use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::method::MethodKind;
use crate::progress::RunId;
use crate::trainer::FitSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ExportedModel,
    Checkpoint,
    TrainLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub train_loss: Option<f64>,
    pub epochs_completed: usize,
    pub global_step: u64,
    pub stopped_early: bool,
}

impl From<&FitSummary> for RunMetrics {
    fn from(summary: &FitSummary) -> Self {
        Self {
            train_loss: summary.final_metrics.get("train_loss").copied(),
            epochs_completed: summary.epochs_completed,
            global_step: summary.global_step,
            stopped_early: summary.stopped_early,
        }
    }
}

/// Written to `training_manifest.json` at the end of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub method: MethodKind,
    pub model: String,
    pub dataset_id: DatasetId,
    #[serde(default)]
    pub metrics: RunMetrics,
    pub artifacts: Vec<RunArtifact>,
}

impl RunManifest {
    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> TrainingResult<RunArtifact> {
    if !path.is_file() {
        return Err(TrainingError::Resource(format!("artifact path does not exist: {}", path.display())));
    }
    let sha256 = sha256_file(&path)?;
    Ok(RunArtifact { kind, path, sha256 })
}
