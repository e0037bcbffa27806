use crate::callbacks::EXPORTED_MODEL_NAME;
use crate::checkpoint::last_checkpoint_path;
use crate::error::{TrainingError, TrainingResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const SYNC_MARKER_NAME: &str = ".lumen_local_rank_sync";

/// Filesystem layout of a run's output directory.
///
/// ```text
/// out/
///   train.log
///   metrics.jsonl
///   csv_logs/
///   checkpoints/last.ckpt
///   exported_models/exported_last.pt
///   training_manifest.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn train_log_path(&self) -> PathBuf {
        self.root.join("train.log")
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    #[must_use]
    pub fn last_checkpoint_path(&self) -> PathBuf {
        last_checkpoint_path(&self.checkpoints_dir())
    }

    #[must_use]
    pub fn exported_models_dir(&self) -> PathBuf {
        self.root.join("exported_models")
    }

    #[must_use]
    pub fn exported_model_path(&self) -> PathBuf {
        self.exported_models_dir().join(EXPORTED_MODEL_NAME)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("training_manifest.json")
    }

    fn sync_marker_path(&self) -> PathBuf {
        self.root.join(SYNC_MARKER_NAME)
    }
}

/// Local rank of this process among the processes on the same node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalRank {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for LocalRank {
    fn default() -> Self {
        Self { rank: 0, world_size: 1 }
    }
}

impl LocalRank {
    /// Read `LOCAL_RANK` and `LOCAL_WORLD_SIZE`, defaulting to a single process.
    pub fn from_env() -> TrainingResult<Self> {
        let read = |name: &str, default: usize| -> TrainingResult<usize> {
            match std::env::var(name) {
                Ok(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| TrainingError::resolution(format!("{name}={value} is not a non-negative integer"))),
                Err(_) => Ok(default),
            }
        };
        let local = Self { rank: read("LOCAL_RANK", 0)?, world_size: read("LOCAL_WORLD_SIZE", 1)? };
        if local.world_size == 0 || local.rank >= local.world_size {
            return Err(TrainingError::resolution(format!(
                "LOCAL_RANK={} is out of range for LOCAL_WORLD_SIZE={}",
                local.rank, local.world_size
            )));
        }
        Ok(local)
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.rank == 0
    }
}

/// Check the output directory and create it.
///
/// An existing non-empty directory is only accepted when resuming or when
/// `overwrite` is set. Only local rank 0 checks, since the other ranks see
/// the directory rank 0 already created.
pub fn prepare_out_dir(out: &Path, resume: bool, overwrite: bool, local_rank: LocalRank) -> TrainingResult<RunLayout> {
    if local_rank.is_zero() && out.is_dir() {
        let non_empty = std::fs::read_dir(out)?.next().is_some();
        if non_empty && !(resume || overwrite) {
            return Err(TrainingError::resolution(format!(
                "output '{}' already exists and is not empty, set overwrite=true to overwrite results or \
                 resume=true to resume an interrupted run",
                out.display()
            )));
        }
    } else if out.exists() && !out.is_dir() {
        return Err(TrainingError::config("out", format!("'{}' exists and is not a directory", out.display())));
    }
    std::fs::create_dir_all(out)?;
    Ok(RunLayout::new(out.to_path_buf()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(100), max_polls: 600 }
    }
}

/// Marker held by local rank 0 while the run uses the output directory.
#[derive(Debug)]
pub struct OutDirSync {
    marker: Option<PathBuf>,
}

impl OutDirSync {
    /// Make all local ranks agree on the output directory.
    ///
    /// Rank 0 writes a marker file. Other ranks wait for it to appear in
    /// their own output directory and fail if it never does, which means
    /// the ranks resolved different directories.
    pub async fn acquire(layout: &RunLayout, local_rank: LocalRank, policy: SyncPolicy) -> TrainingResult<Self> {
        let marker = layout.sync_marker_path();
        if local_rank.world_size <= 1 {
            return Ok(Self { marker: None });
        }
        if local_rank.is_zero() {
            std::fs::write(&marker, b"")
                .map_err(|e| TrainingError::Resource(format!("failed to write {}: {e}", marker.display())))?;
            debug!(path = %marker.display(), "wrote local rank sync marker");
            return Ok(Self { marker: Some(marker) });
        }

        for _ in 0..policy.max_polls {
            if marker.exists() {
                return Ok(Self { marker: None });
            }
            tokio::time::sleep(policy.poll_interval).await;
        }
        Err(TrainingError::resolution(format!(
            "local rank {} did not find the output directory '{}' created by local rank 0, make sure all ranks \
             use the same `out`",
            local_rank.rank,
            layout.root().display()
        )))
    }
}

impl Drop for OutDirSync {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.take() {
            if let Err(e) = std::fs::remove_file(&marker) {
                warn!(path = %marker.display(), error = %e, "failed to remove local rank sync marker");
            }
        }
    }
}
