use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Identifier for one training run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Run-level lifecycle. Any state may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Unvalidated,
    Validated,
    Resolving,
    Ready,
    Fitting,
    Exported,
    Failed,
}

impl RunState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::{Exported, Failed, Fitting, Ready, Resolving, Unvalidated, Validated};
        matches!(
            (self, next),
            (Unvalidated, Validated)
                | (Validated, Resolving)
                | (Resolving, Ready)
                | (Ready, Fitting)
                | (Fitting, Exported)
                | (Unvalidated | Validated | Resolving | Ready | Fitting, Failed)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = serde_json::to_value(self).map_err(|_| std::fmt::Error)?;
        f.write_str(value.as_str().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    State { run_id: RunId, state: RunState },
    Message { run_id: RunId, message: String },
    Step { run_id: RunId, epoch: usize, step: u64, total: Option<u64>, loss: Option<f64> },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Forwards progress to `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::State { run_id, state } => info!(%run_id, %state, "run state changed"),
            ProgressEvent::Message { run_id, message } => info!(%run_id, "{message}"),
            ProgressEvent::Step { run_id, epoch, step, total, loss } => {
                debug!(%run_id, epoch, step, total = ?total, loss = ?loss, "train step");
            }
        }
    }
}
