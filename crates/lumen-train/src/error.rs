use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// A field is unknown, has the wrong type, or holds an out-of-range value.
    #[error("invalid config field `{field}`: {reason}")]
    ConfigValidation { field: String, reason: String },

    /// Fields are individually valid but inconsistent with each other or with the
    /// environment (hardware, registered methods and models, files on disk).
    #[error("resolution error: {0}")]
    Resolution(String),

    /// A scoped resource (temp index file, sync marker) could not be acquired or released.
    #[error("resource error: {0}")]
    Resource(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigValidation { field: field.into(), reason: reason.into() }
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution(message.into())
    }

    #[must_use]
    pub fn is_config_validation(&self) -> bool {
        matches!(self, Self::ConfigValidation { .. })
    }

    #[must_use]
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::Resolution(_))
    }
}
