//! Run-scoped log output.
//!
//! The library never installs a global subscriber. A run builds its own
//! [`Dispatch`] (console plus `out/train.log`) and executes inside it.

use crate::error::{TrainingError, TrainingResult};
use serde_json::Value;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::Dispatch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Entries kept when logging long lists such as `data`.
pub const MAX_LOGGED_LIST_ITEMS: usize = 10;

/// Build the dispatch a run logs through.
///
/// `filter` uses `EnvFilter` syntax, e.g. `info` or `lumen_train=debug`.
pub fn run_dispatch(log_file: &Path, filter: &str, console: bool) -> TrainingResult<Dispatch> {
    let filter = EnvFilter::try_new(filter).map_err(|e| TrainingError::config("log_level", e.to_string()))?;
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(log_file)?;
    let file_layer = tracing_subscriber::fmt::layer().with_ansi(false).with_target(true).with_writer(Mutex::new(file));
    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let subscriber = tracing_subscriber::registry().with(filter).with(file_layer).with(console_layer);
    Ok(Dispatch::new(subscriber))
}

/// Copy of `value` with the lists under `keys` cut to `limit` entries.
#[must_use]
pub fn truncate_long_lists(value: &Value, keys: &[&str], limit: usize) -> Value {
    let mut value = value.clone();
    if let Value::Object(map) = &mut value {
        for key in keys {
            if let Some(Value::Array(items)) = map.get_mut(*key) {
                if items.len() > limit {
                    let hidden = items.len() - limit;
                    items.truncate(limit);
                    items.push(Value::String(format!("... {hidden} more")));
                }
            }
        }
    }
    value
}

/// Pretty JSON for log messages, with long `data` lists cut short.
#[must_use]
pub fn pretty_format_args(value: &Value) -> String {
    let value = truncate_long_lists(value, &["data"], MAX_LOGGED_LIST_ITEMS);
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_long_lists() {
        let value = json!({"data": [1, 2, 3, 4], "other": [1, 2, 3, 4]});
        let truncated = truncate_long_lists(&value, &["data"], 2);
        assert_eq!(truncated["data"], json!([1, 2, "... 2 more"]));
        assert_eq!(truncated["other"], value["other"]);
    }

    #[test]
    fn test_run_dispatch_writes_log_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out").join("train.log");
        let dispatch = run_dispatch(&path, "info", false).unwrap();
        tracing::dispatcher::with_default(&dispatch, || tracing::info!("hello from the run"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("hello from the run"));
    }

    #[test]
    fn test_invalid_filter() {
        let temp = TempDir::new().unwrap();
        let err = run_dispatch(&temp.path().join("train.log"), "info,[", false).unwrap_err();
        assert!(err.is_config_validation());
    }
}
