//! Metric loggers.

use crate::args::{resolve_args, Args, ArgsInput};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Metric name to value.
pub type Metrics = BTreeMap<String, f64>;

pub trait TrainLogger: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Record the resolved run configuration.
    fn log_hyperparams(&self, params: &Value) -> TrainingResult<()>;

    fn log_metrics(&self, metrics: &Metrics, step: u64) -> TrainingResult<()>;

    /// Flush buffered output. Called once when fitting ends.
    fn finalize(&self) -> TrainingResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JsonlLoggerArgs {
    pub flush_logs_every_n_steps: u64,
}

impl Default for JsonlLoggerArgs {
    fn default() -> Self {
        Self { flush_logs_every_n_steps: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsvLoggerArgs {
    pub flush_logs_every_n_steps: u64,
}

impl Default for CsvLoggerArgs {
    fn default() -> Self {
        Self { flush_logs_every_n_steps: 100 }
    }
}

/// Per-logger settings. `null` disables a logger, a missing entry keeps it
/// with its defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerArgs {
    pub jsonl: Option<JsonlLoggerArgs>,
    pub csv: Option<CsvLoggerArgs>,
}

impl Default for LoggerArgs {
    fn default() -> Self {
        Self { jsonl: Some(JsonlLoggerArgs::default()), csv: Some(CsvLoggerArgs::default()) }
    }
}

impl Args for LoggerArgs {
    const FIELD: &'static str = "loggers";

    fn check(&self) -> TrainingResult<()> {
        if self.jsonl.as_ref().is_some_and(|a| a.flush_logs_every_n_steps == 0) {
            return Err(TrainingError::config("loggers.jsonl.flush_logs_every_n_steps", "must be >= 1"));
        }
        if self.csv.as_ref().is_some_and(|a| a.flush_logs_every_n_steps == 0) {
            return Err(TrainingError::config("loggers.csv.flush_logs_every_n_steps", "must be >= 1"));
        }
        Ok(())
    }
}

pub fn get_logger_args(input: Option<ArgsInput<LoggerArgs>>) -> TrainingResult<LoggerArgs> {
    resolve_args(&LoggerArgs::default(), input)
}

pub fn get_loggers(args: &LoggerArgs, out: &Path) -> TrainingResult<Vec<Arc<dyn TrainLogger>>> {
    let mut loggers: Vec<Arc<dyn TrainLogger>> = Vec::new();
    if let Some(jsonl) = &args.jsonl {
        loggers.push(Arc::new(JsonlLogger::new(&out.join("metrics.jsonl"), jsonl.clone())?));
    }
    if let Some(csv) = &args.csv {
        loggers.push(Arc::new(CsvLogger::new(&out.join("csv_logs"), csv.clone())?));
    }
    Ok(loggers)
}

fn lock_error(name: &str) -> TrainingError {
    TrainingError::Trainer(format!("{name} logger lock poisoned"))
}

/// Appends one JSON object per line to `metrics.jsonl`.
#[derive(Debug)]
pub struct JsonlLogger {
    path: PathBuf,
    args: JsonlLoggerArgs,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlLogger {
    pub fn new(path: &Path, args: JsonlLoggerArgs) -> TrainingResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { path: path.to_path_buf(), args, writer: Mutex::new(BufWriter::new(file)) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, value: &Value, flush: bool) -> TrainingResult<()> {
        let mut writer = self.writer.lock().map_err(|_| lock_error("jsonl"))?;
        serde_json::to_writer(&mut *writer, value)?;
        writer.write_all(b"\n")?;
        if flush {
            writer.flush()?;
        }
        Ok(())
    }
}

impl TrainLogger for JsonlLogger {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn log_hyperparams(&self, params: &Value) -> TrainingResult<()> {
        self.write_line(&serde_json::json!({ "hparams": params }), true)
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) -> TrainingResult<()> {
        let mut record = serde_json::Map::new();
        record.insert("step".to_string(), Value::from(step));
        for (name, value) in metrics {
            record.insert(name.clone(), Value::from(*value));
        }
        self.write_line(&Value::Object(record), step % self.args.flush_logs_every_n_steps == 0)
    }

    fn finalize(&self) -> TrainingResult<()> {
        self.writer.lock().map_err(|_| lock_error("jsonl"))?.flush()?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    step: u64,
    metric: &'a str,
    value: f64,
}

/// Long-format `metrics.csv` plus `hparams.yaml` in its own directory.
#[derive(Debug)]
pub struct CsvLogger {
    dir: PathBuf,
    args: CsvLoggerArgs,
    writer: Mutex<csv::Writer<File>>,
}

impl CsvLogger {
    pub fn new(dir: &Path, args: CsvLoggerArgs) -> TrainingResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("metrics.csv");
        let has_header = path.metadata().map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !has_header {
            writer.write_record(["step", "metric", "value"]).map_err(csv_error)?;
            writer.flush()?;
        }
        Ok(Self { dir: dir.to_path_buf(), args, writer: Mutex::new(writer) })
    }

    #[must_use]
    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join("metrics.csv")
    }

    #[must_use]
    pub fn hparams_path(&self) -> PathBuf {
        self.dir.join("hparams.yaml")
    }
}

fn csv_error(e: csv::Error) -> TrainingError {
    TrainingError::Other(anyhow::Error::new(e).context("failed to write csv metrics"))
}

impl TrainLogger for CsvLogger {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn log_hyperparams(&self, params: &Value) -> TrainingResult<()> {
        let yaml = serde_yaml::to_string(params)
            .map_err(|e| TrainingError::Other(anyhow::Error::new(e).context("failed to encode hyperparameters")))?;
        std::fs::write(self.hparams_path(), yaml)?;
        debug!(path = %self.hparams_path().display(), "wrote hyperparameters");
        Ok(())
    }

    fn log_metrics(&self, metrics: &Metrics, step: u64) -> TrainingResult<()> {
        let mut writer = self.writer.lock().map_err(|_| lock_error("csv"))?;
        for (metric, value) in metrics {
            writer.serialize(CsvRow { step, metric, value: *value }).map_err(csv_error)?;
        }
        if step % self.args.flush_logs_every_n_steps == 0 {
            writer.flush()?;
        }
        Ok(())
    }

    fn finalize(&self) -> TrainingResult<()> {
        self.writer.lock().map_err(|_| lock_error("csv"))?.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_default_loggers() {
        let temp = TempDir::new().unwrap();
        let args = get_logger_args(None).unwrap();
        let names: Vec<_> = get_loggers(&args, temp.path()).unwrap().iter().map(|l| l.name()).collect();
        assert_eq!(names, vec!["jsonl", "csv"]);
    }

    #[test]
    fn test_null_entry_disables_logger() {
        let temp = TempDir::new().unwrap();
        let serde_json::Value::Object(map) = json!({"csv": null}) else { unreachable!() };
        let args = get_logger_args(Some(ArgsInput::Partial(map))).unwrap();
        let loggers = get_loggers(&args, temp.path()).unwrap();
        assert_eq!(loggers.len(), 1);
        assert!(!temp.path().join("csv_logs").exists());
    }

    #[test]
    fn test_unknown_logger_rejected() {
        let serde_json::Value::Object(map) = json!({"wandb": {"project": "x"}}) else { unreachable!() };
        assert!(get_logger_args(Some(ArgsInput::Partial(map))).unwrap_err().is_config_validation());
    }

    #[test]
    fn test_jsonl_logger_writes_lines() {
        let temp = TempDir::new().unwrap();
        let logger = JsonlLogger::new(&temp.path().join("metrics.jsonl"), JsonlLoggerArgs::default()).unwrap();
        logger.log_hyperparams(&json!({"epochs": 1})).unwrap();
        logger.log_metrics(&Metrics::from([("train_loss".to_string(), 0.5)]), 3).unwrap();
        logger.finalize().unwrap();

        let contents = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<Value> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines[0]["hparams"]["epochs"], 1);
        assert_eq!(lines[1]["step"], 3);
        assert_eq!(lines[1]["train_loss"], 0.5);
    }

    #[test]
    fn test_csv_logger_writes_header_once() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("csv_logs");
        for step in 0..2 {
            let logger = CsvLogger::new(&dir, CsvLoggerArgs::default()).unwrap();
            logger.log_metrics(&Metrics::from([("lr".to_string(), 0.1)]), step).unwrap();
            logger.finalize().unwrap();
        }
        let logger = CsvLogger::new(&dir, CsvLoggerArgs::default()).unwrap();
        logger.log_hyperparams(&json!({"method": "dino"})).unwrap();

        let mut reader = csv::Reader::from_path(logger.metrics_path()).unwrap();
        assert_eq!(reader.records().count(), 2);
        let hparams = std::fs::read_to_string(logger.hparams_path()).unwrap();
        assert!(hparams.contains("method: dino"));
    }
}
