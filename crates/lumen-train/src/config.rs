//! The run configuration and its validator.
//!
//! Raw input is a JSON-like mapping. Validation pulls every known field out
//! of the mapping, parses it strictly and fails on anything left over.
//! Nested args stay partial (`ArgsInput::Partial`) until the resolver chain
//! replaces them with typed records.

use crate::args::{parse_field, Args, ArgsInput};
use crate::auto::Auto;
use crate::callbacks::CallbackArgs;
use crate::dataset::DataSource;
use crate::error::{TrainingError, TrainingResult};
use crate::hardware::{Accelerator, Devices, Precision, Strategy};
use crate::loader::LoaderArgs;
use crate::loggers::LoggerArgs;
use crate::method::{MethodArgs, MethodKind};
use crate::model::ModelSource;
use crate::optim::{OptimizerArgs, OptimizerType};
use crate::transform::TransformArgs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainConfig {
    pub out: PathBuf,
    pub data: DataSource,
    pub model: ModelSource,
    pub method: String,
    pub method_args: Option<ArgsInput<MethodArgs>>,
    pub embed_dim: Option<usize>,
    pub epochs: usize,
    /// Global batch size across all devices.
    pub batch_size: usize,
    pub num_workers: Auto<usize>,
    pub devices: Auto<Devices>,
    pub num_nodes: usize,
    pub resume: bool,
    pub checkpoint: Option<PathBuf>,
    pub overwrite: bool,
    pub accelerator: Auto<Accelerator>,
    pub strategy: Auto<Strategy>,
    pub precision: Precision,
    pub seed: u64,
    pub loggers: Option<ArgsInput<LoggerArgs>>,
    pub callbacks: Option<ArgsInput<CallbackArgs>>,
    pub optim: Auto<OptimizerType>,
    pub optim_args: Option<ArgsInput<OptimizerArgs>>,
    pub transform_args: Option<ArgsInput<TransformArgs>>,
    pub loader_args: Option<ArgsInput<LoaderArgs>>,
    /// Passed through to the trainer factory.
    pub trainer_args: Option<Map<String, Value>>,
    /// Passed through to the model package.
    pub model_args: Option<Map<String, Value>>,
}

impl TrainConfig {
    /// Config with every optional field at its default.
    pub fn new(out: impl Into<PathBuf>, data: impl Into<DataSource>, model: ModelSource) -> Self {
        Self {
            out: out.into(),
            data: data.into(),
            model,
            method: MethodKind::Distillation.as_str().to_string(),
            method_args: None,
            embed_dim: None,
            epochs: 100,
            batch_size: 128,
            num_workers: Auto::Auto,
            devices: Auto::Auto,
            num_nodes: 1,
            resume: false,
            checkpoint: None,
            overwrite: false,
            accelerator: Auto::Auto,
            strategy: Auto::Auto,
            precision: Precision::default(),
            seed: 0,
            loggers: None,
            callbacks: None,
            optim: Auto::Auto,
            optim_args: None,
            transform_args: None,
            loader_args: None,
            trainer_args: None,
            model_args: None,
        }
    }

    /// Resolved method kind. Fails for unknown method names.
    pub fn method_kind(&self) -> TrainingResult<MethodKind> {
        MethodKind::from_name(&self.method)
    }

    /// Field checks that do not depend on anything outside the config.
    pub fn check(&self) -> TrainingResult<()> {
        if self.data.paths().is_empty() {
            return Err(TrainingError::config("data", "must name at least one path"));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::config("batch_size", "must be >= 1"));
        }
        if self.num_nodes == 0 {
            return Err(TrainingError::config("num_nodes", "must be >= 1"));
        }
        if self.embed_dim == Some(0) {
            return Err(TrainingError::config("embed_dim", "must be >= 1"));
        }
        match self.devices.explicit() {
            Some(Devices::Count(0)) => return Err(TrainingError::config("devices", "must be >= 1")),
            Some(Devices::Indices(indices)) if indices.is_empty() => {
                return Err(TrainingError::config("devices", "device list must not be empty"));
            }
            _ => {}
        }
        check_typed(&self.loggers)?;
        check_typed(&self.callbacks)?;
        check_typed(&self.transform_args)?;
        check_typed(&self.loader_args)?;
        if let Some(ArgsInput::Typed(args)) = &self.optim_args {
            args.check()?;
        }
        Ok(())
    }

    /// JSON view of the config, as logged and handed to loggers.
    pub fn to_value(&self) -> TrainingResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn check_typed<T: Args>(input: &Option<ArgsInput<T>>) -> TrainingResult<()> {
    match input {
        Some(ArgsInput::Typed(args)) => args.check(),
        _ => Ok(()),
    }
}

/// Input accepted by [`validate_config`].
#[derive(Debug, Clone)]
pub enum ConfigInput {
    Raw(Map<String, Value>),
    Typed(Box<TrainConfig>),
}

impl ConfigInput {
    /// Raw input from any JSON value. Only objects are accepted.
    pub fn from_value(value: Value) -> TrainingResult<Self> {
        match value {
            Value::Object(map) => Ok(Self::Raw(map)),
            other => Err(TrainingError::config("<root>", format!("expected a mapping, got {other}"))),
        }
    }
}

impl From<TrainConfig> for ConfigInput {
    fn from(config: TrainConfig) -> Self {
        Self::Typed(Box::new(config))
    }
}

impl From<Map<String, Value>> for ConfigInput {
    fn from(map: Map<String, Value>) -> Self {
        Self::Raw(map)
    }
}

/// Normalize user input into a validated [`TrainConfig`].
///
/// Typed input is re-checked and returned unchanged, so validating the
/// result of a validation is a no-op.
pub fn validate_config(input: ConfigInput) -> TrainingResult<TrainConfig> {
    let config = match input {
        ConfigInput::Typed(config) => *config,
        ConfigInput::Raw(map) => from_raw(map)?,
    };
    config.check()?;
    Ok(config)
}

fn from_raw(mut raw: Map<String, Value>) -> TrainingResult<TrainConfig> {
    let out: PathBuf = required(&mut raw, "out")?;
    let data: DataSource = required(&mut raw, "data")?;
    let model = match raw.remove("model") {
        Some(Value::String(name)) => ModelSource::Name(name),
        Some(other) => {
            return Err(TrainingError::config(
                "model",
                format!("raw config input only accepts a model name, got {other}"),
            ));
        }
        None => return Err(TrainingError::config("model", "missing required field")),
    };

    let mut config = TrainConfig::new(out, data, model);
    optional(&mut raw, "method", &mut config.method)?;
    config.method_args = args_input(&mut raw, "method_args")?;
    optional(&mut raw, "embed_dim", &mut config.embed_dim)?;
    optional(&mut raw, "epochs", &mut config.epochs)?;
    optional(&mut raw, "batch_size", &mut config.batch_size)?;
    optional(&mut raw, "num_workers", &mut config.num_workers)?;
    optional(&mut raw, "devices", &mut config.devices)?;
    optional(&mut raw, "num_nodes", &mut config.num_nodes)?;
    optional(&mut raw, "resume", &mut config.resume)?;
    optional(&mut raw, "checkpoint", &mut config.checkpoint)?;
    optional(&mut raw, "overwrite", &mut config.overwrite)?;
    optional(&mut raw, "accelerator", &mut config.accelerator)?;
    optional(&mut raw, "strategy", &mut config.strategy)?;
    optional(&mut raw, "precision", &mut config.precision)?;
    optional(&mut raw, "seed", &mut config.seed)?;
    config.loggers = args_input(&mut raw, "loggers")?;
    config.callbacks = args_input(&mut raw, "callbacks")?;
    optional(&mut raw, "optim", &mut config.optim)?;
    config.optim_args = args_input(&mut raw, "optim_args")?;
    config.transform_args = args_input(&mut raw, "transform_args")?;
    config.loader_args = args_input(&mut raw, "loader_args")?;
    config.trainer_args = raw_mapping(&mut raw, "trainer_args")?;
    config.model_args = raw_mapping(&mut raw, "model_args")?;

    if let Some(field) = raw.keys().next() {
        return Err(TrainingError::config(field.clone(), "unknown field"));
    }
    Ok(config)
}

fn required<T: DeserializeOwned>(raw: &mut Map<String, Value>, field: &str) -> TrainingResult<T> {
    match raw.remove(field) {
        Some(Value::Null) | None => Err(TrainingError::config(field, "missing required field")),
        Some(value) => parse_field(field, value),
    }
}

/// Overwrite `target` if `field` is present. `null` is parsed like any
/// other value, so it only clears `Option` fields.
fn optional<T: DeserializeOwned>(raw: &mut Map<String, Value>, field: &str, target: &mut T) -> TrainingResult<()> {
    if let Some(value) = raw.remove(field) {
        *target = parse_field(field, value)?;
    }
    Ok(())
}

fn raw_mapping(raw: &mut Map<String, Value>, field: &str) -> TrainingResult<Option<Map<String, Value>>> {
    match raw.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(TrainingError::config(field, format!("expected a mapping, got {other}"))),
    }
}

fn args_input<T>(raw: &mut Map<String, Value>, field: &str) -> TrainingResult<Option<ArgsInput<T>>> {
    Ok(raw_mapping(raw, field)?.map(ArgsInput::Partial))
}

/// Read a config file into a raw mapping. The format follows the extension:
/// `.toml`, `.yaml`/`.yml` or `.json`.
pub fn load_config_file(path: &Path) -> TrainingResult<Map<String, Value>> {
    let contents = std::fs::read_to_string(path)?;
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    let value: Value = match extension.as_deref() {
        Some("toml") => toml::from_str(&contents).map_err(|e| TrainingError::config("config", e.to_string()))?,
        Some("yaml" | "yml") => {
            serde_yaml::from_str(&contents).map_err(|e| TrainingError::config("config", e.to_string()))?
        }
        Some("json") => serde_json::from_str(&contents).map_err(|e| TrainingError::config("config", e.to_string()))?,
        _ => {
            return Err(TrainingError::config(
                "config",
                format!("unsupported config file '{}', expected .toml, .yaml, .yml or .json", path.display()),
            ));
        }
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(TrainingError::config("config", format!("'{}' must contain a mapping", path.display()))),
    }
}

/// Apply `key=value` overrides. Keys may be dotted (`optim_args.lr=0.1`).
/// Values are parsed as JSON and fall back to plain strings.
pub fn apply_overrides(raw: &mut Map<String, Value>, overrides: &[String]) -> TrainingResult<()> {
    for entry in overrides {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(TrainingError::config(entry.clone(), "override must have the form key=value"));
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        let parts: Vec<&str> = key.trim().split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(TrainingError::config(key, "override key has an empty segment"));
        }
        insert_path(raw, &parts, value, key)?;
    }
    Ok(())
}

fn insert_path(map: &mut Map<String, Value>, parts: &[&str], value: Value, key: &str) -> TrainingResult<()> {
    let Some((last, parents)) = parts.split_last() else {
        return Ok(());
    };
    let mut current = map;
    for part in parents {
        let entry = current.entry((*part).to_string()).or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        current = entry
            .as_object_mut()
            .ok_or_else(|| TrainingError::config(key, format!("`{part}` is not a mapping")))?;
    }
    current.insert((*last).to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn raw(value: Value) -> ConfigInput {
        ConfigInput::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults_from_minimal_input() {
        let config = validate_config(raw(json!({"out": "run", "data": "images", "model": "reference/tiny"}))).unwrap();
        assert_eq!(config.method, "distillation");
        assert_eq!(config.epochs, 100);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.num_nodes, 1);
        assert!(config.devices.is_auto());
        assert_eq!(config.precision, Precision::Full);
        assert_eq!(config.callbacks, None);
    }

    #[test]
    fn test_unknown_field_is_named() {
        let err = validate_config(raw(json!({"out": "o", "data": "d", "model": "m", "epoch": 3}))).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigValidation { ref field, .. } if field == "epoch"));
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let err = validate_config(raw(json!({"data": "d", "model": "m"}))).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigValidation { ref field, .. } if field == "out"));

        let err = validate_config(raw(json!({"out": "o", "data": "d", "model": "m", "epochs": "ten"}))).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigValidation { ref field, .. } if field == "epochs"));

        let err = validate_config(raw(json!({"out": "o", "data": "d", "model": {"name": "m"}}))).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigValidation { ref field, .. } if field == "model"));

        let err = validate_config(raw(json!({"out": "o", "data": "d", "model": "m", "batch_size": 0}))).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigValidation { ref field, .. } if field == "batch_size"));
    }

    #[test]
    fn test_auto_fields_and_nested_args() {
        let config = validate_config(raw(json!({
            "out": "o",
            "data": ["a", "b"],
            "model": "m",
            "devices": [0, 1],
            "num_workers": 4,
            "accelerator": "cpu",
            "precision": "bf16-mixed",
            "callbacks": {"early_stopping": null},
        })))
        .unwrap();
        assert_eq!(config.devices, Auto::Explicit(Devices::Indices(vec![0, 1])));
        assert_eq!(config.num_workers, Auto::Explicit(4));
        assert_eq!(config.accelerator, Auto::Explicit(Accelerator::Cpu));
        assert_eq!(config.precision, Precision::BFloat16Mixed);
        assert_eq!(config.data.paths().len(), 2);
        assert!(matches!(config.callbacks, Some(ArgsInput::Partial(ref map)) if map["early_stopping"].is_null()));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let once = validate_config(raw(json!({"out": "o", "data": "d", "model": "m", "seed": 7}))).unwrap();
        let twice = validate_config(once.clone().into()).unwrap();
        assert_eq!(once, twice);

        let reparsed = validate_config(raw(once.to_value().unwrap())).unwrap();
        assert_eq!(once, reparsed);
    }

    #[test]
    fn test_apply_overrides() {
        let mut map = Map::new();
        map.insert("optim_args".to_string(), json!({"momentum": 0.9}));
        apply_overrides(
            &mut map,
            &["epochs=3".to_string(), "optim_args.lr=0.1".to_string(), "out=runs/a".to_string(), "callbacks.early_stopping=null".to_string()],
        )
        .unwrap();
        assert_eq!(map["epochs"], json!(3));
        assert_eq!(map["optim_args"], json!({"momentum": 0.9, "lr": 0.1}));
        assert_eq!(map["out"], json!("runs/a"));
        assert_eq!(map["callbacks"], json!({"early_stopping": null}));

        assert!(apply_overrides(&mut map, &["epochs".to_string()]).is_err());
        assert!(apply_overrides(&mut map, &["epochs.x=1".to_string()]).is_err());
    }

    #[test]
    fn test_load_config_file_formats() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("train.toml");
        std::fs::write(&toml_path, "out = \"o\"\nepochs = 2\n[optim_args]\nlr = 0.5\n").unwrap();
        let map = load_config_file(&toml_path).unwrap();
        assert_eq!(map["epochs"], json!(2));
        assert_eq!(map["optim_args"]["lr"], json!(0.5));

        let yaml_path = temp.path().join("train.yaml");
        std::fs::write(&yaml_path, "out: o\ndata: [a, b]\n").unwrap();
        assert_eq!(load_config_file(&yaml_path).unwrap()["data"], json!(["a", "b"]));

        let txt_path = temp.path().join("train.txt");
        std::fs::write(&txt_path, "").unwrap();
        assert!(load_config_file(&txt_path).unwrap_err().is_config_validation());
    }
}
