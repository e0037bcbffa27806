//! Shared fixtures for the run integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use lumen_train::callbacks::CallbackKind;
use lumen_train::checkpoint::CheckpointModels;
use lumen_train::transform::NormalizeArgs;
use lumen_train::{
    Accelerator, FitInputs, FitSummary, HardwareInfo, LocalTrainerFactory, ProgressEvent, ProgressSink, ResumeFrom,
    RunOptions, RunState, Strategy, Trainer, TrainerFactory, TrainerSpec, TrainingError, TrainingResult,
};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Create `count` placeholder images under `root/images`.
pub fn image_dir(root: &Path, count: usize) -> PathBuf {
    let dir = root.join("images");
    std::fs::create_dir_all(dir.join("nested")).unwrap();
    for i in 0..count {
        let sub = if i % 2 == 0 { dir.clone() } else { dir.join("nested") };
        std::fs::write(sub.join(format!("img_{i:03}.png")), [i as u8; 16]).unwrap();
    }
    std::fs::write(dir.join("notes.txt"), "not an image").unwrap();
    dir
}

/// Minimal raw config for a short CPU run on the tiny reference model.
pub fn raw_config(out: &Path, data: &Path, extra: Value) -> Map<String, Value> {
    let mut config = json!({
        "out": out,
        "data": data,
        "model": "reference/tiny",
        "epochs": 2,
        "batch_size": 4,
        "accelerator": "cpu",
    });
    lumen_train::args::merge_json(&mut config, &extra);
    match config {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn states(&self) -> Vec<RunState> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::State { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// What the recording trainer observed.
#[derive(Debug, Default)]
pub struct CallLog {
    pub calls: Mutex<Vec<String>>,
    pub index_paths: Mutex<Vec<PathBuf>>,
    pub callback_kinds: Mutex<Vec<CallbackKind>>,
    pub resume: Mutex<Option<ResumeFrom>>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn callback_kinds(&self) -> Vec<CallbackKind> {
        self.callback_kinds.lock().unwrap().clone()
    }
}

/// Wraps the local trainer and records what the executor asks of it.
#[derive(Debug, Default)]
pub struct RecordingTrainerFactory {
    pub log: Arc<CallLog>,
    pub fail_fit: bool,
}

impl TrainerFactory for RecordingTrainerFactory {
    fn create(&self, spec: &TrainerSpec, trainer_args: Option<&Map<String, Value>>) -> TrainingResult<Box<dyn Trainer>> {
        let inner = LocalTrainerFactory.create(spec, trainer_args)?;
        Ok(Box::new(RecordingTrainer { inner, log: self.log.clone(), fail_fit: self.fail_fit }))
    }
}

struct RecordingTrainer {
    inner: Box<dyn Trainer>,
    log: Arc<CallLog>,
    fail_fit: bool,
}

#[async_trait]
impl Trainer for RecordingTrainer {
    fn id(&self) -> &'static str {
        "recording"
    }

    fn accelerator(&self) -> Accelerator {
        self.inner.accelerator()
    }

    fn strategy(&self) -> Strategy {
        self.inner.strategy()
    }

    fn num_devices(&self) -> usize {
        self.inner.num_devices()
    }

    fn num_nodes(&self) -> usize {
        self.inner.num_nodes()
    }

    async fn fit(&self, inputs: FitInputs<'_>, resume: &ResumeFrom) -> TrainingResult<FitSummary> {
        self.log.calls.lock().unwrap().push("fit".to_string());
        let index_path = inputs.dataloader.dataset().index_path().to_path_buf();
        assert!(index_path.is_file(), "index file must exist while fitting");
        self.log.index_paths.lock().unwrap().push(index_path);
        *self.log.callback_kinds.lock().unwrap() = inputs.callbacks.iter().map(|c| c.kind()).collect();
        *self.log.resume.lock().unwrap() = Some(resume.clone());
        if self.fail_fit {
            return Err(TrainingError::Trainer("fit failed".to_string()));
        }
        self.inner.fit(inputs, resume).await
    }

    async fn save_checkpoint(&self, path: &Path, models: &CheckpointModels, normalize: &NormalizeArgs) -> TrainingResult<()> {
        self.log.calls.lock().unwrap().push("save_checkpoint".to_string());
        self.inner.save_checkpoint(path, models, normalize).await
    }
}

pub struct Harness {
    pub options: RunOptions,
    pub log: Arc<CallLog>,
    pub sink: Arc<RecordingSink>,
}

pub fn harness(fail_fit: bool) -> Harness {
    let log = Arc::new(CallLog::default());
    let sink = Arc::new(RecordingSink::default());
    let options = RunOptions {
        hardware: HardwareInfo::cpu_only(4),
        trainer_factory: Arc::new(RecordingTrainerFactory { log: log.clone(), fail_fit }),
        progress: sink.clone(),
        log_to_console: false,
        ..RunOptions::default()
    };
    Harness { options, log, sink }
}
