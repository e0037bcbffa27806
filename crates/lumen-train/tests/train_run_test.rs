//! End-to-end runs through `train_from_config`.

mod common;

use common::{harness, image_dir, raw_config};
use lumen_train::callbacks::CallbackKind;
use lumen_train::checkpoint::Checkpoint;
use lumen_train::model::package::ExportedModel;
use lumen_train::{
    train_from_config, validate_config, ConfigInput, ResumeFrom, RunManifest, RunState, TrainingError,
};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn test_full_run_produces_layout() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 10);
    let out = temp.path().join("out");
    let h = harness(false);

    let report = train_from_config(raw_config(&out, &data, json!({})), h.options).await.unwrap();

    assert_eq!(report.state, RunState::Exported);
    assert_eq!(
        h.sink.states(),
        vec![RunState::Validated, RunState::Resolving, RunState::Ready, RunState::Fitting, RunState::Exported]
    );
    assert!(out.join("train.log").is_file());
    assert!(out.join("metrics.jsonl").is_file());
    assert!(out.join("csv_logs").join("metrics.csv").is_file());
    assert!(out.join("csv_logs").join("hparams.yaml").is_file());
    assert!(out.join("checkpoints").join("last.ckpt").is_file());
    assert_eq!(report.exported_model, out.join("exported_models").join("exported_last.pt"));

    let exported: ExportedModel = serde_json::from_slice(&std::fs::read(&report.exported_model).unwrap()).unwrap();
    assert_eq!(exported.package, "reference");
    assert_eq!(exported.feature_dim, 64);

    let manifest: RunManifest =
        serde_json::from_str(&std::fs::read_to_string(out.join("training_manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest.run_id, report.run_id);
    assert_eq!(manifest.dataset_id, report.manifest.as_ref().unwrap().dataset_id);
    assert_eq!(manifest.metrics.epochs_completed, 2);
    assert!(manifest.artifacts.len() >= 2);

    let log = std::fs::read_to_string(out.join("train.log")).unwrap();
    assert!(log.contains("resolved config"));

    // 10 images, batch size 4, drop_last: 2 batches per epoch.
    assert_eq!(report.summary.global_step, 4);
    assert!(!h.log.index_paths.lock().unwrap()[0].exists());
}

#[tokio::test]
async fn test_resolved_config_has_no_auto_and_revalidates() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let h = harness(false);

    let report = train_from_config(raw_config(&temp.path().join("out"), &data, json!({"method": "simclr"})), h.options)
        .await
        .unwrap();

    let config = &report.config;
    for field in ["num_workers", "devices", "accelerator", "strategy", "optim"] {
        assert_ne!(config[field], json!("auto"), "{field} still auto");
    }
    assert_eq!(config["optim"], json!("lars"));
    assert_eq!(config["method_args"]["hidden_dim"], json!(64));
    assert_eq!(config["method_args"]["output_dim"], json!(64));
    assert_eq!(config["num_workers"], json!(3));
    assert_eq!(config["strategy"], json!("single_device"));

    let revalidated = validate_config(ConfigInput::from_value(config.clone()).unwrap()).unwrap();
    assert_eq!(revalidated.to_value().unwrap()["batch_size"], config["batch_size"]);
}

#[tokio::test]
async fn test_simclr_head_follows_embedding_dim() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let extra = json!({"method": "simclr", "model": "reference/small", "embed_dim": 200});
    let report = train_from_config(raw_config(&temp.path().join("out"), &data, extra), harness(false).options)
        .await
        .unwrap();

    assert_eq!(report.config["method_args"]["hidden_dim"], json!(200));
    assert_eq!(report.config["method_args"]["output_dim"], json!(128));
}

#[tokio::test]
async fn test_scenario_a_default_callbacks() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let h = harness(false);
    train_from_config(raw_config(&temp.path().join("out"), &data, json!({"epochs": 1})), h.options).await.unwrap();

    assert_eq!(
        h.log.callback_kinds(),
        vec![
            CallbackKind::ProgressBar,
            CallbackKind::LearningRateMonitor,
            CallbackKind::DeviceStatsMonitor,
            CallbackKind::EarlyStopping,
            CallbackKind::ModelExport,
            CallbackKind::ModelCheckpoint,
        ]
    );
}

#[tokio::test]
async fn test_scenario_b_disabled_early_stopping() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let h = harness(false);
    let extra = json!({"epochs": 1, "callbacks": {"early_stopping": null}});
    train_from_config(raw_config(&temp.path().join("out"), &data, extra), h.options).await.unwrap();

    let kinds = h.log.callback_kinds();
    assert_eq!(kinds.len(), 5);
    assert!(!kinds.contains(&CallbackKind::EarlyStopping));
}

#[tokio::test]
async fn test_scenario_c_zero_epochs_saves_then_exports() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let out = temp.path().join("out");
    let h = harness(false);
    let report = train_from_config(raw_config(&out, &data, json!({"epochs": 0})), h.options).await.unwrap();

    assert_eq!(h.log.calls(), vec!["fit".to_string(), "save_checkpoint".to_string()]);
    let checkpoint = Checkpoint::load(&out.join("checkpoints").join("last.ckpt")).unwrap();
    assert_eq!(checkpoint.global_step, 0);
    assert!(report.exported_model.is_file());
    assert_eq!(report.summary.epochs_completed, 0);
}

#[tokio::test]
async fn test_scenario_d_partial_model_checkpoint_args() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let h = harness(false);
    let extra = json!({"epochs": 1, "callbacks": {"model_checkpoint": {"every_n_epochs": 5}}});
    let report = train_from_config(raw_config(&temp.path().join("out"), &data, extra), h.options).await.unwrap();

    let checkpoint = &report.config["callbacks"]["model_checkpoint"];
    assert_eq!(checkpoint["every_n_epochs"], json!(5));
    assert_eq!(checkpoint["save_last"], json!(true));
    assert_eq!(h.log.callback_kinds().len(), 6);
}

#[tokio::test]
async fn test_resume_continues_from_last_checkpoint() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let out = temp.path().join("out");
    train_from_config(raw_config(&out, &data, json!({"epochs": 1})), harness(false).options).await.unwrap();

    // A finished run without resume or overwrite refuses the directory.
    let err = train_from_config(raw_config(&out, &data, json!({"epochs": 2})), harness(false).options)
        .await
        .unwrap_err();
    assert!(err.is_resolution());

    let h = harness(false);
    let report = train_from_config(raw_config(&out, &data, json!({"epochs": 2, "resume": true})), h.options)
        .await
        .unwrap();
    assert_eq!(
        *h.log.resume.lock().unwrap(),
        Some(ResumeFrom::Checkpoint(out.join("checkpoints").join("last.ckpt")))
    );
    assert_eq!(report.summary.epochs_completed, 1);
}

#[tokio::test]
async fn test_resume_without_epochs_keeps_checkpoint_position() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let out = temp.path().join("out");
    let last = out.join("checkpoints").join("last.ckpt");
    train_from_config(raw_config(&out, &data, json!({})), harness(false).options).await.unwrap();
    let before = Checkpoint::load(&last).unwrap();
    assert_eq!((before.epoch, before.global_step), (1, 4));

    let h = harness(false);
    train_from_config(raw_config(&out, &data, json!({"epochs": 0, "resume": true})), h.options).await.unwrap();

    assert_eq!(h.log.calls(), vec!["fit".to_string(), "save_checkpoint".to_string()]);
    let after = Checkpoint::load(&last).unwrap();
    assert_eq!((after.epoch, after.global_step), (1, 4));
    assert_eq!(after.optimizer_state, before.optimizer_state);
    assert!(!after.optimizer_state.is_null());
}

#[tokio::test]
async fn test_resume_with_checkpoint_fails_and_cleans_up() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let ckpt = temp.path().join("weights.ckpt");
    std::fs::write(&ckpt, "{}").unwrap();
    let index_dir = TempDir::new().unwrap();
    let mut h = harness(false);
    h.options.index_dir = Some(index_dir.path().to_path_buf());
    let extra = json!({"resume": true, "checkpoint": ckpt});
    let err = train_from_config(raw_config(&temp.path().join("out"), &data, extra), h.options).await.unwrap_err();

    assert!(err.is_resolution());
    assert!(h.log.calls().is_empty());
    assert_eq!(h.sink.states().last(), Some(&RunState::Failed));
    assert_eq!(std::fs::read_dir(index_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_manifest_failure_keeps_exported_run() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let out = temp.path().join("out");
    // A directory in the manifest's place makes writing it fail.
    std::fs::create_dir_all(out.join("training_manifest.json").join("blocked")).unwrap();
    let h = harness(false);
    let report = train_from_config(raw_config(&out, &data, json!({"overwrite": true})), h.options).await.unwrap();

    assert_eq!(report.state, RunState::Exported);
    assert!(report.manifest.is_none());
    assert!(report.exported_model.is_file());
    assert_eq!(h.sink.states().last(), Some(&RunState::Exported));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_non_utf8_image_name_is_trained_on() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    std::fs::write(data.join(OsStr::from_bytes(b"bad\xff.png")), [7u8; 16]).unwrap();
    let report = train_from_config(raw_config(&temp.path().join("out"), &data, json!({})), harness(false).options)
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Exported);
}

#[tokio::test]
async fn test_fit_failure_removes_index_file() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let out = temp.path().join("out");
    let h = harness(true);
    let err = train_from_config(raw_config(&out, &data, json!({})), h.options).await.unwrap_err();

    assert!(matches!(err, TrainingError::Trainer(_)));
    let index_paths = h.log.index_paths.lock().unwrap().clone();
    assert_eq!(index_paths.len(), 1);
    assert!(!index_paths[0].exists());
    assert!(!out.join("exported_models").join("exported_last.pt").exists());
    assert_eq!(h.sink.states().last(), Some(&RunState::Failed));
}

#[tokio::test]
async fn test_unknown_field_fails_before_touching_disk() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);
    let out = temp.path().join("out");
    let h = harness(false);
    let err = train_from_config(raw_config(&out, &data, json!({"learning_rate": 0.1})), h.options)
        .await
        .unwrap_err();

    assert!(matches!(err, TrainingError::ConfigValidation { ref field, .. } if field == "learning_rate"));
    assert!(!out.exists());
    assert_eq!(h.sink.states(), vec![RunState::Failed]);
}

#[tokio::test]
async fn test_unknown_method_and_model_fail_resolution() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 8);

    let err = train_from_config(raw_config(&temp.path().join("a"), &data, json!({"method": "byol"})), harness(false).options)
        .await
        .unwrap_err();
    assert!(err.is_resolution());
    assert!(err.to_string().contains("distillation"));

    let extra = json!({"model": "reference/huge"});
    let err = train_from_config(raw_config(&temp.path().join("b"), &data, extra), harness(false).options)
        .await
        .unwrap_err();
    assert!(err.is_resolution());
}

#[tokio::test]
async fn test_indivisible_batch_size_fails() {
    let temp = TempDir::new().unwrap();
    let data = image_dir(temp.path(), 9);
    let h = harness(false);
    let extra = json!({"devices": 2, "batch_size": 5});
    let err = train_from_config(raw_config(&temp.path().join("out"), &data, extra), h.options).await.unwrap_err();
    assert!(err.is_resolution());
    assert!(h.log.calls().is_empty());
}
