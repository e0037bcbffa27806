//! Integration tests for the `lumen` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn images(temp: &TempDir, count: usize) -> std::path::PathBuf {
    let dir = temp.path().join("images");
    fs::create_dir_all(&dir).unwrap();
    for i in 0..count {
        fs::write(dir.join(format!("{i}.jpg")), [0u8; 8]).unwrap();
    }
    dir
}

#[test]
fn test_list_methods() {
    Command::cargo_bin("lumen")
        .unwrap()
        .arg("list-methods")
        .assert()
        .success()
        .stdout(predicate::str::contains("distillation"))
        .stdout(predicate::str::contains("simclr"));
}

#[test]
fn test_list_models_json() {
    Command::cargo_bin("lumen")
        .unwrap()
        .args(["list-models", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("reference/tiny"));
}

#[test]
fn test_validate_applies_overrides() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("train.toml");
    fs::write(&config, "out = \"run\"\ndata = \"images\"\nmodel = \"reference/tiny\"\nepochs = 3\n").unwrap();

    Command::cargo_bin("lumen")
        .unwrap()
        .args(["validate", "--config"])
        .arg(&config)
        .args(["epochs=7", "optim_args.lr=0.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"epochs\": 7"))
        .stdout(predicate::str::contains("\"lr\": 0.5"));
}

#[test]
fn test_validate_rejects_unknown_field() {
    Command::cargo_bin("lumen")
        .unwrap()
        .args(["validate", "out=run", "data=images", "model=reference/tiny", "epoch=3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("epoch"));
}

#[test]
fn test_train_writes_exported_model() {
    let temp = TempDir::new().unwrap();
    let data = images(&temp, 6);
    let out = temp.path().join("out");

    Command::cargo_bin("lumen")
        .unwrap()
        .args(["train", "--no-progress", "model=reference/tiny", "epochs=1", "batch_size=2", "accelerator=cpu"])
        .arg(format!("out={}", out.display()))
        .arg(format!("data={}", data.display()))
        .assert()
        .success()
        .stdout(predicate::str::contains("exported model"));

    assert!(out.join("exported_models").join("exported_last.pt").is_file());
    assert!(out.join("training_manifest.json").is_file());
}
