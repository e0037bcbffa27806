//! Train command implementation.

use super::load_raw_config;
use crate::progress::IndicatifProgressSink;
use anyhow::{Context, Result};
use colored::Colorize;
use lumen_train::{train_from_config, ConfigInput, LocalRank, ProgressSink, RunOptions, TracingProgressSink};
use std::path::Path;
use std::sync::Arc;

pub async fn execute(config: Option<&Path>, overrides: &[String], log_level: &str, show_progress: bool) -> Result<()> {
    let raw = load_raw_config(config, overrides)?;
    let progress: Arc<dyn ProgressSink> =
        if show_progress { Arc::new(IndicatifProgressSink::new()) } else { Arc::new(TracingProgressSink) };
    let options = RunOptions {
        progress,
        log_filter: log_level.to_string(),
        local_rank: LocalRank::from_env().context("Invalid local rank environment")?,
        ..RunOptions::default()
    };

    let report = train_from_config(ConfigInput::Raw(raw), options).await.context("Training failed")?;

    println!("{} run {}", "✓".green(), report.run_id.to_string().dimmed());
    println!("  exported model: {}", report.exported_model.display().to_string().cyan());
    println!("  epochs: {}  steps: {}", report.summary.epochs_completed, report.summary.global_step);
    if let Some(loss) = report.manifest.as_ref().and_then(|m| m.metrics.train_loss) {
        println!("  train_loss: {loss:.4}");
    }
    Ok(())
}
