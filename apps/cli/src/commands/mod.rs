//! Command implementations.

pub mod list;
pub mod train;
pub mod validate;

use anyhow::{Context, Result};
use lumen_train::{apply_overrides, load_config_file};
use serde_json::{Map, Value};
use std::path::Path;

/// Raw config from an optional file with `key=value` overrides applied on top.
pub fn load_raw_config(config: Option<&Path>, overrides: &[String]) -> Result<Map<String, Value>> {
    let mut raw = match config {
        Some(path) => {
            load_config_file(path).with_context(|| format!("Failed to load config from {}", path.display()))?
        }
        None => Map::new(),
    };
    apply_overrides(&mut raw, overrides).context("Invalid override")?;
    Ok(raw)
}
