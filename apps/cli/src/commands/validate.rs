//! Validate command implementation.

use super::load_raw_config;
use anyhow::{Context, Result};
use lumen_train::{validate_config, ConfigInput};
use std::path::Path;

pub fn execute(config: Option<&Path>, overrides: &[String]) -> Result<()> {
    let raw = load_raw_config(config, overrides)?;
    let validated = validate_config(ConfigInput::Raw(raw)).context("Config is invalid")?;
    validated.method_kind().context("Config is invalid")?;
    println!("{}", serde_json::to_string_pretty(&validated.to_value()?)?);
    Ok(())
}
