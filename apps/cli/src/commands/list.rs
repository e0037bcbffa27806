//! List commands.

use anyhow::Result;
use colored::Colorize;
use lumen_train::{MethodKind, PackageRegistry};
use serde_json::json;

pub fn methods(json_output: bool) -> Result<()> {
    if json_output {
        let methods: Vec<_> = MethodKind::ALL
            .iter()
            .map(|m| json!({"name": m.as_str(), "default_optimizer": m.default_optimizer()}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&methods)?);
        return Ok(());
    }

    println!("{}", "Methods".bold());
    for method in MethodKind::ALL {
        let optimizers: Vec<&str> = method.supported_optimizers().iter().map(|o| o.as_str()).collect();
        println!("  {:<14} optimizers: {}", method.as_str().cyan(), optimizers.join(", ").dimmed());
    }
    Ok(())
}

pub fn models(json_output: bool) -> Result<()> {
    let names = PackageRegistry::default().list_model_names();
    if json_output {
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }

    println!("{}", "Models".bold());
    for name in names {
        println!("  {}", name.cyan());
    }
    Ok(())
}
