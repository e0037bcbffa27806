//! Lumen CLI - command-line entry point for self-supervised training runs.
//!
//! Reads a config file plus `key=value` overrides and hands them to
//! `lumen-train`.

mod commands;
mod progress;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Lumen - self-supervised training orchestration
#[derive(Parser, Debug)]
#[command(name = "lumen", author, version, about = "Lumen - self-supervised training orchestration")]
struct Args {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model
    ///
    /// Validates and resolves the config, runs training and exports the
    /// model to `<out>/exported_models/exported_last.pt`.
    Train {
        /// Config file (.toml, .yaml, .yml or .json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,

        /// Overrides such as `epochs=10` or `optim_args.lr=0.1`
        overrides: Vec<String>,
    },

    /// Validate a config without training and print it as JSON
    Validate {
        /// Config file (.toml, .yaml, .yml or .json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides such as `epochs=10` or `optim_args.lr=0.1`
        overrides: Vec<String>,
    },

    /// List the available self-supervised methods
    ListMethods {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the models the built-in packages can build by name
    ListModels {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Train { config, no_progress, overrides } => {
            commands::train::execute(config.as_deref(), &overrides, &args.log_level, !no_progress).await
        }
        Command::Validate { config, overrides } => commands::validate::execute(config.as_deref(), &overrides),
        Command::ListMethods { json } => commands::list::methods(json),
        Command::ListModels { json } => commands::list::models(json),
    }
}
