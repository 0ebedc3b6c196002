// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reef - a plugin host with native, sandboxed, and embedded plugins.
//!
//! This is the binary entry point for the Reef host.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod host;
mod plugins;
mod serve;
mod services;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reef_config::ReefConfig;

/// Reef - a plugin host with native, sandboxed, and embedded plugins.
#[derive(Parser, Debug)]
#[command(name = "reef", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the XDG hierarchy.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the host: load plugins and serve until interrupted.
    Serve,
    /// List installed builtin and uploaded plugins.
    List {
        /// Output JSON.
        #[arg(long)]
        json: bool,
        /// Disable colors.
        #[arg(long)]
        plain: bool,
    },
    /// Validate and install an uploaded plugin artifact.
    Install {
        file: PathBuf,
        /// Replace an earlier upload with the same id.
        #[arg(long)]
        replace: bool,
    },
    /// Remove an uploaded plugin.
    Remove { id: String },
    /// Enable a builtin plugin and remember the choice.
    Enable { id: String },
    /// Disable a builtin plugin and remember the choice.
    Disable { id: String },
    /// Print the effective configuration.
    Config {
        /// Output JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("reef={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}

fn render_config(config: &ReefConfig, json: bool) -> String {
    if json {
        serde_json::to_string_pretty(config).unwrap_or_else(|e| format!("error: {e}"))
    } else {
        toml::to_string_pretty(config).unwrap_or_else(|e| format!("error: {e}"))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => reef_config::load_and_validate_path(path),
        None => reef_config::load_and_validate(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(errors) => {
            reef_config::render_errors(&errors);
            std::process::exit(1);
        }
    };
    init_tracing(&config.host.log_level);

    let result = match cli.command {
        Some(Commands::Serve) => serve::run_serve(config).await,
        Some(Commands::List { json, plain }) => plugins::run_list(&config, json, plain).await,
        Some(Commands::Install { file, replace }) => {
            plugins::run_install(&config, &file, replace).await
        }
        Some(Commands::Remove { id }) => plugins::run_remove(&config, &id).await,
        Some(Commands::Enable { id }) => plugins::run_set_enabled(&config, &id, true).await,
        Some(Commands::Disable { id }) => plugins::run_set_enabled(&config, &id, false).await,
        Some(Commands::Config { json }) => {
            println!("{}", render_config(&config, json));
            Ok(())
        }
        None => {
            println!("reef: use --help for available commands");
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
