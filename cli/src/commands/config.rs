// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use conduit_core::domain::config::EngineConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file holding the defaults
    Generate {
        /// Output path (default: ./conduit.yaml)
        #[arg(short, long, default_value = "./conduit.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output } => generate(output).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = EngineConfig::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!("  2. ./conduit.yaml");
        println!("  3. ~/.conduit/config.yaml");
        println!("  4. /etc/conduit/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!();
    println!("  Name: {}", config.name);
    println!("  Tracing: {}", config.tracing);
    println!("  Producer cache size: {}", config.producer_cache_size);
    println!("  Event bus capacity: {}", config.event_bus_capacity);
    println!("  Shutdown timeout: {:?}", config.shutdown_timeout);
    println!(
        "  Aggregation timeout checker: {:?}",
        config.aggregation.timeout_checker_interval
    );
    println!();

    println!("{}", "Disabled steps:".bold());
    if config.disable_all_processors {
        println!("  {}", "all processors".yellow());
    }
    if config.disable_bean_processors {
        println!("  {}", "bean processors".yellow());
    }
    for kind in &config.disabled_kinds {
        println!("  - {kind}");
    }
    println!();

    println!("{}", "Thread pool profiles:".bold());
    for profile in std::iter::once(&config.default_thread_pool).chain(&config.thread_pool_profiles) {
        println!(
            "  {} pool={} max={} keep_alive={:?} queue={} rejected={:?}",
            profile.id.bold(),
            profile.pool_size,
            profile.max_pool_size,
            profile.keep_alive,
            profile
                .max_queue_size
                .map(|size| size.to_string())
                .unwrap_or_else(|| "unbounded".to_string()),
            profile.rejected_policy
        );
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = EngineConfig::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

async fn generate(output: PathBuf) -> Result<()> {
    EngineConfig::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());
    Ok(())
}
