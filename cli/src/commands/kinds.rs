// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `conduit kinds` - list the built-in step kinds and whether the loaded
//! configuration disables them.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use conduit_core::{EngineConfig, StepKind};

const CROSS_CUTTING: &[&str] = &["on_exception", "on_completion", "intercept"];

pub async fn execute(config_override: Option<PathBuf>) -> Result<()> {
    let config = EngineConfig::load_or_default(config_override).context("Failed to load configuration")?;

    println!("{}", "Built-in step kinds:".bold());
    for kind in StepKind::BUILTIN_KINDS {
        let mut line = format!("  {kind:<22}");
        if CROSS_CUTTING.contains(kind) {
            line.push_str(&format!(" {}", "cross-cutting".cyan()));
        }
        if config.is_kind_disabled(kind) {
            line.push_str(&format!(" {}", "disabled".yellow()));
        }
        println!("{line}");
    }

    println!();
    println!("{} kinds", StepKind::BUILTIN_KINDS.len());
    Ok(())
}
