// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the conduit CLI

pub mod config;
pub mod kinds;
pub mod selfcheck;

pub use self::config::ConfigCommand;
