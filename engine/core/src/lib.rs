// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Conduit Core
//!
//! Route model, reification engine and EIP runtime.
//!
//! # Architecture
//!
//! - **domain:** route model, step kinds, exchanges, collaborator traits
//! - **application:** reifiers, channels, runtime units, route assembly
//! - **infrastructure:** in-memory registries, repositories, event bus,
//!   tokio-backed executors

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::advice_with::AdviceWith;
pub use application::context::EngineContext;
pub use application::route_assembly::RuntimeRoute;
pub use domain::config::EngineConfig;
pub use domain::errors::{AssemblyError, ProcessingError};
pub use domain::exchange::Exchange;
pub use domain::route::{RouteDefinition, StepDefinition};
pub use domain::step::StepKind;
