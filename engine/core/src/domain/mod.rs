// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod aggregation;
pub mod comparator;
pub mod config;
pub mod endpoint;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod executor;
pub mod expression;
pub mod idempotent;
pub mod policy;
pub mod processor;
pub mod registry;
pub mod route;
pub mod saga;
pub mod step;
