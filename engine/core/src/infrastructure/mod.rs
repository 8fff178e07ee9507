// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod aggregation_repository;
pub mod endpoints;
pub mod event_bus;
pub mod executor;
pub mod idempotent_repository;
pub mod registry;
pub mod saga;
