// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod advice_with;
pub mod channel;
pub mod context;
pub mod contract;
pub mod error_handler;
pub mod processors;
pub mod reifiers;
pub mod route_assembly;
pub mod route_context;
pub mod services;
pub mod unit_of_work;
