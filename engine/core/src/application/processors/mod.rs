// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Runtime units produced by the reifiers.

pub mod aggregate;
pub mod basic;
pub mod choice;
pub mod idempotent;
pub mod multicast;
pub mod pipeline;
pub mod policy;
pub mod producer_cache;
pub mod resequence;
pub mod routing_slip;
pub mod saga;
pub mod throttle;
pub mod timing;
pub mod try_catch;

pub use pipeline::Pipeline;
