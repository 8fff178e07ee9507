// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Policies and Host Hooks
//!
//! - [`Policy`]: wraps a child pipeline (e.g. a transaction boundary).
//! - [`TransactionManager`]: optional capability; when unset, `Transacted`
//!   steps need an explicit policy.
//! - [`RoutePolicy`]: per-route callbacks around lifecycle and exchanges.
//! - [`LifecycleStrategy`]: host hooks when routes are created, added or
//!   removed.
//! - [`Validator`]: input/output contract checks.

use async_trait::async_trait;

use super::errors::ProcessingError;
use super::exchange::Exchange;
use super::processor::ProcessorRef;
use super::route::RouteDefinition;
use super::step::StepInfo;

/// Conventional registry name of the default transaction policy.
pub const DEFAULT_TRANSACTION_POLICY: &str = "PROPAGATION_REQUIRED";

pub trait Policy: Send + Sync {
    /// Invoked once per applicable node before `wrap`.
    fn before_wrap(&self, _step: &StepInfo) {}

    fn wrap(&self, step: &StepInfo, processor: ProcessorRef) -> ProcessorRef;

    /// Transactional policies form an error boundary of their own.
    fn is_transactional(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<TransactionId, ProcessingError>;

    async fn commit(&self, tx: TransactionId) -> Result<(), ProcessingError>;

    async fn rollback(&self, tx: TransactionId) -> Result<(), ProcessingError>;
}

pub trait RoutePolicy: Send + Sync {
    fn on_init(&self, _route_id: &str) {}

    fn on_start(&self, _route_id: &str) {}

    fn on_stop(&self, _route_id: &str) {}

    fn on_exchange_begin(&self, _route_id: &str, _exchange: &Exchange) {}

    fn on_exchange_done(&self, _route_id: &str, _exchange: &Exchange) {}
}

pub trait LifecycleStrategy: Send + Sync {
    fn on_route_context_create(&self, _route: &RouteDefinition) {}

    fn on_route_add(&self, _route_id: &str) {}

    fn on_route_remove(&self, _route_id: &str) {}
}

/// Checks an exchange against a declared data type such as `json:object`.
pub trait Validator: Send + Sync {
    fn validate(&self, exchange: &Exchange, data_type: &str) -> Result<(), ProcessingError>;
}
