// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Engine events published on the event bus
//
// Route lifecycle, exchange outcomes inside EIP units, and saga outcomes.
// Subscribers may filter by route id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exchange::ExchangeId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouteEvent {
    RouteAdded {
        route_id: String,
        from_uri: String,
        added_at: DateTime<Utc>,
    },
    RouteStarted {
        route_id: String,
        started_at: DateTime<Utc>,
    },
    RouteStopped {
        route_id: String,
        inflight_at_stop: usize,
        stopped_at: DateTime<Utc>,
    },
    RouteRemoved {
        route_id: String,
        removed_at: DateTime<Utc>,
    },
    RouteAdvised {
        route_id: String,
        advised_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExchangeEvent {
    ExchangeCompleted {
        route_id: String,
        exchange_id: ExchangeId,
        duration_ms: u64,
    },
    ExchangeFailed {
        route_id: String,
        exchange_id: ExchangeId,
        error: String,
    },
    RedeliveryAttempted {
        route_id: String,
        exchange_id: ExchangeId,
        attempt: u32,
        error: String,
    },
    AggregateCompleted {
        route_id: String,
        correlation_key: String,
        size: usize,
        completed_by: String,
    },
    AggregateDiscarded {
        route_id: String,
        correlation_key: String,
        reason: String,
    },
    ResequenceGap {
        route_id: String,
        last_delivered: String,
        delivered: String,
    },
    ResequenceSkipped {
        route_id: String,
        sequence: String,
        reason: String,
    },
    DuplicateSkipped {
        route_id: String,
        key: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SagaEvent {
    SagaStarted {
        saga_id: String,
        started_at: DateTime<Utc>,
    },
    SagaCompleted {
        saga_id: String,
        completed_at: DateTime<Utc>,
    },
    SagaCompensated {
        saga_id: String,
        compensated_at: DateTime<Utc>,
    },
    SagaCompensationFailed {
        saga_id: String,
        endpoint: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

/// Unified event type carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Route(RouteEvent),
    Exchange(ExchangeEvent),
    Saga(SagaEvent),
}

impl EngineEvent {
    /// Route the event belongs to; saga events are not route scoped.
    pub fn route_id(&self) -> Option<&str> {
        match self {
            Self::Route(event) => Some(match event {
                RouteEvent::RouteAdded { route_id, .. }
                | RouteEvent::RouteStarted { route_id, .. }
                | RouteEvent::RouteStopped { route_id, .. }
                | RouteEvent::RouteRemoved { route_id, .. }
                | RouteEvent::RouteAdvised { route_id, .. } => route_id,
            }),
            Self::Exchange(event) => Some(match event {
                ExchangeEvent::ExchangeCompleted { route_id, .. }
                | ExchangeEvent::ExchangeFailed { route_id, .. }
                | ExchangeEvent::RedeliveryAttempted { route_id, .. }
                | ExchangeEvent::AggregateCompleted { route_id, .. }
                | ExchangeEvent::AggregateDiscarded { route_id, .. }
                | ExchangeEvent::ResequenceGap { route_id, .. }
                | ExchangeEvent::ResequenceSkipped { route_id, .. }
                | ExchangeEvent::DuplicateSkipped { route_id, .. } => route_id,
            }),
            Self::Saga(_) => None,
        }
    }
}
