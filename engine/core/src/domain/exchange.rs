// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Exchange - the unit of data in flight through a route
//
// An exchange is created per message at the route input, flows by mutable
// reference through the runtime pipeline and is mutated in place by each
// unit. Fan-out units work on copies and fold the results back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::ProcessingError;

/// Well-known exchange property and header names.
pub mod props {
    pub const SPLIT_INDEX: &str = "ConduitSplitIndex";
    pub const SPLIT_SIZE: &str = "ConduitSplitSize";
    pub const SPLIT_COMPLETE: &str = "ConduitSplitComplete";
    pub const MULTICAST_INDEX: &str = "ConduitMulticastIndex";
    pub const AGGREGATED_SIZE: &str = "ConduitAggregatedSize";
    pub const AGGREGATED_COMPLETED_BY: &str = "ConduitAggregatedCompletedBy";
    pub const AGGREGATED_CORRELATION_KEY: &str = "ConduitAggregatedCorrelationKey";
    pub const DUPLICATE_MESSAGE: &str = "ConduitDuplicateMessage";
    pub const FILTER_MATCHED: &str = "ConduitFilterMatched";
    pub const FAILURE_HANDLED: &str = "ConduitFailureHandled";
    pub const EXCEPTION_CAUGHT: &str = "ConduitExceptionCaught";
    pub const REDELIVERY_COUNTER: &str = "ConduitRedeliveryCounter";
    /// Set once an error handler gave up; outer handlers pass the failure on.
    pub const REDELIVERY_EXHAUSTED: &str = "ConduitRedeliveryExhausted";
    pub const RESEQUENCE_GAP: &str = "ConduitResequenceGap";
    pub const SLIP_ENDPOINT: &str = "ConduitSlipEndpoint";
    pub const RECIPIENT_ENDPOINT: &str = "ConduitRecipientListEndpoint";
    pub const TO_ENDPOINT: &str = "ConduitToEndpoint";
    /// Header carrying the active saga id between routes.
    pub const SAGA_LONG_RUNNING_ACTION: &str = "Long-Running-Action";
}

/// Message exchange pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePattern {
    /// Fire-and-forget
    #[default]
    InOnly,
    /// Request-reply
    InOut,
}

/// Unique identifier for an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(pub Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body plus headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: Value,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
}

/// Callback run when the unit of work that owns an exchange closes.
#[async_trait]
pub trait Synchronization: Send + Sync {
    async fn on_complete(&self, exchange: &Exchange);
    async fn on_failure(&self, exchange: &Exchange);
}

#[derive(Clone)]
pub struct Exchange {
    id: ExchangeId,
    pub pattern: ExchangePattern,
    pub message: Message,
    properties: HashMap<String, Value>,
    exception: Option<ProcessingError>,
    route_stop: bool,
    rollback_only: bool,
    from_route_id: Option<String>,
    created_at: DateTime<Utc>,
    synchronizations: Vec<Arc<dyn Synchronization>>,
}

impl Exchange {
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            id: ExchangeId::new(),
            pattern: ExchangePattern::InOnly,
            message: Message {
                body: body.into(),
                headers: HashMap::new(),
            },
            properties: HashMap::new(),
            exception: None,
            route_stop: false,
            rollback_only: false,
            from_route_id: None,
            created_at: Utc::now(),
            synchronizations: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn body(&self) -> &Value {
        &self.message.body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.message.body = body.into();
    }

    pub fn header(&self, name: &str) -> Option<&Value> {
        self.message.headers.get(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(Value::as_str)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.message.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Value> {
        self.message.headers.remove(name)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        self.properties.remove(name)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn exception(&self) -> Option<&ProcessingError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, exception: Option<ProcessingError>) {
        self.exception = exception;
    }

    pub fn take_exception(&mut self) -> Option<ProcessingError> {
        self.exception.take()
    }

    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// Stop routing this exchange; the enclosing pipeline will not invoke
    /// further units.
    pub fn stop_route(&mut self) {
        self.route_stop = true;
    }

    pub fn set_route_stop(&mut self, stop: bool) {
        self.route_stop = stop;
    }

    pub fn is_route_stopped(&self) -> bool {
        self.route_stop
    }

    pub fn mark_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn from_route_id(&self) -> Option<&str> {
        self.from_route_id.as_deref()
    }

    pub fn set_from_route_id(&mut self, route_id: impl Into<String>) {
        if self.from_route_id.is_none() {
            self.from_route_id = Some(route_id.into());
        }
    }

    pub fn add_synchronization(&mut self, sync: Arc<dyn Synchronization>) {
        self.synchronizations.push(sync);
    }

    pub fn take_synchronizations(&mut self) -> Vec<Arc<dyn Synchronization>> {
        std::mem::take(&mut self.synchronizations)
    }

    /// Independent copy with a fresh id. Synchronizations stay with the
    /// original so the owning unit of work runs them exactly once.
    pub fn copy(&self) -> Self {
        Self {
            id: ExchangeId::new(),
            pattern: self.pattern,
            message: self.message.clone(),
            properties: self.properties.clone(),
            exception: self.exception.clone(),
            route_stop: false,
            rollback_only: self.rollback_only,
            from_route_id: self.from_route_id.clone(),
            created_at: Utc::now(),
            synchronizations: Vec::new(),
        }
    }

    /// Replace message, properties and failure state with the outcome of
    /// `other`, keeping identity and synchronizations.
    pub fn copy_results_from(&mut self, other: &Exchange) {
        self.message = other.message.clone();
        for (key, value) in &other.properties {
            self.properties.insert(key.clone(), value.clone());
        }
        self.exception = other.exception.clone();
        self.rollback_only |= other.rollback_only;
    }

    /// Move synchronizations registered on `other` onto this exchange.
    pub fn handover_synchronizations(&mut self, other: &mut Exchange) {
        self.synchronizations.append(&mut other.synchronizations);
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("message", &self.message)
            .field("properties", &self.properties)
            .field("exception", &self.exception)
            .field("route_stop", &self.route_stop)
            .field("synchronizations", &self.synchronizations.len())
            .finish()
    }
}
