// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-process endpoint registry
//
// Schemes:
// - mock:<name>   records exchanges; assertions for tests and self-checks
// - log:<category> emits the exchange through tracing
// - direct:<name> synchronous call into the route consuming that uri
//
// Endpoints registered explicitly take precedence over scheme resolution.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::endpoint::{split_uri, Consumer, Endpoint, EndpointResolver};
use crate::domain::errors::ProcessingError;
use crate::domain::exchange::Exchange;

// ============================================================================
// Mock
// ============================================================================

pub struct MockEndpoint {
    uri: String,
    received: Mutex<Vec<Exchange>>,
    count: watch::Sender<usize>,
    failures: Mutex<VecDeque<ProcessingError>>,
    always_fail: Mutex<Option<ProcessingError>>,
    delay: Mutex<Option<Duration>>,
    reply: Mutex<Option<Value>>,
}

impl MockEndpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            uri: uri.into(),
            received: Mutex::new(Vec::new()),
            count,
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            delay: Mutex::new(None),
            reply: Mutex::new(None),
        }
    }

    pub fn received_exchanges(&self) -> Vec<Exchange> {
        self.received.lock().clone()
    }

    pub fn received_bodies(&self) -> Vec<Value> {
        self.received.lock().iter().map(|e| e.body().clone()).collect()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    /// Wait until at least `expected` exchanges arrived. Returns `false` on
    /// timeout.
    pub async fn await_count(&self, expected: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Fail every exchange with `error` until cleared.
    pub fn fail_with(&self, error: ProcessingError) {
        *self.always_fail.lock() = Some(error);
    }

    /// Fail the next `times` exchanges with `error`.
    pub fn fail_next(&self, times: usize, error: ProcessingError) {
        let mut failures = self.failures.lock();
        for _ in 0..times {
            failures.push_back(error.clone());
        }
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
        *self.always_fail.lock() = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Body set on request-reply exchanges.
    pub fn set_reply(&self, body: impl Into<Value>) {
        *self.reply.lock() = Some(body.into());
    }

    pub fn reset(&self) {
        self.received.lock().clear();
        self.clear_failures();
        self.count.send_replace(0);
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let count = {
            let mut received = self.received.lock();
            received.push(exchange.clone());
            received.len()
        };
        self.count.send_replace(count);
        debug!(endpoint = %self.uri, count, "Mock received exchange");

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.always_fail.lock().clone() {
            return Err(error);
        }
        if let Some(reply) = self.reply.lock().clone() {
            exchange.set_body(reply);
        }
        Ok(())
    }
}

// ============================================================================
// Log
// ============================================================================

pub struct LogEndpoint {
    uri: String,
    category: String,
}

impl LogEndpoint {
    pub fn new(uri: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            category: category.into(),
        }
    }
}

#[async_trait]
impl Endpoint for LogEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        info!(
            category = %self.category,
            exchange_id = %exchange.id(),
            body = %exchange.body(),
            "Exchange logged"
        );
        Ok(())
    }
}

// ============================================================================
// Direct
// ============================================================================

type ConsumerTable = Arc<DashMap<String, Weak<dyn Consumer>>>;

pub struct DirectEndpoint {
    uri: String,
    consumers: ConsumerTable,
}

#[async_trait]
impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let consumer = self
            .consumers
            .get(&self.uri)
            .and_then(|entry| entry.value().upgrade());
        match consumer {
            Some(consumer) => consumer.consume(exchange).await,
            None => Err(ProcessingError::InvalidDestination {
                uri: self.uri.clone(),
                reason: "no consumers available".to_string(),
            }),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct EndpointRegistry {
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    mocks: DashMap<String, Arc<MockEndpoint>>,
    consumers: ConsumerTable,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            mocks: DashMap::new(),
            consumers: Arc::new(DashMap::new()),
        }
    }

    /// Register a custom endpoint under its own uri.
    pub fn register(&self, endpoint: Arc<dyn Endpoint>) {
        self.endpoints.insert(endpoint.uri().to_string(), endpoint);
    }

    /// The mock endpoint for `uri` (`mock:name` or plain `name`), created on
    /// first use.
    pub fn mock(&self, uri: &str) -> Arc<MockEndpoint> {
        let uri = if uri.starts_with("mock:") {
            uri.to_string()
        } else {
            format!("mock:{uri}")
        };
        self.mocks
            .entry(uri.clone())
            .or_insert_with(|| Arc::new(MockEndpoint::new(uri)))
            .value()
            .clone()
    }

    pub fn reset_mocks(&self) {
        for entry in self.mocks.iter() {
            entry.value().reset();
        }
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointResolver for EndpointRegistry {
    fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>, ProcessingError> {
        if let Some(endpoint) = self.endpoints.get(uri) {
            return Ok(endpoint.value().clone());
        }

        let (scheme, path) = split_uri(uri).ok_or_else(|| ProcessingError::InvalidDestination {
            uri: uri.to_string(),
            reason: "missing scheme".to_string(),
        })?;
        if path.is_empty() {
            return Err(ProcessingError::InvalidDestination {
                uri: uri.to_string(),
                reason: "missing endpoint name".to_string(),
            });
        }

        match scheme {
            "mock" => Ok(self.mock(uri)),
            "log" => Ok(Arc::new(LogEndpoint::new(uri, path))),
            "direct" => Ok(Arc::new(DirectEndpoint {
                uri: uri.to_string(),
                consumers: self.consumers.clone(),
            })),
            other => Err(ProcessingError::InvalidDestination {
                uri: uri.to_string(),
                reason: format!("unknown scheme '{other}'"),
            }),
        }
    }

    fn register_consumer(&self, uri: &str, consumer: Weak<dyn Consumer>) -> Result<(), ProcessingError> {
        if let Some(existing) = self.consumers.get(uri) {
            if existing.value().upgrade().is_some() {
                return Err(ProcessingError::InvalidDestination {
                    uri: uri.to_string(),
                    reason: "endpoint already has a consumer".to_string(),
                });
            }
        }
        self.consumers.insert(uri.to_string(), consumer);
        Ok(())
    }

    fn unregister_consumer(&self, uri: &str) {
        self.consumers.remove(uri);
    }
}
