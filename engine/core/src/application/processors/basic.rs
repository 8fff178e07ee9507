// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Message transformation and delivery units

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use super::producer_cache::ProducerCache;
use crate::domain::endpoint::Endpoint;
use crate::domain::errors::ProcessingError;
use crate::domain::exchange::{props, Exchange, ExchangePattern};
use crate::domain::expression::ExpressionRef;
use crate::domain::processor::Processor;
use crate::domain::step::LogLevel;

/// Sends to an endpoint resolved at assembly time.
pub struct SendProcessor {
    endpoint: Arc<dyn Endpoint>,
    pattern: Option<ExchangePattern>,
}

impl SendProcessor {
    pub fn new(endpoint: Arc<dyn Endpoint>, pattern: Option<ExchangePattern>) -> Self {
        Self { endpoint, pattern }
    }
}

#[async_trait]
impl Processor for SendProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let previous = exchange.pattern;
        if let Some(pattern) = self.pattern {
            exchange.pattern = pattern;
        }
        exchange.set_property(props::TO_ENDPOINT, self.endpoint.uri());
        let result = self.endpoint.send(exchange).await;
        exchange.pattern = previous;
        result
    }
}

/// Sends to a uri computed per exchange.
pub struct SendDynamicProcessor {
    uri: ExpressionRef,
    cache: ProducerCache,
    ignore_invalid_endpoint: bool,
}

impl SendDynamicProcessor {
    pub fn new(uri: ExpressionRef, cache: ProducerCache, ignore_invalid_endpoint: bool) -> Self {
        Self {
            uri,
            cache,
            ignore_invalid_endpoint,
        }
    }
}

#[async_trait]
impl Processor for SendDynamicProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let uri = match self.uri.evaluate(exchange)? {
            Value::String(uri) => uri,
            other => {
                return Err(ProcessingError::InvalidDestination {
                    uri: other.to_string(),
                    reason: "destination is not a string".to_string(),
                })
            }
        };
        let endpoint = match self.cache.acquire(&uri) {
            Ok(endpoint) => endpoint,
            Err(e) if self.ignore_invalid_endpoint => {
                warn!(uri = %uri, error = %e, "Ignoring invalid dynamic endpoint");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        exchange.set_property(props::TO_ENDPOINT, uri);
        endpoint.send(exchange).await
    }
}

pub struct LogProcessor {
    message: ExpressionRef,
    level: LogLevel,
    category: String,
}

impl LogProcessor {
    pub fn new(message: ExpressionRef, level: LogLevel, category: impl Into<String>) -> Self {
        Self {
            message,
            level,
            category: category.into(),
        }
    }
}

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let message = match self.message.evaluate(exchange)? {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let category = self.category.as_str();
        let exchange_id = exchange.id();
        match self.level {
            LogLevel::Trace => trace!(category, %exchange_id, "{message}"),
            LogLevel::Debug => debug!(category, %exchange_id, "{message}"),
            LogLevel::Info => info!(category, %exchange_id, "{message}"),
            LogLevel::Warn => warn!(category, %exchange_id, "{message}"),
            LogLevel::Error => error!(category, %exchange_id, "{message}"),
        }
        Ok(())
    }
}

/// Where a computed value is written.
#[derive(Debug, Clone)]
pub enum Target {
    Header(String),
    Property(String),
    Body,
}

pub struct SetValueProcessor {
    target: Target,
    value: ExpressionRef,
}

impl SetValueProcessor {
    pub fn new(target: Target, value: ExpressionRef) -> Self {
        Self { target, value }
    }
}

#[async_trait]
impl Processor for SetValueProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let value = self.value.evaluate(exchange)?;
        match &self.target {
            Target::Header(name) => exchange.set_header(name.clone(), value),
            Target::Property(name) => exchange.set_property(name.clone(), value),
            Target::Body => exchange.set_body(value),
        }
        Ok(())
    }
}

pub struct RemoveHeaderProcessor {
    name: String,
}

impl RemoveHeaderProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Processor for RemoveHeaderProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        exchange.remove_header(&self.name);
        Ok(())
    }
}

pub struct StopProcessor;

#[async_trait]
impl Processor for StopProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        exchange.stop_route();
        Ok(())
    }
}
