// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::errors::ProcessingError;
use crate::domain::events::ExchangeEvent;
use crate::domain::exchange::{props, Exchange, Synchronization};
use crate::domain::expression::{value_to_key, ExpressionRef};
use crate::domain::idempotent::IdempotentRepository;
use crate::domain::processor::{Processor, ProcessorRef};
use crate::domain::step::IdempotentConfig;
use crate::infrastructure::event_bus::EventBus;

/// Filters out exchanges whose message key was already seen.
pub struct IdempotentConsumer {
    route_id: String,
    config: IdempotentConfig,
    repository: Arc<dyn IdempotentRepository>,
    body: ProcessorRef,
    event_bus: EventBus,
}

impl IdempotentConsumer {
    /// `repository` is the resolved form of `config.repository`.
    pub fn new(
        route_id: impl Into<String>,
        config: IdempotentConfig,
        repository: Arc<dyn IdempotentRepository>,
        body: ProcessorRef,
        event_bus: EventBus,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            config,
            repository,
            body,
            event_bus,
        }
    }

    fn message_key(&self, exchange: &Exchange) -> Result<String, ProcessingError> {
        let value = self.config.key.evaluate(exchange)?;
        if value.is_null() {
            return Err(ProcessingError::Expression(format!(
                "no message id for idempotent key {}",
                self.config.key.describe()
            )));
        }
        Ok(value_to_key(&value))
    }
}

/// Settles the repository entry once the unit of work closes.
struct KeyCompletion {
    key: String,
    repository: Arc<dyn IdempotentRepository>,
    eager: bool,
    remove_on_failure: bool,
}

impl KeyCompletion {
    async fn complete(&self) {
        if !self.eager {
            if let Err(e) = self.repository.add(&self.key).await {
                warn!(key = %self.key, error = %e, "Failed to record idempotent key");
                return;
            }
        }
        if let Err(e) = self.repository.confirm(&self.key).await {
            warn!(key = %self.key, error = %e, "Failed to confirm idempotent key");
        }
    }

    async fn fail(&self) {
        if !self.remove_on_failure {
            return;
        }
        if let Err(e) = self.repository.remove(&self.key).await {
            warn!(key = %self.key, error = %e, "Failed to remove idempotent key");
        }
    }
}

#[async_trait]
impl Synchronization for KeyCompletion {
    async fn on_complete(&self, _exchange: &Exchange) {
        self.complete().await;
    }

    async fn on_failure(&self, _exchange: &Exchange) {
        self.fail().await;
    }
}

#[async_trait]
impl Processor for IdempotentConsumer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let key = self.message_key(exchange)?;
        let repository = &self.repository;

        let duplicate = if self.config.eager {
            !repository.add(&key).await?
        } else {
            repository.contains(&key).await?
        };

        if duplicate {
            debug!(route_id = %self.route_id, key = %key, "Duplicate message detected");
            exchange.set_property(props::DUPLICATE_MESSAGE, true);
            self.event_bus.publish_exchange_event(ExchangeEvent::DuplicateSkipped {
                route_id: self.route_id.clone(),
                key,
            });
            if self.config.skip_duplicate {
                return Ok(());
            }
            return self.body.process(exchange).await;
        }

        let completion = KeyCompletion {
            key,
            repository: repository.clone(),
            eager: self.config.eager,
            remove_on_failure: self.config.remove_on_failure,
        };

        if self.config.complete_eager {
            let result = self.body.process(exchange).await;
            if result.is_err() || exchange.is_failed() {
                completion.fail().await;
            } else {
                completion.complete().await;
            }
            return result;
        }

        exchange.add_synchronization(Arc::new(completion));
        self.body.process(exchange).await
    }
}
