// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Error Handler
//
// Outermost layer of a channel. Redelivers the wrapped unit per the matching
// OnException handler's policy (falling back to the route's), then either
// runs that handler, moves the exchange to the dead letter endpoint, or
// propagates the failure marked as exhausted so enclosing channels do not
// redeliver it again.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::processors::try_catch::caught;
use crate::application::route_context::{OnExceptionHandler, OnExceptionTable};
use crate::domain::endpoint::Endpoint;
use crate::domain::errors::ProcessingError;
use crate::domain::events::ExchangeEvent;
use crate::domain::exchange::{props, Exchange, Message};
use crate::domain::processor::{Processor, ProcessorRef};
use crate::domain::route::ErrorHandlerDefinition;
use crate::infrastructure::event_bus::EventBus;

pub struct ErrorHandlerProcessor {
    route_id: String,
    label: String,
    definition: ErrorHandlerDefinition,
    on_exceptions: OnExceptionTable,
    dead_letter: Option<Arc<dyn Endpoint>>,
    event_bus: EventBus,
    inner: ProcessorRef,
}

/// Route-level collaborators shared by every error handler of one route.
#[derive(Clone)]
pub struct ErrorHandlerParts {
    pub route_id: String,
    pub definition: ErrorHandlerDefinition,
    pub on_exceptions: OnExceptionTable,
    /// Resolved endpoint of a dead letter handler.
    pub dead_letter: Option<Arc<dyn Endpoint>>,
    pub event_bus: EventBus,
}

impl ErrorHandlerProcessor {
    pub fn new(label: impl Into<String>, parts: ErrorHandlerParts, inner: ProcessorRef) -> Self {
        Self {
            route_id: parts.route_id,
            label: label.into(),
            definition: parts.definition,
            on_exceptions: parts.on_exceptions,
            dead_letter: parts.dead_letter,
            event_bus: parts.event_bus,
            inner,
        }
    }

    fn matching_handler(&self, error: &ProcessingError, exchange: &mut Exchange) -> Option<Arc<OnExceptionHandler>> {
        let handlers = self.on_exceptions.read().clone();
        if handlers.is_empty() {
            return None;
        }
        exchange.set_exception(Some(error.clone()));
        let found = handlers.into_iter().find(|handler| handler.matches(error, exchange));
        exchange.set_exception(None);
        found
    }

    async fn exhausted(
        &self,
        exchange: &mut Exchange,
        error: ProcessingError,
        handler: Option<Arc<OnExceptionHandler>>,
        original: Message,
    ) -> Result<(), ProcessingError> {
        exchange.set_property(props::REDELIVERY_EXHAUSTED, true);

        if let Some(handler) = handler {
            debug!(step = %self.label, handler = %handler.label, error = %error, "Running exception handler");
            if handler.config.use_original_message {
                exchange.message = original;
            }
            exchange.set_property(props::EXCEPTION_CAUGHT, caught(&error));
            exchange.set_exception(None);
            handler.pipeline.process(exchange).await?;

            if handler.config.handled {
                exchange.set_property(props::FAILURE_HANDLED, true);
                exchange.stop_route();
                return Ok(());
            }
            if handler.config.continued {
                exchange.remove_property(props::REDELIVERY_EXHAUSTED);
                return Ok(());
            }
            exchange.set_exception(Some(error.clone()));
            return Err(error);
        }

        if let ErrorHandlerDefinition::DeadLetter {
            uri,
            use_original_message,
            ..
        } = &self.definition
        {
            if let Some(endpoint) = &self.dead_letter {
                if *use_original_message {
                    exchange.message = original;
                }
                exchange.set_property(props::EXCEPTION_CAUGHT, caught(&error));
                exchange.set_exception(None);
                if let Err(e) = endpoint.send(exchange).await {
                    warn!(step = %self.label, endpoint = %uri, error = %e, "Dead letter delivery failed");
                    exchange.set_exception(Some(error.clone()));
                    return Err(error);
                }
                info!(step = %self.label, endpoint = %uri, error = %error, "Exchange moved to dead letter endpoint");
                exchange.set_property(props::FAILURE_HANDLED, true);
                exchange.stop_route();
                return Ok(());
            }
        }

        exchange.set_exception(Some(error.clone()));
        Err(error)
    }
}

#[async_trait]
impl Processor for ErrorHandlerProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        if self.definition == ErrorHandlerDefinition::None {
            return self.inner.process(exchange).await;
        }

        let original = exchange.message.clone();
        let mut attempt: u32 = 0;
        loop {
            let error = match self.inner.process(exchange).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            if exchange.property(props::REDELIVERY_EXHAUSTED).is_some() {
                // already handled by an enclosing unit's channel
                return Err(error);
            }

            let handler = self.matching_handler(&error, exchange);
            let policy = handler
                .as_ref()
                .and_then(|h| h.config.redelivery.clone())
                .unwrap_or_else(|| self.definition.redelivery());

            if attempt >= policy.maximum_redeliveries {
                return self.exhausted(exchange, error, handler, original).await;
            }

            attempt += 1;
            let delay = policy.delay_for(attempt);
            metrics::counter!("conduit_redeliveries_total", "route" => self.route_id.clone()).increment(1);
            warn!(
                step = %self.label,
                exchange_id = %exchange.id(),
                attempt,
                max = policy.maximum_redeliveries,
                ?delay,
                error = %error,
                "Redelivering exchange"
            );
            self.event_bus.publish_exchange_event(ExchangeEvent::RedeliveryAttempted {
                route_id: self.route_id.clone(),
                exchange_id: exchange.id(),
                attempt,
                error: error.to_string(),
            });
            exchange.set_exception(None);
            exchange.set_property(props::REDELIVERY_COUNTER, attempt);
            tokio::time::sleep(delay).await;
        }
    }
}
