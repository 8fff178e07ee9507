// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Saga step
//
// Joins, creates or suspends the saga carried in the `Long-Running-Action`
// header according to the step's propagation, registers the step's actions
// with the coordinator and runs the children. Only the step that created a
// saga decides its outcome.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::domain::errors::ProcessingError;
use crate::domain::exchange::{props, Exchange, Synchronization};
use crate::domain::processor::{Processor, ProcessorRef};
use crate::domain::saga::{SagaCompletionMode, SagaCoordinator, SagaPropagation, SagaService, SagaStep};
use crate::domain::step::SagaConfig;

pub struct SagaProcessor {
    label: String,
    service: Arc<dyn SagaService>,
    config: SagaConfig,
    body: ProcessorRef,
}

/// Completes or compensates a saga when the owning unit of work closes.
struct SagaOutcome {
    saga: Arc<dyn SagaCoordinator>,
}

#[async_trait]
impl Synchronization for SagaOutcome {
    async fn on_complete(&self, _exchange: &Exchange) {
        if let Err(e) = self.saga.complete().await {
            error!(saga_id = %self.saga.id(), error = %e, "Saga completion failed");
        }
    }

    async fn on_failure(&self, _exchange: &Exchange) {
        if let Err(e) = self.saga.compensate().await {
            error!(saga_id = %self.saga.id(), error = %e, "Saga compensation failed");
        }
    }
}

impl SagaProcessor {
    pub fn new(label: impl Into<String>, service: Arc<dyn SagaService>, config: SagaConfig, body: ProcessorRef) -> Self {
        Self {
            label: label.into(),
            service,
            config,
            body,
        }
    }

    async fn current_saga(&self, exchange: &Exchange) -> Result<Option<Arc<dyn SagaCoordinator>>, ProcessingError> {
        match exchange.header_str(props::SAGA_LONG_RUNNING_ACTION) {
            Some(id) => self.service.get_saga(id).await,
            None => Ok(None),
        }
    }

    fn step_for(&self, exchange: &Exchange) -> Result<Option<SagaStep>, ProcessingError> {
        let config = &self.config;
        if config.compensation.is_none() && config.completion.is_none() {
            return Ok(None);
        }
        let mut options = HashMap::with_capacity(config.options.len());
        for (name, expression) in &config.options {
            options.insert(name.clone(), expression.evaluate(exchange)?);
        }
        Ok(Some(SagaStep {
            compensation: config.compensation.clone(),
            completion: config.completion.clone(),
            options,
            timeout: config.timeout,
        }))
    }

    async fn run_in_saga(
        &self,
        exchange: &mut Exchange,
        saga: Arc<dyn SagaCoordinator>,
        created: bool,
    ) -> Result<(), ProcessingError> {
        exchange.set_header(props::SAGA_LONG_RUNNING_ACTION, saga.id());
        if let Some(step) = self.step_for(exchange)? {
            saga.begin_step(step).await?;
        }
        debug!(step = %self.label, saga_id = %saga.id(), created, "Running saga step");

        let result = self.body.process(exchange).await;
        if !created {
            return result;
        }

        let failed = result.is_err() || exchange.is_failed();
        match self.config.completion_mode {
            SagaCompletionMode::AutoOnRouteCompletion => {
                exchange.add_synchronization(Arc::new(SagaOutcome { saga }));
                result
            }
            SagaCompletionMode::Auto if !failed => {
                result?;
                saga.complete().await
            }
            SagaCompletionMode::Auto | SagaCompletionMode::Manual => {
                if failed {
                    if let Err(e) = saga.compensate().await {
                        error!(saga_id = %saga.id(), error = %e, "Saga compensation failed");
                    }
                }
                result
            }
        }
    }

    async fn create_and_run(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let saga = self.service.new_saga().await?;
        self.run_in_saga(exchange, saga, true).await
    }

    /// Removes the saga header, returning it for [`Self::restore`].
    fn suspend(exchange: &mut Exchange) -> Option<Value> {
        exchange.remove_header(props::SAGA_LONG_RUNNING_ACTION)
    }

    fn restore(exchange: &mut Exchange, previous: Option<Value>) {
        match previous {
            Some(id) => exchange.set_header(props::SAGA_LONG_RUNNING_ACTION, id),
            None => {
                exchange.remove_header(props::SAGA_LONG_RUNNING_ACTION);
            }
        }
    }
}

#[async_trait]
impl Processor for SagaProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let current = self.current_saga(exchange).await?;
        match (self.config.propagation, current) {
            (SagaPropagation::Required, Some(saga)) | (SagaPropagation::Supports, Some(saga)) => {
                self.run_in_saga(exchange, saga, false).await
            }
            (SagaPropagation::Required, None) => self.create_and_run(exchange).await,
            (SagaPropagation::Mandatory, Some(saga)) => self.run_in_saga(exchange, saga, false).await,
            (SagaPropagation::Mandatory, None) => Err(ProcessingError::SagaMandatory),
            (SagaPropagation::RequiresNew, _) => {
                let previous = Self::suspend(exchange);
                let result = self.create_and_run(exchange).await;
                Self::restore(exchange, previous);
                result
            }
            (SagaPropagation::NotSupported, Some(_)) => {
                let previous = Self::suspend(exchange);
                let result = self.body.process(exchange).await;
                Self::restore(exchange, previous);
                result
            }
            (SagaPropagation::Never, Some(saga)) => Err(ProcessingError::SagaNotAllowed(saga.id().to_string())),
            (SagaPropagation::Supports, None)
            | (SagaPropagation::NotSupported, None)
            | (SagaPropagation::Never, None) => self.body.process(exchange).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::unit_of_work;
    use crate::domain::endpoint::EndpointResolver;
    use crate::domain::expression::Expr;
    use crate::domain::processor::FnProcessor;
    use crate::domain::saga::SagaStatus;
    use crate::infrastructure::endpoints::EndpointRegistry;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::saga::InMemorySagaService;
    use serde_json::json;

    fn setup() -> (Arc<EndpointRegistry>, Arc<InMemorySagaService>) {
        let endpoints = Arc::new(EndpointRegistry::new());
        let resolver: Arc<dyn EndpointResolver> = endpoints.clone();
        let service = Arc::new(InMemorySagaService::new(resolver, EventBus::new(16)));
        (endpoints, service)
    }

    fn failing_when_header() -> ProcessorRef {
        FnProcessor::shared(|exchange: &mut Exchange| {
            if exchange.header("fail").is_some() {
                return Err(ProcessingError::custom("Boom", "step failed"));
            }
            Ok(())
        })
    }

    fn config(compensation: &str, completion: &str) -> SagaConfig {
        SagaConfig {
            compensation: Some(compensation.to_string()),
            completion: Some(completion.to_string()),
            ..SagaConfig::default()
        }
    }

    #[tokio::test]
    async fn test_auto_completion() {
        let (endpoints, service) = setup();
        let mut config = config("mock:undo", "mock:done");
        config.options = vec![("order".to_string(), Expr::body().shared())];
        let saga = SagaProcessor::new("saga1", service.clone(), config, failing_when_header());

        let mut exchange = Exchange::new("o-1");
        saga.process(&mut exchange).await.unwrap();

        let done = endpoints.mock("done").received_exchanges();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].header("order"), Some(&json!("o-1")));
        assert_eq!(endpoints.mock("undo").received_count(), 0);
        assert!(exchange.header_str(props::SAGA_LONG_RUNNING_ACTION).is_some());
    }

    #[tokio::test]
    async fn test_nested_steps_join_and_compensate_in_reverse() {
        let (endpoints, service) = setup();
        let inner = Arc::new(SagaProcessor::new(
            "saga2",
            service.clone(),
            config("mock:undo-inner", "mock:done-inner"),
            failing_when_header(),
        ));
        let outer = SagaProcessor::new("saga1", service.clone(), config("mock:undo-outer", "mock:done-outer"), inner);

        let mut exchange = Exchange::new("x").with_header("fail", true);
        assert!(outer.process(&mut exchange).await.is_err());

        assert_eq!(service.saga_count(), 1);
        let inner_undo = endpoints.mock("undo-inner").received_exchanges();
        let outer_undo = endpoints.mock("undo-outer").received_exchanges();
        assert_eq!(inner_undo.len(), 1);
        assert_eq!(outer_undo.len(), 1);
        assert!(inner_undo[0].created_at() <= outer_undo[0].created_at());
        assert_eq!(endpoints.mock("done-outer").received_count(), 0);
    }

    #[tokio::test]
    async fn test_mandatory_and_never() {
        let (_, service) = setup();
        let mandatory = SagaProcessor::new(
            "saga1",
            service.clone(),
            SagaConfig {
                propagation: SagaPropagation::Mandatory,
                ..SagaConfig::default()
            },
            failing_when_header(),
        );
        let err = mandatory.process(&mut Exchange::new("x")).await.unwrap_err();
        assert_eq!(err, ProcessingError::SagaMandatory);

        let existing = service.new_saga().await.unwrap();
        let never = SagaProcessor::new(
            "saga2",
            service.clone(),
            SagaConfig {
                propagation: SagaPropagation::Never,
                ..SagaConfig::default()
            },
            failing_when_header(),
        );
        let mut exchange = Exchange::new("x").with_header(props::SAGA_LONG_RUNNING_ACTION, existing.id());
        let err = never.process(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ProcessingError::SagaNotAllowed(id) if id == existing.id()));
    }

    #[tokio::test]
    async fn test_requires_new_restores_outer_saga() {
        let (_, service) = setup();
        let outer = service.new_saga().await.unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = seen.clone();
        let body = FnProcessor::shared(move |exchange: &mut Exchange| {
            *sink.lock() = exchange.header_str(props::SAGA_LONG_RUNNING_ACTION).map(str::to_string);
            Ok(())
        });
        let step = SagaProcessor::new(
            "saga1",
            service.clone(),
            SagaConfig {
                propagation: SagaPropagation::RequiresNew,
                ..SagaConfig::default()
            },
            body,
        );

        let mut exchange = Exchange::new("x").with_header(props::SAGA_LONG_RUNNING_ACTION, outer.id());
        step.process(&mut exchange).await.unwrap();

        let inner_id = seen.lock().clone().unwrap();
        assert_ne!(inner_id, outer.id());
        assert_eq!(exchange.header_str(props::SAGA_LONG_RUNNING_ACTION), Some(outer.id()));
        assert_eq!(outer.status(), SagaStatus::Running);
    }

    #[tokio::test]
    async fn test_completion_deferred_to_unit_of_work() {
        let (endpoints, service) = setup();
        let step = SagaProcessor::new(
            "saga1",
            service.clone(),
            SagaConfig {
                completion_mode: SagaCompletionMode::AutoOnRouteCompletion,
                ..config("mock:undo", "mock:done")
            },
            failing_when_header(),
        );

        let mut exchange = Exchange::new("x");
        step.process(&mut exchange).await.unwrap();
        assert_eq!(endpoints.mock("done").received_count(), 0);

        unit_of_work::done(&mut exchange).await;
        assert_eq!(endpoints.mock("done").received_count(), 1);
    }
}
