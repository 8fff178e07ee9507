// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Route Assembly
//
// Turns a route definition into a runnable route:
// 1. lifecycle strategies see the definition before anything is built
// 2. abstract steps move out of the linear chain and ids are assigned
// 3. the model freezes; cross-cutting steps reify first so their handlers
//    and intercepts exist when the outputs are wrapped
// 4. the outputs reify into the route pipeline
//
// The runtime route wraps the pipeline with the route advices: started
// check, inflight tracking, route policies, contract validation, route
// scoped on-completion handlers and the unit of work.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::application::reifiers::ReifyContext;
use crate::application::route_context::RouteContext;
use crate::application::services::EngineServices;
use crate::application::unit_of_work;
use crate::domain::endpoint::{split_uri, Consumer};
use crate::domain::errors::{AssemblyError, ProcessingError};
use crate::domain::events::{ExchangeEvent, RouteEvent};
use crate::domain::executor::ExecutorServiceManager;
use crate::domain::exchange::Exchange;
use crate::domain::policy::Validator;
use crate::domain::processor::{Processor, ProcessorRef};
use crate::domain::route::{RouteDefinition, ShutdownMode};

type ContractCheck = (String, Arc<dyn Validator>);

pub struct RuntimeRoute {
    definition: RouteDefinition,
    route: RouteContext,
    pipeline: ProcessorRef,
    engine: Arc<EngineServices>,
    input_check: Option<ContractCheck>,
    output_check: Option<ContractCheck>,
    started: AtomicBool,
    terminated: AtomicBool,
    inflight: AtomicUsize,
    drained: Notify,
    this: Weak<RuntimeRoute>,
}

impl std::fmt::Debug for RuntimeRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeRoute").field("id", &self.definition.id).finish_non_exhaustive()
    }
}

/// Build a runnable route from `definition`. The route is not started.
pub fn assemble(engine: &Arc<EngineServices>, mut definition: RouteDefinition) -> Result<Arc<RuntimeRoute>, AssemblyError> {
    if definition.id.is_empty() {
        return Err(AssemblyError::InvalidConfiguration("route id must not be empty".to_string()));
    }
    let route_id = definition.id.clone();
    for strategy in engine.lifecycle_strategies() {
        strategy.on_route_context_create(&definition);
    }

    if definition.model.is_frozen() {
        definition.model = definition.model.thawed();
    }
    definition.model.separate_cross_cutting()?;
    definition.model.assign_ids()?;
    definition.model.freeze();

    let route = RouteContext::new(&definition, engine.config.tracing);
    let pipeline = {
        let ctx = ReifyContext::new(engine, &route, &definition.model)
            .map_err(|e| e.enrich(&route_id, "errorHandler"))?;
        for index in definition.model.cross_cutting() {
            ctx.reify(*index)?;
        }
        ctx.outputs(definition.model.outputs())?
    };

    let (input_check, output_check) = contract_checks(engine, &definition)?;
    for policy in &definition.route_policies {
        policy.on_init(&route_id);
    }

    info!(
        route_id = %route_id,
        from = %definition.from_uri(),
        steps = definition.model.walk().len(),
        services = route.services().len(),
        owned_pools = route.owned_executors().len(),
        "Route assembled"
    );

    let engine = engine.clone();
    Ok(Arc::new_cyclic(|this| RuntimeRoute {
        definition,
        route,
        pipeline,
        engine,
        input_check,
        output_check,
        started: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
        inflight: AtomicUsize::new(0),
        drained: Notify::new(),
        this: this.clone(),
    }))
}

fn contract_checks(
    engine: &EngineServices,
    definition: &RouteDefinition,
) -> Result<(Option<ContractCheck>, Option<ContractCheck>), AssemblyError> {
    let Some(contract) = definition.contract.as_ref().filter(|c| c.validate) else {
        return Ok((None, None));
    };
    let lookup = |data_type: &Option<String>| -> Result<Option<ContractCheck>, AssemblyError> {
        match data_type {
            Some(data_type) => engine
                .validator(data_type)
                .map(|validator| Some((data_type.clone(), validator)))
                .ok_or_else(|| AssemblyError::NoSuchBean {
                    name: data_type.clone(),
                    type_name: "Validator",
                }),
            None => Ok(None),
        }
    };
    Ok((lookup(&contract.input_type)?, lookup(&contract.output_type)?))
}

/// Decrements the inflight count when an exchange leaves the route.
struct Inflight<'a>(&'a RuntimeRoute);

impl<'a> Inflight<'a> {
    fn enter(route: &'a RuntimeRoute) -> Self {
        route.inflight.fetch_add(1, Ordering::SeqCst);
        Self(route)
    }
}

impl Drop for Inflight<'_> {
    fn drop(&mut self) {
        if self.0.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

impl RuntimeRoute {
    pub fn id(&self) -> &str {
        &self.route.route_id
    }

    pub fn from_uri(&self) -> &str {
        &self.route.from_uri
    }

    /// The definition as assembled: cross-cutting steps separated, ids
    /// assigned, model frozen.
    pub fn definition(&self) -> &RouteDefinition {
        &self.definition
    }

    pub fn context(&self) -> &RouteContext {
        &self.route
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stopped routes released their pools and must be reassembled.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    fn check(&self, check: &Option<ContractCheck>, exchange: &Exchange) -> Result<(), ProcessingError> {
        match check {
            Some((data_type, validator)) => validator.validate(exchange, data_type),
            None => Ok(()),
        }
    }

    async fn run_on_completions(&self, exchange: &Exchange) {
        for handler in self.route.on_completions() {
            if !handler.applies_to(exchange) {
                continue;
            }
            debug!(route_id = %self.id(), handler = %handler.label, "Running on-completion handler");
            let mut copy = exchange.copy();
            if let Err(e) = handler.pipeline.process(&mut copy).await {
                warn!(route_id = %self.id(), handler = %handler.label, error = %e, "On-completion handler failed");
            }
        }
    }

    pub async fn start(&self) -> Result<(), AssemblyError> {
        if self.is_terminated() {
            return Err(self.startup_failed("route was stopped and must be reassembled"));
        }
        if self.is_started() {
            return Ok(());
        }

        let services = self.route.services();
        for (position, service) in services.iter().enumerate() {
            if let Err(e) = service.start().await {
                for started in services[..position].iter().rev() {
                    if let Err(stop_error) = started.stop().await {
                        warn!(route_id = %self.id(), service = %started.service_name(), error = %stop_error, "Service stop failed during rollback");
                    }
                }
                return Err(self.startup_failed(format!("service '{}' failed to start: {e}", service.service_name())));
            }
        }

        if let Some(("direct", _)) = split_uri(self.from_uri()) {
            let consumer: Weak<dyn Consumer> = self.this.clone();
            self.engine
                .endpoints
                .register_consumer(self.from_uri(), consumer)
                .map_err(|e| self.startup_failed(e.to_string()))?;
        }

        self.started.store(true, Ordering::SeqCst);
        for policy in &self.definition.route_policies {
            policy.on_start(self.id());
        }
        self.engine.event_bus.publish_route_event(RouteEvent::RouteStarted {
            route_id: self.id().to_string(),
            started_at: Utc::now(),
        });
        info!(route_id = %self.id(), from = %self.from_uri(), "Route started");
        Ok(())
    }

    fn startup_failed(&self, reason: impl Into<String>) -> AssemblyError {
        AssemblyError::StartupFailed {
            route_id: self.id().to_string(),
            reason: reason.into(),
        }
    }

    /// Stop accepting exchanges, wait for in-flight ones per the shutdown
    /// mode, stop services in reverse order and shut down owned pools.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(("direct", _)) = split_uri(self.from_uri()) {
            self.engine.endpoints.unregister_consumer(self.from_uri());
        }

        let inflight_at_stop = self.inflight();
        if inflight_at_stop > 0 && self.definition.shutdown_mode == ShutdownMode::Default {
            let timeout = self.engine.config.shutdown_timeout;
            debug!(route_id = %self.id(), inflight = inflight_at_stop, ?timeout, "Waiting for in-flight exchanges");
            let drained = tokio::time::timeout(timeout, async {
                while self.inflight() > 0 {
                    let notified = self.drained.notified();
                    if self.inflight() == 0 {
                        break;
                    }
                    notified.await;
                }
            })
            .await;
            if drained.is_err() {
                warn!(route_id = %self.id(), inflight = self.inflight(), "Shutdown timeout elapsed with exchanges in flight");
            }
        }

        for service in self.route.services().iter().rev() {
            if let Err(e) = service.stop().await {
                warn!(route_id = %self.id(), service = %service.service_name(), error = %e, "Service failed to stop");
            }
        }
        for pool in self.route.owned_executors() {
            self.engine.executors.shutdown(&pool);
        }
        self.terminated.store(true, Ordering::SeqCst);

        for policy in &self.definition.route_policies {
            policy.on_stop(self.id());
        }
        self.engine.event_bus.publish_route_event(RouteEvent::RouteStopped {
            route_id: self.id().to_string(),
            inflight_at_stop,
            stopped_at: Utc::now(),
        });
        info!(route_id = %self.id(), "Route stopped");
    }
}

#[async_trait]
impl Processor for RuntimeRoute {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        if !self.is_started() {
            return Err(ProcessingError::NotStarted(self.id().to_string()));
        }
        let _inflight = Inflight::enter(self);
        let began = Instant::now();
        // only the route that received the exchange first closes its unit of work
        let owns_unit = exchange.from_route_id().is_none();
        if owns_unit {
            exchange.set_from_route_id(self.id());
        }
        for policy in &self.definition.route_policies {
            policy.on_exchange_begin(self.id(), exchange);
        }

        let mut result = self.check(&self.input_check, exchange);
        if result.is_ok() {
            result = self.pipeline.process(exchange).await;
        }
        if result.is_ok() && !exchange.is_failed() {
            result = self.check(&self.output_check, exchange);
        }
        if let Err(e) = &result {
            exchange.set_exception(Some(e.clone()));
        }

        self.run_on_completions(exchange).await;
        if owns_unit {
            unit_of_work::done(exchange).await;
        }
        for policy in &self.definition.route_policies {
            policy.on_exchange_done(self.id(), exchange);
        }

        let route_id = self.id().to_string();
        match &result {
            Ok(()) => {
                metrics::counter!("conduit_exchanges_total", "route" => route_id.clone(), "outcome" => "completed")
                    .increment(1);
                self.engine.event_bus.publish_exchange_event(ExchangeEvent::ExchangeCompleted {
                    route_id,
                    exchange_id: exchange.id(),
                    duration_ms: began.elapsed().as_millis() as u64,
                });
            }
            Err(e) => {
                metrics::counter!("conduit_exchanges_total", "route" => route_id.clone(), "outcome" => "failed")
                    .increment(1);
                debug!(route_id = %route_id, exchange_id = %exchange.id(), error = %e, "Exchange failed");
                self.engine.event_bus.publish_exchange_event(ExchangeEvent::ExchangeFailed {
                    route_id,
                    exchange_id: exchange.id(),
                    error: e.to_string(),
                });
            }
        }
        result
    }
}

#[async_trait]
impl Consumer for RuntimeRoute {
    async fn consume(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        self.process(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::reifiers::test_support::engine;
    use crate::domain::events::EngineEvent;
    use crate::domain::exchange::Synchronization;
    use crate::domain::policy::{LifecycleStrategy, RoutePolicy};
    use crate::domain::processor::FnProcessor;
    use crate::domain::route::{Contract, StepDefinition};
    use crate::domain::step::{AggregateConfig, OnCompletionConfig, OnCompletionMode, StepKind};
    use crate::domain::aggregation::{AggregationStrategy, GroupedBody};
    use crate::domain::expression::Expr;
    use crate::domain::registry::BeanRef;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl RoutePolicy for Recording {
        fn on_init(&self, route_id: &str) {
            self.0.lock().push(format!("init:{route_id}"));
        }

        fn on_start(&self, route_id: &str) {
            self.0.lock().push(format!("start:{route_id}"));
        }

        fn on_stop(&self, route_id: &str) {
            self.0.lock().push(format!("stop:{route_id}"));
        }

        fn on_exchange_begin(&self, _route_id: &str, _exchange: &Exchange) {
            self.0.lock().push("begin".to_string());
        }

        fn on_exchange_done(&self, _route_id: &str, _exchange: &Exchange) {
            self.0.lock().push("done".to_string());
        }
    }

    impl LifecycleStrategy for Recording {
        fn on_route_context_create(&self, route: &RouteDefinition) {
            self.0.lock().push(format!("create:{}", route.id));
        }
    }

    struct Flag(Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Synchronization for Flag {
        async fn on_complete(&self, _exchange: &Exchange) {
            self.0.lock().push("complete");
        }

        async fn on_failure(&self, _exchange: &Exchange) {
            self.0.lock().push("failure");
        }
    }

    #[tokio::test]
    async fn test_not_started_rejects_exchanges() {
        let (engine, _) = engine();
        let route = assemble(&engine, RouteDefinition::new("r1", "direct:r1").step(StepKind::to("mock:out")).unwrap())
            .unwrap();
        let err = route.process(&mut Exchange::new(1)).await.unwrap_err();
        assert!(matches!(err, ProcessingError::NotStarted(_)));
    }

    #[tokio::test]
    async fn test_policies_and_lifecycle_callbacks() {
        let (engine, endpoints) = engine();
        let recording = Arc::new(Recording::default());
        engine.add_lifecycle_strategy(recording.clone());
        let definition = RouteDefinition::new("r1", "direct:r1")
            .step(StepKind::to("mock:out"))
            .unwrap()
            .with_route_policy(recording.clone());

        let route = assemble(&engine, definition).unwrap();
        route.start().await.unwrap();
        route.process(&mut Exchange::new(1)).await.unwrap();
        route.stop().await;

        assert_eq!(endpoints.mock("out").received_count(), 1);
        assert_eq!(
            *recording.0.lock(),
            vec!["create:r1", "init:r1", "start:r1", "begin", "done", "stop:r1"]
        );
        assert!(route.is_terminated());
        assert!(route.start().await.is_err());
    }

    #[tokio::test]
    async fn test_unit_of_work_and_on_completion() {
        let (engine, endpoints) = engine();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        engine.registry.bind(
            "register",
            FnProcessor::shared(move |exchange: &mut Exchange| {
                exchange.add_synchronization(Arc::new(Flag(sink.clone())));
                Ok(())
            }),
        );
        let definition = RouteDefinition::new("r1", "direct:r1")
            .step(
                StepDefinition::new(StepKind::OnCompletion(OnCompletionConfig {
                    mode: OnCompletionMode::Failure,
                    on_when: None,
                }))
                .child(StepKind::to("mock:failed").into()),
            )
            .unwrap()
            .step(StepKind::Process {
                processor: BeanRef::named("register"),
            })
            .unwrap()
            .step(StepKind::to("mock:out"))
            .unwrap();
        endpoints
            .mock("out")
            .fail_next(1, ProcessingError::custom("IoError", "down"));

        let route = assemble(&engine, definition).unwrap();
        route.start().await.unwrap();
        assert!(route.process(&mut Exchange::new(1)).await.is_err());
        route.process(&mut Exchange::new(2)).await.unwrap();

        assert_eq!(*log.lock(), vec!["failure", "complete"]);
        assert_eq!(endpoints.mock("failed").received_bodies(), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_contract_validation() {
        let (engine, endpoints) = engine();
        let definition = RouteDefinition::new("r1", "direct:r1")
            .step(StepKind::to("mock:out"))
            .unwrap()
            .with_contract(Contract {
                input_type: Some("json:object".to_string()),
                output_type: None,
                validate: true,
            });
        let route = assemble(&engine, definition).unwrap();
        route.start().await.unwrap();

        let err = route.process(&mut Exchange::new("text")).await.unwrap_err();
        assert!(matches!(err, ProcessingError::ContractViolation(_)));
        route.process(&mut Exchange::new(json!({"id": 1}))).await.unwrap();
        assert_eq!(endpoints.mock("out").received_count(), 1);
    }

    #[test]
    fn test_unknown_contract_type() {
        let (engine, _) = engine();
        let definition = RouteDefinition::new("r1", "direct:r1")
            .step(StepKind::to("mock:out"))
            .unwrap()
            .with_contract(Contract {
                input_type: Some("xml:order".to_string()),
                output_type: None,
                validate: true,
            });
        assert!(matches!(assemble(&engine, definition).err(), Some(AssemblyError::NoSuchBean { .. })));
    }

    #[tokio::test]
    async fn test_stop_releases_services_and_pools() {
        let (engine, _) = engine();
        let strategy: Arc<dyn AggregationStrategy> = Arc::new(GroupedBody);
        let mut aggregate = AggregateConfig::new(Expr::header("id").shared());
        aggregate.strategy = Some(BeanRef::instance(strategy));
        aggregate.completion_size = Some(2);
        let definition = RouteDefinition::new("r1", "direct:r1")
            .step(StepDefinition::new(StepKind::Aggregate(Box::new(aggregate))).child(StepKind::to("mock:agg").into()))
            .unwrap();
        let route = assemble(&engine, definition).unwrap();
        let pools = route.context().owned_executors();
        assert_eq!(pools.len(), 1);

        let mut events = engine.event_bus.subscribe();
        route.start().await.unwrap();
        route.stop().await;
        assert!(pools[0].is_shutdown());

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::Route(RouteEvent::RouteStarted { .. }) => kinds.push("RouteStarted"),
                EngineEvent::Route(RouteEvent::RouteStopped { inflight_at_stop, .. }) => {
                    assert_eq!(inflight_at_stop, 0);
                    kinds.push("RouteStopped");
                }
                _ => {}
            }
        }
        assert_eq!(kinds, vec!["RouteStarted", "RouteStopped"]);
    }

    #[tokio::test]
    async fn test_direct_consumer_registration() {
        let (engine, endpoints) = engine();
        let route = assemble(&engine, RouteDefinition::new("r1", "direct:r1").step(StepKind::to("mock:out")).unwrap())
            .unwrap();
        route.start().await.unwrap();
        let direct = engine.endpoints.resolve("direct:r1").unwrap();
        direct.send(&mut Exchange::new(7)).await.unwrap();
        assert_eq!(endpoints.mock("out").received_bodies(), vec![json!(7)]);

        route.stop().await;
        assert!(direct.send(&mut Exchange::new(8)).await.is_err());
    }
}
