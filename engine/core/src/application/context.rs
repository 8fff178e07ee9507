// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Engine Context
//
// Owns the engine services and the route table. Routes are assembled when
// added, started in startup order when the context starts, and stopped in
// reverse order when it stops. A stopped route is reassembled from its
// definition before it starts again.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::advice_with::AdviceWith;
use crate::application::route_assembly::{assemble, RuntimeRoute};
use crate::application::services::EngineServices;
use crate::domain::config::EngineConfig;
use crate::domain::errors::{AssemblyError, ProcessingError};
use crate::domain::events::RouteEvent;
use crate::domain::exchange::Exchange;
use crate::domain::registry::Registry;
use crate::domain::route::RouteDefinition;
use crate::infrastructure::endpoints::EndpointRegistry;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::executor::DefaultExecutorServiceManager;
use crate::infrastructure::registry::InMemoryRegistry;

pub struct EngineContext {
    services: Arc<EngineServices>,
    endpoints: Arc<EndpointRegistry>,
    executors: Arc<DefaultExecutorServiceManager>,
    routes: RwLock<Vec<Arc<RuntimeRoute>>>,
    started: AtomicBool,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_registry(config, Arc::new(InMemoryRegistry::new()))
    }

    /// Use a host-provided bean registry.
    pub fn with_registry(config: EngineConfig, registry: Arc<dyn Registry>) -> Self {
        let endpoints = Arc::new(EndpointRegistry::new());
        let executors = Arc::new(DefaultExecutorServiceManager::new(&config));
        let event_bus = EventBus::new(config.event_bus_capacity);
        let services = EngineServices::new(config, registry, endpoints.clone(), executors.clone(), event_bus);
        Self {
            services: Arc::new(services),
            endpoints,
            executors,
            routes: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.services.registry
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.services.event_bus
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.routes.read().iter().map(|route| route.id().to_string()).collect()
    }

    pub fn route(&self, route_id: &str) -> Option<Arc<RuntimeRoute>> {
        self.routes.read().iter().find(|route| route.id() == route_id).cloned()
    }

    fn require(&self, route_id: &str) -> Result<Arc<RuntimeRoute>, AssemblyError> {
        self.route(route_id)
            .ok_or_else(|| AssemblyError::RouteNotFound(route_id.to_string()))
    }

    fn replace(&self, route: Arc<RuntimeRoute>) {
        let mut routes = self.routes.write();
        if let Some(slot) = routes.iter_mut().find(|existing| existing.id() == route.id()) {
            *slot = route;
        }
    }

    /// Assemble and register a route. It starts right away when the context
    /// is already started and the route auto-starts.
    pub async fn add_route(&self, definition: RouteDefinition) -> Result<Arc<RuntimeRoute>, AssemblyError> {
        if self.route(&definition.id).is_some() {
            return Err(AssemblyError::DuplicateRoute(definition.id));
        }
        let route = assemble(&self.services, definition)?;
        {
            let mut routes = self.routes.write();
            if routes.iter().any(|existing| existing.id() == route.id()) {
                return Err(AssemblyError::DuplicateRoute(route.id().to_string()));
            }
            routes.push(route.clone());
        }

        for strategy in self.services.lifecycle_strategies() {
            strategy.on_route_add(route.id());
        }
        self.event_bus().publish_route_event(RouteEvent::RouteAdded {
            route_id: route.id().to_string(),
            from_uri: route.from_uri().to_string(),
            added_at: Utc::now(),
        });
        info!(route_id = %route.id(), from = %route.from_uri(), "Route added");

        if self.is_started() && route.definition().auto_startup {
            route.start().await?;
        }
        Ok(route)
    }

    pub async fn remove_route(&self, route_id: &str) -> Result<(), AssemblyError> {
        let route = self.require(route_id)?;
        route.stop().await;
        self.routes.write().retain(|existing| existing.id() != route_id);

        for strategy in self.services.lifecycle_strategies() {
            strategy.on_route_remove(route_id);
        }
        self.event_bus().publish_route_event(RouteEvent::RouteRemoved {
            route_id: route_id.to_string(),
            removed_at: Utc::now(),
        });
        info!(route_id = %route_id, "Route removed");
        Ok(())
    }

    /// Auto-start routes ordered by startup order; routes without one start
    /// last, in the order they were added.
    fn startup_sequence(&self) -> Vec<Arc<RuntimeRoute>> {
        let mut routes: Vec<Arc<RuntimeRoute>> = self
            .routes
            .read()
            .iter()
            .filter(|route| route.definition().auto_startup)
            .cloned()
            .collect();
        routes.sort_by_key(|route| route.definition().startup_order.unwrap_or(u32::MAX));
        routes
    }

    pub async fn start(&self) -> Result<(), AssemblyError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(engine = %self.config().name, routes = self.routes.read().len(), "Starting engine");
        for route in self.startup_sequence() {
            if let Err(e) = self.start_route(route.id()).await {
                warn!(route_id = %route.id(), error = %e, "Route failed to start, stopping engine");
                self.stop().await;
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        let mut routes = self.startup_sequence();
        routes.reverse();
        for route in routes {
            route.stop().await;
        }
        // routes with auto startup off may have been started by hand
        let remaining: Vec<Arc<RuntimeRoute>> = self.routes.read().iter().filter(|r| r.is_started()).cloned().collect();
        for route in remaining {
            route.stop().await;
        }
        self.executors.shutdown_all();
        info!(engine = %self.config().name, "Engine stopped");
    }

    pub async fn start_route(&self, route_id: &str) -> Result<(), AssemblyError> {
        let mut route = self.require(route_id)?;
        if route.is_terminated() {
            let fresh = assemble(&self.services, route.definition().clone())?;
            self.replace(fresh.clone());
            route = fresh;
        }
        route.start().await
    }

    pub async fn stop_route(&self, route_id: &str) -> Result<(), AssemblyError> {
        self.require(route_id)?.stop().await;
        Ok(())
    }

    /// Deliver an exchange to the endpoint behind `uri`.
    pub async fn send(&self, uri: &str, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let endpoint = self.services.endpoints.resolve(uri)?;
        endpoint.send(exchange).await
    }

    /// Edit an assembled route and swap it for the running one. The edited
    /// definition goes through full assembly; on any failure the running
    /// route is left untouched.
    pub async fn advice_with<F>(&self, route_id: &str, advise: F) -> Result<Arc<RuntimeRoute>, AssemblyError>
    where
        F: FnOnce(&mut AdviceWith) -> Result<(), AssemblyError>,
    {
        let current = self.require(route_id)?;
        let mut advice = AdviceWith::new(current.definition().clone());
        advise(&mut advice)?;
        let edits = advice.edit_count();
        let definition = advice.finish()?;

        let advised = assemble(&self.services, definition)?;
        let was_started = current.is_started();
        current.stop().await;
        self.replace(advised.clone());
        if was_started {
            advised.start().await?;
        }

        self.event_bus().publish_route_event(RouteEvent::RouteAdvised {
            route_id: route_id.to_string(),
            advised_at: Utc::now(),
        });
        info!(route_id = %route_id, edits, "Route advised");
        Ok(advised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::LifecycleStrategy;
    use crate::domain::step::StepKind;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Hooks(Mutex<Vec<String>>);

    impl LifecycleStrategy for Hooks {
        fn on_route_add(&self, route_id: &str) {
            self.0.lock().push(format!("add:{route_id}"));
        }

        fn on_route_remove(&self, route_id: &str) {
            self.0.lock().push(format!("remove:{route_id}"));
        }
    }

    fn route(id: &str, order: Option<u32>) -> RouteDefinition {
        let mut definition = RouteDefinition::new(id, format!("direct:{id}"))
            .step(StepKind::to(format!("mock:{id}")))
            .unwrap();
        definition.startup_order = order;
        definition
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_routes() {
        let context = EngineContext::new(EngineConfig::default());
        context.add_route(route("a", None)).await.unwrap();
        assert!(matches!(
            context.add_route(route("a", None)).await.err(),
            Some(AssemblyError::DuplicateRoute(_))
        ));
        assert!(matches!(
            context.stop_route("zzz").await.err(),
            Some(AssemblyError::RouteNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_startup_order_and_send() {
        let context = EngineContext::new(EngineConfig::default());
        context.add_route(route("late", None)).await.unwrap();
        context.add_route(route("early", Some(1))).await.unwrap();
        let order: Vec<String> = context.startup_sequence().iter().map(|r| r.id().to_string()).collect();
        assert_eq!(order, vec!["early", "late"]);

        context.start().await.unwrap();
        context.send("direct:late", &mut Exchange::new("x")).await.unwrap();
        assert_eq!(context.endpoints().mock("late").received_bodies(), vec![json!("x")]);
        context.stop().await;
        assert!(context.send("direct:late", &mut Exchange::new("y")).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_reassembles_stopped_route() {
        let context = EngineContext::new(EngineConfig::default());
        let first = context.add_route(route("a", None)).await.unwrap();
        context.start().await.unwrap();
        context.stop_route("a").await.unwrap();
        assert!(first.is_terminated());

        context.start_route("a").await.unwrap();
        let second = context.route("a").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_started());
    }

    #[tokio::test]
    async fn test_lifecycle_hooks_on_add_and_remove() {
        let context = EngineContext::new(EngineConfig::default());
        let hooks = Arc::new(Hooks::default());
        context.services().add_lifecycle_strategy(hooks.clone());
        context.add_route(route("a", None)).await.unwrap();
        context.remove_route("a").await.unwrap();
        assert_eq!(*hooks.0.lock(), vec!["add:a", "remove:a"]);
        assert!(context.route_ids().is_empty());
    }

    #[tokio::test]
    async fn test_advice_swaps_running_route() {
        let context = EngineContext::new(EngineConfig::default());
        context.add_route(route("a", None)).await.unwrap();
        context.start().await.unwrap();

        context
            .advice_with("a", |advice| {
                advice.weave_by_uri("mock:a").replace(vec![StepKind::to("mock:b").into()])?;
                Ok(())
            })
            .await
            .unwrap();

        context.send("direct:a", &mut Exchange::new(1)).await.unwrap();
        assert_eq!(context.endpoints().mock("a").received_count(), 0);
        assert_eq!(context.endpoints().mock("b").received_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_advice_keeps_running_route() {
        let context = EngineContext::new(EngineConfig::default());
        let original = context.add_route(route("a", None)).await.unwrap();
        context.start().await.unwrap();

        let err = context
            .advice_with("a", |advice| {
                advice.weave_by_id("nope").remove()?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AssemblyError::AdviceRejected(_)));
        assert!(Arc::ptr_eq(&original, &context.route("a").unwrap()));
        assert!(original.is_started());
    }
}
