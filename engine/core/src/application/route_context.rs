// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Route Context
//
// Per-route tables filled during reification and read at runtime:
// - cross-cutting handlers registered by abstract steps
// - stateful services started and stopped with the route
// - thread pools the route created and therefore owns

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::ProcessingError;
use crate::domain::exchange::Exchange;
use crate::domain::executor::ExecutorHandle;
use crate::domain::processor::{ProcessorRef, Service};
use crate::domain::route::{ErrorHandlerDefinition, RouteDefinition};
use crate::domain::step::{InterceptStrategy, OnCompletionConfig, OnCompletionMode, OnExceptionConfig};

/// Exception handler registered by an `OnException` step.
pub struct OnExceptionHandler {
    pub label: String,
    pub config: OnExceptionConfig,
    pub pipeline: ProcessorRef,
}

impl OnExceptionHandler {
    /// Structural match on the error type names, then the optional on-when
    /// predicate. A failing predicate counts as no match.
    pub fn matches(&self, error: &ProcessingError, exchange: &Exchange) -> bool {
        let type_matches = self.config.exceptions.is_empty()
            || self.config.exceptions.iter().any(|name| error.matches_type(name));
        if !type_matches {
            return false;
        }
        match &self.config.on_when {
            Some(predicate) => predicate.matches(exchange).unwrap_or(false),
            None => true,
        }
    }
}

pub type OnExceptionTable = Arc<RwLock<Vec<Arc<OnExceptionHandler>>>>;

/// Completion handler registered by an `OnCompletion` step.
pub struct OnCompletionHandler {
    pub label: String,
    pub config: OnCompletionConfig,
    pub pipeline: ProcessorRef,
}

impl OnCompletionHandler {
    pub fn applies_to(&self, exchange: &Exchange) -> bool {
        let mode_matches = match self.config.mode {
            OnCompletionMode::Always => true,
            OnCompletionMode::Complete => !exchange.is_failed(),
            OnCompletionMode::Failure => exchange.is_failed(),
        };
        mode_matches
            && self
                .config
                .on_when
                .as_ref()
                .map(|predicate| predicate.matches(exchange).unwrap_or(false))
                .unwrap_or(true)
    }
}

pub struct RouteContext {
    pub route_id: String,
    pub from_uri: String,
    pub error_handler: ErrorHandlerDefinition,
    pub tracing: bool,
    pub delayer: Option<Duration>,
    route_interceptors: Vec<Arc<dyn InterceptStrategy>>,
    intercepts: Mutex<Vec<Arc<dyn InterceptStrategy>>>,
    on_exceptions: OnExceptionTable,
    on_completions: Mutex<Vec<Arc<OnCompletionHandler>>>,
    services: Mutex<Vec<Arc<dyn Service>>>,
    owned_executors: Mutex<Vec<ExecutorHandle>>,
    first_assigned: AtomicBool,
}

impl RouteContext {
    pub fn new(definition: &RouteDefinition, engine_tracing: bool) -> Self {
        Self {
            route_id: definition.id.clone(),
            from_uri: definition.from_uri().to_string(),
            error_handler: definition.error_handler.clone(),
            tracing: definition.tracing.unwrap_or(engine_tracing),
            delayer: definition.delayer,
            route_interceptors: definition.interceptors.clone(),
            intercepts: Mutex::new(Vec::new()),
            on_exceptions: Arc::new(RwLock::new(Vec::new())),
            on_completions: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
            owned_executors: Mutex::new(Vec::new()),
            first_assigned: AtomicBool::new(false),
        }
    }

    /// Route-wide interceptors: the route's own strategies followed by those
    /// registered by `Intercept` steps.
    pub fn interceptors(&self) -> Vec<Arc<dyn InterceptStrategy>> {
        let mut all = self.route_interceptors.clone();
        all.extend(self.intercepts.lock().iter().cloned());
        all
    }

    pub fn add_intercept(&self, strategy: Arc<dyn InterceptStrategy>) {
        self.intercepts.lock().push(strategy);
    }

    pub fn add_on_exception(&self, handler: OnExceptionHandler) {
        self.on_exceptions.write().push(Arc::new(handler));
    }

    pub fn on_exceptions(&self) -> OnExceptionTable {
        self.on_exceptions.clone()
    }

    pub fn add_on_completion(&self, handler: OnCompletionHandler) {
        self.on_completions.lock().push(Arc::new(handler));
    }

    pub fn on_completions(&self) -> Vec<Arc<OnCompletionHandler>> {
        self.on_completions.lock().clone()
    }

    pub fn add_service(&self, service: Arc<dyn Service>) {
        self.services.lock().push(service);
    }

    /// Services in registration order; children register before parents.
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        self.services.lock().clone()
    }

    pub fn own_executor(&self, executor: ExecutorHandle) {
        self.owned_executors.lock().push(executor);
    }

    pub fn owned_executors(&self) -> Vec<ExecutorHandle> {
        self.owned_executors.lock().clone()
    }

    /// True exactly once, for the first unit wrapped in this route.
    pub fn claim_first(&self) -> bool {
        self.first_assigned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
