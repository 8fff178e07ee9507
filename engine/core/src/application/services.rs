// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Engine Services
//
// Engine-wide collaborators shared by every route: configuration, registry,
// endpoint resolution, thread pools, the event bus and the host extension
// points (interceptors, custom reifiers, lifecycle strategies, optional
// transaction manager, saga service, contract validators).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::application::contract::JsonTypeValidator;
use crate::application::reifiers::Reifier;
use crate::domain::config::EngineConfig;
use crate::domain::endpoint::EndpointResolver;
use crate::domain::executor::ExecutorServiceManager;
use crate::domain::policy::{LifecycleStrategy, TransactionManager, Validator};
use crate::domain::registry::Registry;
use crate::domain::saga::SagaService;
use crate::domain::step::InterceptStrategy;
use crate::infrastructure::event_bus::EventBus;

pub struct EngineServices {
    pub config: EngineConfig,
    pub registry: Arc<dyn Registry>,
    pub endpoints: Arc<dyn EndpointResolver>,
    pub executors: Arc<dyn ExecutorServiceManager>,
    pub event_bus: EventBus,
    interceptors: RwLock<Vec<Arc<dyn InterceptStrategy>>>,
    reifiers: RwLock<HashMap<String, Arc<dyn Reifier>>>,
    lifecycle_strategies: RwLock<Vec<Arc<dyn LifecycleStrategy>>>,
    transaction_manager: RwLock<Option<Arc<dyn TransactionManager>>>,
    saga_service: RwLock<Option<Arc<dyn SagaService>>>,
    validators: RwLock<HashMap<String, Arc<dyn Validator>>>,
}

impl EngineServices {
    pub fn new(
        config: EngineConfig,
        registry: Arc<dyn Registry>,
        endpoints: Arc<dyn EndpointResolver>,
        executors: Arc<dyn ExecutorServiceManager>,
        event_bus: EventBus,
    ) -> Self {
        let mut validators: HashMap<String, Arc<dyn Validator>> = HashMap::new();
        let json: Arc<dyn Validator> = Arc::new(JsonTypeValidator);
        for data_type in JsonTypeValidator::DATA_TYPES {
            validators.insert(data_type.to_string(), json.clone());
        }

        Self {
            config,
            registry,
            endpoints,
            executors,
            event_bus,
            interceptors: RwLock::new(Vec::new()),
            reifiers: RwLock::new(HashMap::new()),
            lifecycle_strategies: RwLock::new(Vec::new()),
            transaction_manager: RwLock::new(None),
            saga_service: RwLock::new(None),
            validators: RwLock::new(validators),
        }
    }

    pub fn add_interceptor(&self, strategy: Arc<dyn InterceptStrategy>) {
        self.interceptors.write().push(strategy);
    }

    pub fn interceptors(&self) -> Vec<Arc<dyn InterceptStrategy>> {
        self.interceptors.read().clone()
    }

    /// Custom reifiers are consulted before the built-in table and may
    /// override a built-in kind.
    pub fn register_reifier(&self, kind: impl Into<String>, reifier: Arc<dyn Reifier>) {
        self.reifiers.write().insert(kind.into(), reifier);
    }

    pub fn custom_reifier(&self, kind: &str) -> Option<Arc<dyn Reifier>> {
        self.reifiers.read().get(kind).cloned()
    }

    pub fn add_lifecycle_strategy(&self, strategy: Arc<dyn LifecycleStrategy>) {
        self.lifecycle_strategies.write().push(strategy);
    }

    pub fn lifecycle_strategies(&self) -> Vec<Arc<dyn LifecycleStrategy>> {
        self.lifecycle_strategies.read().clone()
    }

    pub fn set_transaction_manager(&self, manager: Option<Arc<dyn TransactionManager>>) {
        *self.transaction_manager.write() = manager;
    }

    pub fn transaction_manager(&self) -> Option<Arc<dyn TransactionManager>> {
        self.transaction_manager.read().clone()
    }

    pub fn set_saga_service(&self, service: Option<Arc<dyn SagaService>>) {
        *self.saga_service.write() = service;
    }

    pub fn saga_service(&self) -> Option<Arc<dyn SagaService>> {
        self.saga_service.read().clone()
    }

    pub fn register_validator(&self, data_type: impl Into<String>, validator: Arc<dyn Validator>) {
        self.validators.write().insert(data_type.into(), validator);
    }

    pub fn validator(&self, data_type: &str) -> Option<Arc<dyn Validator>> {
        self.validators.read().get(data_type).cloned()
    }
}
