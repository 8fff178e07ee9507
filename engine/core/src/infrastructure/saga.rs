// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-memory saga service
//
// Coordinators live for the lifetime of the service. Completion sends one
// exchange per step to its completion uri in step order; compensation sends
// to the compensation uris in reverse order. Every exchange carries the saga
// id in the `Long-Running-Action` header plus the step's captured options.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::endpoint::EndpointResolver;
use crate::domain::errors::ProcessingError;
use crate::domain::events::SagaEvent;
use crate::domain::exchange::{props, Exchange};
use crate::domain::saga::{SagaCoordinator, SagaService, SagaStatus, SagaStep};
use crate::infrastructure::event_bus::EventBus;

pub struct InMemorySagaService {
    resolver: Arc<dyn EndpointResolver>,
    event_bus: EventBus,
    sagas: DashMap<String, Arc<InMemorySagaCoordinator>>,
}

impl InMemorySagaService {
    pub fn new(resolver: Arc<dyn EndpointResolver>, event_bus: EventBus) -> Self {
        Self {
            resolver,
            event_bus,
            sagas: DashMap::new(),
        }
    }

    pub fn saga_count(&self) -> usize {
        self.sagas.len()
    }
}

#[async_trait]
impl SagaService for InMemorySagaService {
    async fn new_saga(&self) -> Result<Arc<dyn SagaCoordinator>, ProcessingError> {
        let id = Uuid::new_v4().to_string();
        let coordinator = Arc::new_cyclic(|weak| InMemorySagaCoordinator {
            id: id.clone(),
            this: weak.clone(),
            status: Mutex::new(SagaStatus::Running),
            steps: Mutex::new(Vec::new()),
            resolver: self.resolver.clone(),
            event_bus: self.event_bus.clone(),
        });
        self.sagas.insert(id.clone(), coordinator.clone());
        info!(saga_id = %id, "Saga started");
        self.event_bus.publish_saga_event(SagaEvent::SagaStarted {
            saga_id: id,
            started_at: Utc::now(),
        });
        Ok(coordinator)
    }

    async fn get_saga(&self, id: &str) -> Result<Option<Arc<dyn SagaCoordinator>>, ProcessingError> {
        Ok(self
            .sagas
            .get(id)
            .map(|entry| entry.value().clone() as Arc<dyn SagaCoordinator>))
    }
}

pub struct InMemorySagaCoordinator {
    id: String,
    this: Weak<InMemorySagaCoordinator>,
    status: Mutex<SagaStatus>,
    steps: Mutex<Vec<SagaStep>>,
    resolver: Arc<dyn EndpointResolver>,
    event_bus: EventBus,
}

impl InMemorySagaCoordinator {
    /// Move from `Running` to `next`. Returns false when the saga already
    /// left the running state.
    fn transition(&self, next: SagaStatus) -> bool {
        let mut status = self.status.lock();
        if *status != SagaStatus::Running {
            return false;
        }
        *status = next;
        true
    }

    fn set_status(&self, next: SagaStatus) {
        *self.status.lock() = next;
    }

    async fn send_action(&self, uri: &str, step: &SagaStep) -> Result<(), ProcessingError> {
        let mut exchange = Exchange::new(serde_json::Value::Null);
        exchange.set_header(props::SAGA_LONG_RUNNING_ACTION, self.id.clone());
        for (name, value) in &step.options {
            exchange.set_header(name.clone(), value.clone());
        }
        let endpoint = self.resolver.resolve(uri)?;
        endpoint.send(&mut exchange).await
    }
}

#[async_trait]
impl SagaCoordinator for InMemorySagaCoordinator {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> SagaStatus {
        *self.status.lock()
    }

    async fn begin_step(&self, step: SagaStep) -> Result<(), ProcessingError> {
        if self.status() != SagaStatus::Running {
            return Err(ProcessingError::custom(
                "SagaNotRunning",
                format!("saga '{}' is {}", self.id, self.status()),
            ));
        }

        if let Some(timeout) = step.timeout {
            let weak = self.this.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(saga) = weak.upgrade() {
                    if saga.status() == SagaStatus::Running {
                        warn!(saga_id = %saga.id, ?timeout, "Saga timed out, compensating");
                        if let Err(e) = saga.compensate().await {
                            error!(saga_id = %saga.id, error = %e, "Compensation after timeout failed");
                        }
                    }
                }
            });
        }

        debug!(
            saga_id = %self.id,
            compensation = ?step.compensation,
            completion = ?step.completion,
            "Saga step registered"
        );
        self.steps.lock().push(step);
        Ok(())
    }

    async fn complete(&self) -> Result<(), ProcessingError> {
        if !self.transition(SagaStatus::Completing) {
            return Ok(());
        }

        let steps = self.steps.lock().clone();
        for step in &steps {
            if let Some(uri) = &step.completion {
                if let Err(e) = self.send_action(uri, step).await {
                    // completions are best effort; the saga still counts as done
                    warn!(saga_id = %self.id, endpoint = %uri, error = %e, "Saga completion action failed");
                }
            }
        }

        self.set_status(SagaStatus::Completed);
        info!(saga_id = %self.id, steps = steps.len(), "Saga completed");
        self.event_bus.publish_saga_event(SagaEvent::SagaCompleted {
            saga_id: self.id.clone(),
            completed_at: Utc::now(),
        });
        Ok(())
    }

    async fn compensate(&self) -> Result<(), ProcessingError> {
        if !self.transition(SagaStatus::Compensating) {
            return Ok(());
        }

        let steps = self.steps.lock().clone();
        let mut first_failure = None;
        for step in steps.iter().rev() {
            let Some(uri) = &step.compensation else {
                continue;
            };
            if let Err(e) = self.send_action(uri, step).await {
                error!(saga_id = %self.id, endpoint = %uri, error = %e, "Saga compensation action failed");
                self.event_bus.publish_saga_event(SagaEvent::SagaCompensationFailed {
                    saga_id: self.id.clone(),
                    endpoint: uri.clone(),
                    reason: e.to_string(),
                    failed_at: Utc::now(),
                });
                first_failure.get_or_insert(ProcessingError::Compensation {
                    saga_id: self.id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        match first_failure {
            Some(failure) => {
                self.set_status(SagaStatus::Failed);
                Err(failure)
            }
            None => {
                self.set_status(SagaStatus::Compensated);
                info!(saga_id = %self.id, "Saga compensated");
                self.event_bus.publish_saga_event(SagaEvent::SagaCompensated {
                    saga_id: self.id.clone(),
                    compensated_at: Utc::now(),
                });
                Ok(())
            }
        }
    }
}
