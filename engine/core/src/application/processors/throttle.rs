// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Throttle
//
// Concurrent mode bounds the number of exchanges in flight per correlation
// key with a semaphore. The permit is held while the throttle's children run,
// or until the exchange's unit of work closes when the throttle has none.
// Time-window mode keeps the admission instants of the last period per key and
// admits at most `max` exchanges in any rolling period. Both modes either block
// (optionally on a pool) or reject with `ThrottleRejected`.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::timing::hand_off;
use crate::domain::errors::ProcessingError;
use crate::domain::exchange::{Exchange, Synchronization};
use crate::domain::executor::ExecutorHandle;
use crate::domain::expression::value_to_key;
use crate::domain::processor::{Processor, ProcessorRef};
use crate::domain::step::{ThrottleConfig, ThrottleMode};

const DEFAULT_KEY: &str = "*";

/// Admission instants per key within the trailing period.
#[derive(Default)]
struct AdmissionLog(DashMap<String, VecDeque<Instant>>);

impl AdmissionLog {
    /// Admit now, or report how long until the oldest admission leaves the
    /// window.
    fn try_admit(&self, key: &str, max: NonZeroU32, period: Duration) -> Result<(), Duration> {
        let now = Instant::now();
        let mut admitted = self.0.entry(key.to_string()).or_default();
        while admitted.front().is_some_and(|at| *at + period <= now) {
            admitted.pop_front();
        }
        if admitted.len() < max.get() as usize {
            admitted.push_back(now);
            return Ok(());
        }
        let oldest = admitted.front().copied().unwrap_or(now);
        Err((oldest + period).saturating_duration_since(now))
    }

    async fn admit(&self, key: &str, max: NonZeroU32, period: Duration) {
        while let Err(wait) = self.try_admit(key, max, period) {
            tokio::time::sleep(wait).await;
        }
    }
}

pub struct ThrottleProcessor {
    route_id: String,
    label: String,
    config: ThrottleConfig,
    executor: Option<ExecutorHandle>,
    body: Option<ProcessorRef>,
    concurrent: DashMap<String, (u32, Arc<Semaphore>)>,
    window: Arc<AdmissionLog>,
}

/// Releases a concurrency permit when the unit of work closes.
struct PermitRelease(Mutex<Option<OwnedSemaphorePermit>>);

#[async_trait]
impl Synchronization for PermitRelease {
    async fn on_complete(&self, _exchange: &Exchange) {
        self.0.lock().take();
    }

    async fn on_failure(&self, _exchange: &Exchange) {
        self.0.lock().take();
    }
}

impl ThrottleProcessor {
    /// `executor` is used for blocking waits when the throttle is
    /// async-delayed.
    pub fn new(
        route_id: impl Into<String>,
        label: impl Into<String>,
        config: ThrottleConfig,
        executor: Option<ExecutorHandle>,
        body: Option<ProcessorRef>,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            label: label.into(),
            config,
            executor,
            body,
            concurrent: DashMap::new(),
            window: Arc::new(AdmissionLog::default()),
        }
    }

    fn max_for(&self, exchange: &Exchange) -> Result<NonZeroU32, ProcessingError> {
        let value = self.config.max.evaluate(exchange)?;
        let max = match &value {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        max.and_then(|m| u32::try_from(m).ok())
            .and_then(NonZeroU32::new)
            .ok_or_else(|| ProcessingError::Expression(format!("throttle maximum {value} is not a positive integer")))
    }

    fn key_for(&self, exchange: &Exchange) -> Result<String, ProcessingError> {
        match &self.config.correlation {
            Some(expression) => Ok(value_to_key(&expression.evaluate(exchange)?)),
            None => Ok(DEFAULT_KEY.to_string()),
        }
    }

    /// The key's semaphore, resized in place when `max` changes so permits
    /// already held keep counting against the new limit.
    fn semaphore(&self, key: &str, max: NonZeroU32) -> Arc<Semaphore> {
        let max = max.get();
        let mut entry = self
            .concurrent
            .entry(key.to_string())
            .or_insert_with(|| (max, Arc::new(Semaphore::new(max as usize))));
        let (current, semaphore) = entry.value_mut();
        if max > *current {
            semaphore.add_permits((max - *current) as usize);
        } else if max < *current {
            let excess = (*current - max) as usize;
            let forgotten = semaphore.forget_permits(excess);
            if forgotten < excess {
                // retire the rest as in-flight holders release them
                let semaphore = semaphore.clone();
                let outstanding = (excess - forgotten) as u32;
                tokio::spawn(async move {
                    if let Ok(permits) = semaphore.acquire_many_owned(outstanding).await {
                        permits.forget();
                    }
                });
            }
        }
        *current = max;
        semaphore.clone()
    }

    fn reject(&self, key: &str, max: NonZeroU32) -> ProcessingError {
        metrics::counter!("conduit_throttle_rejected_total", "route" => self.route_id.clone()).increment(1);
        warn!(step = %self.label, key = %key, max = max.get(), "Throttle limit exceeded");
        ProcessingError::ThrottleRejected(format!("more than {max} for key '{key}'"))
    }

    /// Block on `wait`, on the pool when async-delayed. `None` means the pool
    /// discarded the wait.
    async fn wait<F>(&self, wait: F) -> Result<Option<F::Output>, ProcessingError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.executor {
            Some(executor) => hand_off(executor, self.config.caller_runs_when_rejected, wait).await,
            None => Ok(Some(wait.await)),
        }
    }

    async fn admit_concurrent(
        &self,
        key: &str,
        max: NonZeroU32,
    ) -> Result<Option<OwnedSemaphorePermit>, ProcessingError> {
        let semaphore = self.semaphore(key, max);
        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
            return Ok(Some(permit));
        }
        if self.config.reject_execution {
            return Err(self.reject(key, max));
        }
        debug!(step = %self.label, key = %key, "Waiting for throttle permit");
        match self.wait(semaphore.acquire_owned()).await? {
            Some(permit) => permit
                .map(Some)
                .map_err(|_| ProcessingError::NotStarted(self.label.clone())),
            None => Ok(None),
        }
    }

    async fn admit_window(&self, key: &str, max: NonZeroU32, period: Duration) -> Result<bool, ProcessingError> {
        if period.is_zero() {
            return Err(ProcessingError::Expression("throttle time window must be positive".to_string()));
        }
        if self.window.try_admit(key, max, period).is_ok() {
            return Ok(true);
        }
        if self.config.reject_execution {
            return Err(self.reject(key, max));
        }
        debug!(step = %self.label, key = %key, "Waiting for throttle window");
        let window = self.window.clone();
        let key = key.to_string();
        let waited = self
            .wait(async move {
                window.admit(&key, max, period).await;
            })
            .await?;
        Ok(waited.is_some())
    }
}

#[async_trait]
impl Processor for ThrottleProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let max = self.max_for(exchange)?;
        let key = self.key_for(exchange)?;

        let permit = match &self.config.mode {
            ThrottleMode::Concurrent => match self.admit_concurrent(&key, max).await? {
                Some(permit) => Some(permit),
                None => {
                    exchange.stop_route();
                    return Ok(());
                }
            },
            ThrottleMode::TimeWindow { period } => {
                if !self.admit_window(&key, max, *period).await? {
                    exchange.stop_route();
                    return Ok(());
                }
                None
            }
        };

        match &self.body {
            Some(body) => {
                let result = body.process(exchange).await;
                drop(permit);
                result
            }
            None => {
                if let Some(permit) = permit {
                    exchange.add_synchronization(Arc::new(PermitRelease(Mutex::new(Some(permit)))));
                }
                Ok(())
            }
        }
    }
}
