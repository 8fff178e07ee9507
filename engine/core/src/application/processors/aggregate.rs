// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Aggregator
//
// Stateful fan-in. Exchanges are grouped by correlation key into the
// aggregation repository and folded with the configured strategy. A group is
// released when one of its completion conditions holds:
//
// - predicate (on the aggregate, or on the incoming exchange when eager)
// - size, fixed or computed from the incoming exchange
// - inactivity timeout and interval since the first member (checker task)
// - a new correlation group arriving
//
// Released groups are handed to the output pipeline on the aggregator's
// executor. Mutations are serialized by a lock, or retried on optimistic
// lock conflicts when the repository is optimistic.

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::unit_of_work;
use crate::domain::aggregation::{AggregationRepository, AggregationStrategy};
use crate::domain::errors::ProcessingError;
use crate::domain::events::ExchangeEvent;
use crate::domain::exchange::{props, Exchange};
use crate::domain::executor::{ExecutorHandle, RejectedPolicy};
use crate::domain::expression::value_to_key;
use crate::domain::processor::{Processor, ProcessorRef, Service};
use crate::domain::step::AggregateConfig;
use crate::infrastructure::event_bus::EventBus;

const BY_PREDICATE: &str = "predicate";
const BY_SIZE: &str = "size";
const BY_TIMEOUT: &str = "timeout";
const BY_INTERVAL: &str = "interval";
const BY_NEW_GROUP: &str = "new_correlation_group";
const BY_FORCE: &str = "force";

/// Collaborators an aggregator needs beyond its step configuration.
pub struct AggregatorParts {
    pub route_id: String,
    pub label: String,
    pub strategy: Arc<dyn AggregationStrategy>,
    pub repository: Arc<dyn AggregationRepository>,
    pub output: ProcessorRef,
    pub executor: ExecutorHandle,
    pub checker_interval: Duration,
    pub event_bus: EventBus,
}

struct GroupTimes {
    first: Instant,
    last: Instant,
    timeout: Option<Duration>,
}

struct Completed {
    key: String,
    aggregate: Exchange,
    completed_by: &'static str,
}

struct AggregatorCore {
    parts: AggregatorParts,
    config: AggregateConfig,
    lock: tokio::sync::Mutex<()>,
    times: DashMap<String, GroupTimes>,
    closed: Option<Mutex<LruCache<String, ()>>>,
    last_group: Mutex<Option<String>>,
}

pub struct AggregateProcessor {
    core: Arc<AggregatorCore>,
    checker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

fn aggregated_size(exchange: Option<&Exchange>) -> u64 {
    exchange
        .and_then(|e| e.property(props::AGGREGATED_SIZE))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

impl AggregateProcessor {
    pub fn new(config: AggregateConfig, parts: AggregatorParts) -> Self {
        let closed = config.close_correlation_key_on_completion.map(|capacity| {
            let cache = match NonZeroUsize::new(capacity) {
                Some(capacity) => LruCache::new(capacity),
                None => LruCache::unbounded(),
            };
            Mutex::new(cache)
        });
        Self {
            core: Arc::new(AggregatorCore {
                parts,
                config,
                lock: tokio::sync::Mutex::new(()),
                times: DashMap::new(),
                closed,
                last_group: Mutex::new(None),
            }),
            checker: Mutex::new(None),
        }
    }

    /// Groups currently held in the repository.
    pub async fn group_count(&self) -> Result<usize, ProcessingError> {
        Ok(self.core.parts.repository.keys().await?.len())
    }

    /// Release every in-progress group now.
    pub async fn force_completion(&self) -> Result<usize, ProcessingError> {
        self.core.complete_stored(false).await
    }
}

impl AggregatorCore {
    fn needs_checker(&self) -> bool {
        self.config.completion_timeout.is_some()
            || self.config.completion_timeout_expression.is_some()
            || self.config.completion_interval.is_some()
    }

    fn correlation_key(&self, exchange: &Exchange) -> Result<Option<String>, ProcessingError> {
        let invalid = match self.config.correlation.evaluate(exchange) {
            Ok(Value::Null) => "correlation expression evaluated to null".to_string(),
            Ok(value) => {
                let key = value_to_key(&value);
                if !key.is_empty() {
                    return Ok(Some(key));
                }
                "correlation expression evaluated to an empty key".to_string()
            }
            Err(e) => e.to_string(),
        };
        if self.config.ignore_invalid_correlation_keys {
            warn!(
                step = %self.parts.label,
                exchange_id = %exchange.id(),
                reason = %invalid,
                "Ignoring exchange with invalid correlation key"
            );
            Ok(None)
        } else {
            Err(ProcessingError::InvalidCorrelationKey(invalid))
        }
    }

    fn is_closed(&self, key: &str) -> bool {
        self.closed
            .as_ref()
            .map(|closed| closed.lock().contains(key))
            .unwrap_or(false)
    }

    fn size_reached(&self, size: u64, incoming: Option<&Exchange>) -> Result<bool, ProcessingError> {
        if let Some(limit) = self.config.completion_size {
            if size >= limit as u64 {
                return Ok(true);
            }
        }
        if let (Some(expression), Some(incoming)) = (&self.config.completion_size_expression, incoming) {
            if let Some(limit) = expression.evaluate(incoming)?.as_u64() {
                return Ok(size >= limit);
            }
        }
        Ok(false)
    }

    async fn aggregate(&self, key: &str, incoming: &Exchange) -> Result<Vec<Completed>, ProcessingError> {
        if self.parts.repository.is_optimistic() {
            let mut attempt = 0usize;
            loop {
                match self.aggregate_once(key, incoming).await {
                    Err(ProcessingError::OptimisticLock(_)) if self.config.optimistic_lock_retry.should_retry(attempt) => {
                        let delay = self.config.optimistic_lock_retry.delay_for(attempt);
                        debug!(step = %self.parts.label, key, attempt, ?delay, "Optimistic lock conflict, retrying");
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    other => return other,
                }
            }
        } else {
            let _guard = self.lock.lock().await;
            self.aggregate_once(key, incoming).await
        }
    }

    async fn aggregate_once(&self, key: &str, incoming: &Exchange) -> Result<Vec<Completed>, ProcessingError> {
        let mut released = Vec::new();

        if self.config.completion_on_new_correlation_group {
            let previous = self.last_group.lock().replace(key.to_string());
            if let Some(previous) = previous.filter(|previous| previous != key) {
                if let Some(done) = self.take_group(&previous, BY_NEW_GROUP).await? {
                    released.push(done);
                }
            }
        }

        let eager_match = match (&self.config.completion_predicate, self.config.eager_check_completion) {
            (Some(predicate), true) => predicate.matches(incoming)?,
            _ => false,
        };

        let stored = self.parts.repository.get(key).await?;
        let version = stored.as_ref().map(|s| s.version);
        let old = stored.map(|s| s.exchange);
        let size = aggregated_size(old.as_ref()) + 1;
        let mut aggregate = self
            .parts
            .strategy
            .aggregate(old, incoming.clone())
            .map_err(|e| ProcessingError::Aggregation(e.to_string()))?;
        aggregate.set_property(props::AGGREGATED_SIZE, size);

        let predicate_match = match &self.config.completion_predicate {
            Some(predicate) if !self.config.eager_check_completion => predicate.matches(&aggregate)?,
            _ => eager_match,
        };
        let completed_by = if predicate_match {
            Some(BY_PREDICATE)
        } else if self.size_reached(size, Some(incoming))? {
            Some(BY_SIZE)
        } else {
            None
        };

        match completed_by {
            Some(completed_by) => {
                if version.is_some() {
                    self.parts.repository.remove(key, version).await?;
                }
                self.times.remove(key);
                released.push(Completed {
                    key: key.to_string(),
                    aggregate,
                    completed_by,
                });
            }
            None => {
                let timeout = match &self.config.completion_timeout_expression {
                    Some(expression) => expression
                        .evaluate(incoming)?
                        .as_u64()
                        .map(Duration::from_millis),
                    None => self.config.completion_timeout,
                };
                self.parts.repository.add(key, aggregate, version).await?;
                let now = Instant::now();
                self.times
                    .entry(key.to_string())
                    .and_modify(|times| {
                        times.last = now;
                        times.timeout = timeout;
                    })
                    .or_insert(GroupTimes {
                        first: now,
                        last: now,
                        timeout,
                    });
            }
        }
        Ok(released)
    }

    /// Remove a stored group for completion.
    async fn take_group(&self, key: &str, completed_by: &'static str) -> Result<Option<Completed>, ProcessingError> {
        let Some(stored) = self.parts.repository.get(key).await? else {
            self.times.remove(key);
            return Ok(None);
        };
        self.parts.repository.remove(key, Some(stored.version)).await?;
        self.times.remove(key);
        Ok(Some(Completed {
            key: key.to_string(),
            aggregate: stored.exchange,
            completed_by,
        }))
    }

    fn expired(&self, now: Instant) -> Vec<(String, &'static str)> {
        self.times
            .iter()
            .filter_map(|entry| {
                let times = entry.value();
                let inactive = times.timeout.map(|t| now.duration_since(times.last) >= t).unwrap_or(false);
                let elapsed = self
                    .config
                    .completion_interval
                    .map(|i| now.duration_since(times.first) >= i)
                    .unwrap_or(false);
                match (inactive, elapsed) {
                    (true, _) => Some((entry.key().clone(), BY_TIMEOUT)),
                    (false, true) => Some((entry.key().clone(), BY_INTERVAL)),
                    _ => None,
                }
            })
            .collect()
    }

    async fn check_timeouts(&self) {
        for (key, completed_by) in self.expired(Instant::now()) {
            let taken = if self.parts.repository.is_optimistic() {
                self.take_group(&key, completed_by).await
            } else {
                let _guard = self.lock.lock().await;
                self.take_group(&key, completed_by).await
            };
            match taken {
                Ok(Some(done)) => self.release(done),
                Ok(None) => {}
                Err(e) => warn!(step = %self.parts.label, key = %key, error = %e, "Timeout completion failed"),
            }
        }
    }

    /// Complete stored groups. With `only_ready` only groups whose
    /// completion condition already holds are released.
    async fn complete_stored(&self, only_ready: bool) -> Result<usize, ProcessingError> {
        let _guard = self.lock.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = self.expired(now).into_iter().map(|(key, _)| key).collect();
        let mut count = 0;
        for key in self.parts.repository.keys().await? {
            if only_ready && !expired.contains(&key) {
                let Some(stored) = self.parts.repository.get(&key).await? else {
                    continue;
                };
                let predicate = match &self.config.completion_predicate {
                    Some(predicate) => predicate.matches(&stored.exchange).unwrap_or(false),
                    None => false,
                };
                let size = aggregated_size(Some(&stored.exchange));
                if !predicate && !self.size_reached(size, None)? {
                    continue;
                }
            }
            if let Some(done) = self.take_group(&key, BY_FORCE).await? {
                self.release(done);
                count += 1;
            }
        }
        Ok(count)
    }

    fn release(&self, done: Completed) {
        let Completed {
            key,
            mut aggregate,
            completed_by,
        } = done;
        let route_id = self.parts.route_id.clone();

        if let Some(closed) = &self.closed {
            closed.lock().put(key.clone(), ());
        }

        if completed_by == BY_TIMEOUT && self.config.discard_on_completion_timeout {
            info!(step = %self.parts.label, key = %key, "Discarding aggregate on completion timeout");
            self.parts.event_bus.publish_exchange_event(ExchangeEvent::AggregateDiscarded {
                route_id,
                correlation_key: key,
                reason: completed_by.to_string(),
            });
            return;
        }

        self.parts.strategy.on_completion(&mut aggregate);
        let size = aggregated_size(Some(&aggregate)) as usize;
        aggregate.set_property(props::AGGREGATED_COMPLETED_BY, completed_by);
        aggregate.set_property(props::AGGREGATED_CORRELATION_KEY, key.as_str());

        metrics::counter!(
            "conduit_aggregations_completed_total",
            "route" => route_id.clone(),
            "reason" => completed_by
        )
        .increment(1);
        debug!(step = %self.parts.label, key = %key, size, completed_by, "Aggregate completed");
        self.parts.event_bus.publish_exchange_event(ExchangeEvent::AggregateCompleted {
            route_id,
            correlation_key: key,
            size,
            completed_by: completed_by.to_string(),
        });

        let output = self.parts.output.clone();
        let label = self.parts.label.clone();
        let delivery = async move {
            let mut aggregate = aggregate;
            if let Err(e) = output.process(&mut aggregate).await {
                warn!(step = %label, exchange_id = %aggregate.id(), error = %e, "Aggregated exchange failed");
                aggregate.set_exception(Some(e));
            }
            unit_of_work::done(&mut aggregate).await;
        };
        if let Err((error, delivery)) = self.parts.executor.try_spawn(delivery) {
            match self.parts.executor.rejected_policy() {
                RejectedPolicy::CallerRuns => {
                    tokio::spawn(delivery);
                }
                RejectedPolicy::Abort | RejectedPolicy::Discard => {
                    warn!(step = %self.parts.label, error = %error, "Aggregated exchange dropped");
                }
            }
        }
    }
}

#[async_trait]
impl Processor for AggregateProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let core = &self.core;
        let Some(key) = core.correlation_key(exchange)? else {
            return Ok(());
        };
        if core.is_closed(&key) {
            return Err(ProcessingError::ClosedCorrelationKey(key));
        }
        for done in core.aggregate(&key, exchange).await? {
            core.release(done);
        }
        Ok(())
    }
}

#[async_trait]
impl Service for AggregateProcessor {
    fn service_name(&self) -> &str {
        &self.core.parts.label
    }

    async fn start(&self) -> Result<(), ProcessingError> {
        if !self.core.needs_checker() {
            return Ok(());
        }
        let mut checker = self.checker.lock();
        if checker.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        let core = self.core.clone();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.parts.checker_interval);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => core.check_timeouts().await,
                }
            }
        });
        debug!(step = %self.core.parts.label, interval = ?self.core.parts.checker_interval, "Started completion timeout checker");
        *checker = Some((token, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessingError> {
        let checker = self.checker.lock().take();
        if let Some((token, handle)) = checker {
            token.cancel();
            let _ = handle.await;
        }
        if self.core.config.force_completion_on_stop {
            let count = self.core.complete_stored(false).await?;
            debug!(step = %self.core.parts.label, count, "Forced completion on stop");
        } else if self.core.config.complete_all_on_stop {
            let count = self.core.complete_stored(true).await?;
            debug!(step = %self.core.parts.label, count, "Completed ready groups on stop");
        }
        Ok(())
    }
}
