// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Resequencer
//
// Batch mode collects up to `size` exchanges or until `timeout` elapsed since
// the first one, sorts them by the sequence expression and flushes them in
// order. Stream mode keeps a bounded buffer sorted by a comparator and
// delivers the head once it directly follows the last delivered element or
// its delivery deadline passed. A delivery across a gap is flagged with
// `RESEQUENCE_GAP` and reported on the event bus.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::unit_of_work;
use crate::domain::comparator::SequenceComparator;
use crate::domain::errors::ProcessingError;
use crate::domain::events::ExchangeEvent;
use crate::domain::exchange::{props, Exchange};
use crate::domain::expression::{compare_values, value_to_key, values_equal, ExpressionRef};
use crate::domain::processor::{Processor, ProcessorRef, Service};
use crate::domain::step::{BatchResequence, StreamResequence};
use crate::infrastructure::event_bus::EventBus;

async fn deliver(label: &str, output: &ProcessorRef, mut exchange: Exchange) {
    if let Err(e) = output.process(&mut exchange).await {
        warn!(step = %label, exchange_id = %exchange.id(), error = %e, "Resequenced exchange failed");
        exchange.set_exception(Some(e));
    }
    unit_of_work::done(&mut exchange).await;
}

fn sequence_of(
    label: &str,
    expression: &ExpressionRef,
    exchange: &Exchange,
    ignore_invalid: bool,
    is_valid: impl Fn(&Value) -> bool,
) -> Result<Option<Value>, ProcessingError> {
    let reason = match expression.evaluate(exchange) {
        Ok(value) if !value.is_null() && is_valid(&value) => return Ok(Some(value)),
        Ok(value) => format!("invalid sequence value {value}"),
        Err(e) => e.to_string(),
    };
    if ignore_invalid {
        warn!(step = %label, exchange_id = %exchange.id(), reason = %reason, "Ignoring exchange with invalid sequence");
        Ok(None)
    } else {
        Err(ProcessingError::MessageRejected(reason))
    }
}

// ============================================================================
// Batch
// ============================================================================

struct BatchCore {
    label: String,
    expression: ExpressionRef,
    settings: BatchResequence,
    output: ProcessorRef,
}

impl BatchCore {
    /// Sort a collected batch; duplicates keep their first occurrence unless
    /// allowed.
    fn order(&self, batch: Vec<(Value, Exchange)>) -> Vec<Exchange> {
        let mut batch = batch;
        batch.sort_by(|a, b| compare_values(&a.0, &b.0).unwrap_or(Ordering::Equal));
        if self.settings.reverse {
            batch.reverse();
        }
        if !self.settings.allow_duplicates {
            let mut kept: Vec<(Value, Exchange)> = Vec::with_capacity(batch.len());
            for (key, exchange) in batch {
                if kept.iter().any(|(seen, _)| values_equal(seen, &key)) {
                    debug!(step = %self.label, sequence = %value_to_key(&key), "Dropping duplicate from batch");
                    continue;
                }
                kept.push((key, exchange));
            }
            batch = kept;
        }
        batch.into_iter().map(|(_, exchange)| exchange).collect()
    }

    async fn flush(&self, batch: Vec<(Value, Exchange)>) {
        if batch.is_empty() {
            return;
        }
        debug!(step = %self.label, size = batch.len(), "Flushing resequenced batch");
        for exchange in self.order(batch) {
            deliver(&self.label, &self.output, exchange).await;
        }
    }
}

type BatchReceiver = mpsc::UnboundedReceiver<(Value, Exchange)>;

pub struct BatchResequencer {
    core: Arc<BatchCore>,
    sender: mpsc::UnboundedSender<(Value, Exchange)>,
    receiver: Mutex<Option<BatchReceiver>>,
    collector: Mutex<Option<(CancellationToken, JoinHandle<BatchReceiver>)>>,
}

impl BatchResequencer {
    pub fn new(label: impl Into<String>, expression: ExpressionRef, settings: BatchResequence, output: ProcessorRef) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(BatchCore {
                label: label.into(),
                expression,
                settings,
                output,
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            collector: Mutex::new(None),
        }
    }
}

async fn collect_batches(core: Arc<BatchCore>, mut receiver: BatchReceiver, token: CancellationToken) -> BatchReceiver {
    let size = core.settings.size.max(1);
    loop {
        let first = tokio::select! {
            _ = token.cancelled() => break,
            first = receiver.recv() => match first {
                Some(first) => first,
                None => break,
            },
        };
        let deadline = Instant::now() + core.settings.timeout;
        let mut batch = vec![first];
        while batch.len() < size {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = token.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(next) => batch.push(next),
                    None => break,
                },
            }
        }
        core.flush(batch).await;
    }

    let mut rest = Vec::new();
    while let Ok(next) = receiver.try_recv() {
        rest.push(next);
    }
    core.flush(rest).await;
    receiver
}

#[async_trait]
impl Processor for BatchResequencer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let core = &self.core;
        let Some(key) = sequence_of(
            &core.label,
            &core.expression,
            exchange,
            core.settings.ignore_invalid_exchanges,
            |_| true,
        )?
        else {
            return Ok(());
        };
        self.sender
            .send((key, exchange.clone()))
            .map_err(|_| ProcessingError::NotStarted(core.label.clone()))
    }
}

#[async_trait]
impl Service for BatchResequencer {
    fn service_name(&self) -> &str {
        &self.core.label
    }

    async fn start(&self) -> Result<(), ProcessingError> {
        let mut collector = self.collector.lock();
        if collector.is_some() {
            return Ok(());
        }
        let Some(receiver) = self.receiver.lock().take() else {
            return Err(ProcessingError::NotStarted(self.core.label.clone()));
        };
        let token = CancellationToken::new();
        let handle = tokio::spawn(collect_batches(self.core.clone(), receiver, token.clone()));
        *collector = Some((token, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessingError> {
        let collector = self.collector.lock().take();
        if let Some((token, handle)) = collector {
            token.cancel();
            match handle.await {
                Ok(receiver) => *self.receiver.lock() = Some(receiver),
                Err(e) => warn!(step = %self.core.label, error = %e, "Batch collector ended abnormally"),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Stream
// ============================================================================

struct Element {
    key: Value,
    exchange: Exchange,
    deadline: Instant,
    released: bool,
    _slot: OwnedSemaphorePermit,
}

#[derive(Default)]
struct StreamState {
    buffer: Vec<Element>,
    last_delivered: Option<Value>,
}

struct Ready {
    exchange: Exchange,
    gap_after: Option<Value>,
    sequence: Value,
}

struct StreamCore {
    route_id: String,
    label: String,
    expression: ExpressionRef,
    settings: StreamResequence,
    comparator: Arc<dyn SequenceComparator>,
    output: ProcessorRef,
    event_bus: EventBus,
    state: Mutex<StreamState>,
    slots: Arc<Semaphore>,
    wake: Notify,
}

impl StreamCore {
    fn skip(&self, sequence: &Value, reason: String) -> Result<(), ProcessingError> {
        if self.settings.reject_old {
            return Err(ProcessingError::MessageRejected(reason));
        }
        debug!(step = %self.label, sequence = %value_to_key(sequence), reason = %reason, "Skipping stale element");
        self.event_bus.publish_exchange_event(ExchangeEvent::ResequenceSkipped {
            route_id: self.route_id.clone(),
            sequence: value_to_key(sequence),
            reason,
        });
        Ok(())
    }

    /// Why `key` cannot enter the buffer, if it cannot.
    fn rejection(&self, state: &StreamState, key: &Value) -> Option<String> {
        if let Some(last) = &state.last_delivered {
            if self.comparator.compare(key, last) != Ordering::Greater {
                return Some(format!(
                    "sequence {} is not after last delivered {}",
                    value_to_key(key),
                    value_to_key(last)
                ));
            }
        }
        state
            .buffer
            .iter()
            .any(|e| self.comparator.compare(&e.key, key) == Ordering::Equal)
            .then(|| format!("duplicate sequence {}", value_to_key(key)))
    }

    /// Early check so stale or duplicate elements do not wait for a slot.
    fn admissible(&self, key: &Value) -> Result<bool, ProcessingError> {
        let reason = self.rejection(&self.state.lock(), key);
        match reason {
            Some(reason) => self.skip(key, reason).map(|_| false),
            None => Ok(true),
        }
    }

    /// Admissibility is checked again under the lock: while waiting for a
    /// slot, a newer element may have been delivered or an equal one buffered.
    fn insert(&self, key: Value, exchange: Exchange, slot: OwnedSemaphorePermit) -> Result<(), ProcessingError> {
        let mut state = self.state.lock();
        if let Some(reason) = self.rejection(&state, &key) {
            drop(state);
            drop(slot);
            return self.skip(&key, reason);
        }
        let position = state
            .buffer
            .partition_point(|e| self.comparator.compare(&e.key, &key) == Ordering::Less);
        state.buffer.insert(
            position,
            Element {
                key,
                exchange,
                deadline: Instant::now() + self.settings.timeout,
                released: false,
                _slot: slot,
            },
        );
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    /// Pop every deliverable element. `flush` releases the whole buffer.
    fn take_ready(&self, now: Instant, flush: bool) -> (Vec<Ready>, Option<Instant>) {
        let mut state = self.state.lock();
        let expired = state.buffer.iter().rposition(|e| flush || e.deadline <= now);
        if let Some(position) = expired {
            // an expired element releases everything ordered before it
            for element in &mut state.buffer[..=position] {
                element.released = true;
            }
        }

        let mut ready = Vec::new();
        while let Some(head) = state.buffer.first() {
            let successor = state
                .last_delivered
                .as_ref()
                .map(|last| self.comparator.is_successor(&head.key, last))
                .unwrap_or(false);
            if !successor && !head.released {
                break;
            }
            let element = state.buffer.remove(0);
            let gap_after = if successor { None } else { state.last_delivered.clone() };
            state.last_delivered = Some(element.key.clone());
            ready.push(Ready {
                exchange: element.exchange,
                gap_after,
                sequence: element.key,
            });
        }
        let next_deadline = state.buffer.iter().filter(|e| !e.released).map(|e| e.deadline).min();
        (ready, next_deadline)
    }

    async fn deliver_ready(&self, ready: Vec<Ready>) {
        for Ready {
            mut exchange,
            gap_after,
            sequence,
        } in ready
        {
            if let Some(last) = gap_after {
                warn!(
                    step = %self.label,
                    last_delivered = %value_to_key(&last),
                    delivered = %value_to_key(&sequence),
                    "Delivering across sequence gap"
                );
                exchange.set_property(props::RESEQUENCE_GAP, true);
                self.event_bus.publish_exchange_event(ExchangeEvent::ResequenceGap {
                    route_id: self.route_id.clone(),
                    last_delivered: value_to_key(&last),
                    delivered: value_to_key(&sequence),
                });
            }
            deliver(&self.label, &self.output, exchange).await;
        }
    }
}

async fn run_delivery(core: Arc<StreamCore>, token: CancellationToken) {
    loop {
        let (ready, next_deadline) = core.take_ready(Instant::now(), false);
        core.deliver_ready(ready).await;
        let sleep_until = next_deadline.unwrap_or_else(|| Instant::now() + core.settings.timeout);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = core.wake.notified() => {}
            _ = tokio::time::sleep_until(sleep_until) => {}
        }
    }
    let (rest, _) = core.take_ready(Instant::now(), true);
    core.deliver_ready(rest).await;
}

pub struct StreamResequencer {
    core: Arc<StreamCore>,
    delivery: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Collaborators of a stream resequencer besides its settings.
pub struct StreamParts {
    pub route_id: String,
    pub label: String,
    pub comparator: Arc<dyn SequenceComparator>,
    pub output: ProcessorRef,
    pub event_bus: EventBus,
}

impl StreamResequencer {
    pub fn new(expression: ExpressionRef, settings: StreamResequence, parts: StreamParts) -> Self {
        let slots = Arc::new(Semaphore::new(settings.capacity.max(1)));
        Self {
            core: Arc::new(StreamCore {
                route_id: parts.route_id,
                label: parts.label,
                expression,
                settings,
                comparator: parts.comparator,
                output: parts.output,
                event_bus: parts.event_bus,
                state: Mutex::new(StreamState::default()),
                slots,
                wake: Notify::new(),
            }),
            delivery: Mutex::new(None),
        }
    }

    pub fn buffered(&self) -> usize {
        self.core.state.lock().buffer.len()
    }
}

#[async_trait]
impl Processor for StreamResequencer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let core = &self.core;
        let comparator = core.comparator.clone();
        let Some(key) = sequence_of(
            &core.label,
            &core.expression,
            exchange,
            core.settings.ignore_invalid_exchanges,
            move |value| comparator.is_valid(value),
        )?
        else {
            return Ok(());
        };
        if !core.admissible(&key)? {
            return Ok(());
        }
        // blocks while the buffer is at capacity
        let slot = core
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProcessingError::NotStarted(core.label.clone()))?;
        core.insert(key, exchange.clone(), slot)
    }
}

#[async_trait]
impl Service for StreamResequencer {
    fn service_name(&self) -> &str {
        &self.core.label
    }

    async fn start(&self) -> Result<(), ProcessingError> {
        let mut delivery = self.delivery.lock();
        if delivery.is_none() {
            let token = CancellationToken::new();
            let handle = tokio::spawn(run_delivery(self.core.clone(), token.clone()));
            *delivery = Some((token, handle));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessingError> {
        let delivery = self.delivery.lock().take();
        if let Some((token, handle)) = delivery {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(step = %self.core.label, error = %e, "Stream delivery ended abnormally");
            }
        }
        Ok(())
    }
}
