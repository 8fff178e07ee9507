// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::errors::ProcessingError;
use crate::domain::exchange::Exchange;
use crate::domain::executor::{ExecutorHandle, RejectedPolicy};
use crate::domain::expression::ExpressionRef;
use crate::domain::processor::{Processor, ProcessorRef};

/// Policy applied when `executor` rejects a task. `caller_runs = false`
/// downgrades a caller-runs pool to abort.
fn rejection_policy(executor: &ExecutorHandle, caller_runs: bool) -> RejectedPolicy {
    match (caller_runs, executor.rejected_policy()) {
        (true, _) => RejectedPolicy::CallerRuns,
        (false, RejectedPolicy::CallerRuns) => RejectedPolicy::Abort,
        (false, policy) => policy,
    }
}

/// Run `task` on `executor` and wait for its output. `Ok(None)` means the
/// task was rejected and discarded.
pub async fn hand_off<F>(
    executor: &ExecutorHandle,
    caller_runs: bool,
    task: F,
) -> Result<Option<F::Output>, ProcessingError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match executor.try_spawn(task) {
        Ok(handle) => handle
            .await
            .map(Some)
            .map_err(|e| ProcessingError::RejectedExecution(format!("{}: {e}", executor.name()))),
        Err((error, task)) => match rejection_policy(executor, caller_runs) {
            RejectedPolicy::CallerRuns => {
                debug!(pool = %executor.name(), "Pool rejected task, running on caller");
                Ok(Some(task.await))
            }
            RejectedPolicy::Discard => {
                warn!(pool = %executor.name(), "Pool rejected task, discarding");
                Ok(None)
            }
            RejectedPolicy::Abort => Err(error),
        },
    }
}

/// Milliseconds from a delay expression result. Null or negative means no
/// delay.
pub fn delay_millis(value: &Value) -> Result<u64, ProcessingError> {
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => Ok(n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(|ms| ms.max(0) as u64)
            .map_err(|_| ProcessingError::Expression(format!("'{s}' is not a delay in milliseconds"))),
        other => Err(ProcessingError::Expression(format!("{other} is not a delay in milliseconds"))),
    }
}

pub struct DelayProcessor {
    delay: ExpressionRef,
    executor: Option<ExecutorHandle>,
    caller_runs_when_rejected: bool,
}

impl DelayProcessor {
    /// With an executor the wait runs on that pool.
    pub fn new(delay: ExpressionRef, executor: Option<ExecutorHandle>, caller_runs_when_rejected: bool) -> Self {
        Self {
            delay,
            executor,
            caller_runs_when_rejected,
        }
    }
}

#[async_trait]
impl Processor for DelayProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let millis = delay_millis(&self.delay.evaluate(exchange)?)?;
        if millis == 0 {
            return Ok(());
        }
        let delay = Duration::from_millis(millis);
        debug!(exchange_id = %exchange.id(), ?delay, "Delaying exchange");
        match &self.executor {
            None => tokio::time::sleep(delay).await,
            Some(executor) => {
                let waited = hand_off(executor, self.caller_runs_when_rejected, tokio::time::sleep(delay)).await?;
                if waited.is_none() {
                    exchange.stop_route();
                }
            }
        }
        Ok(())
    }
}

/// Continues the exchange through `body` on another pool.
pub struct ThreadsProcessor {
    executor: ExecutorHandle,
    body: ProcessorRef,
    caller_runs_when_rejected: bool,
}

impl ThreadsProcessor {
    pub fn new(executor: ExecutorHandle, body: ProcessorRef, caller_runs_when_rejected: bool) -> Self {
        Self {
            executor,
            body,
            caller_runs_when_rejected,
        }
    }
}

#[async_trait]
impl Processor for ThreadsProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        // the task takes the exchange from the slot only once it actually runs
        let slot = Arc::new(Mutex::new(Some(std::mem::take(exchange))));
        let body = self.body.clone();
        let task_slot = slot.clone();
        let task = async move {
            let Some(mut moved) = task_slot.lock().take() else {
                return (Exchange::default(), Ok(()));
            };
            let result = body.process(&mut moved).await;
            (moved, result)
        };

        let outcome = hand_off(&self.executor, self.caller_runs_when_rejected, task).await;
        let reclaim = slot.lock().take();
        match outcome {
            Ok(Some((moved, result))) => {
                *exchange = moved;
                result
            }
            Ok(None) => {
                *exchange = reclaim.unwrap_or_default();
                exchange.stop_route();
                Ok(())
            }
            Err(e) => {
                *exchange = reclaim.unwrap_or_default();
                Err(e)
            }
        }
    }
}
