// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Fan-out
//
// `FanOutEngine` runs a set of branches against copies of one inbound
// exchange and folds their results back through an aggregation strategy.
// Multicast, Split and RecipientList differ only in how they build the
// branch list.
//
// Sequential branches run in input order on the caller's task. Parallel
// branches are submitted to an executor; buffered mode folds in input order
// once every branch reported, streaming mode folds in completion order.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::basic::SendProcessor;
use super::producer_cache::{destinations, ProducerCache};
use crate::application::unit_of_work;
use crate::domain::aggregation::AggregationStrategy;
use crate::domain::errors::ProcessingError;
use crate::domain::exchange::{props, Exchange};
use crate::domain::executor::{ExecutorHandle, RejectedPolicy};
use crate::domain::expression::ExpressionRef;
use crate::domain::processor::{Processor, ProcessorRef};

/// One unit of fan-out work.
pub struct Branch {
    pub exchange: Exchange,
    pub processor: ProcessorRef,
}

/// Resolved fan-out settings.
#[derive(Clone, Default)]
pub struct FanOutSettings {
    pub parallel: bool,
    pub executor: Option<ExecutorHandle>,
    pub timeout: Option<Duration>,
    pub streaming: bool,
    pub stop_on_exception: bool,
    pub share_unit_of_work: bool,
    pub discard_on_aggregation_failure: bool,
}

pub struct FanOutEngine {
    label: String,
    settings: FanOutSettings,
    strategy: Arc<dyn AggregationStrategy>,
}

async fn run_branch(processor: ProcessorRef, mut exchange: Exchange, share_unit_of_work: bool) -> Exchange {
    if let Err(e) = processor.process(&mut exchange).await {
        exchange.set_exception(Some(e));
    }
    if !share_unit_of_work {
        unit_of_work::done(&mut exchange).await;
    }
    exchange
}

fn join_failure(error: tokio::task::JoinError) -> Exchange {
    let mut exchange = Exchange::default();
    exchange.set_exception(Some(ProcessingError::custom("BranchPanicked", error.to_string())));
    exchange
}

impl FanOutEngine {
    pub fn new(label: impl Into<String>, settings: FanOutSettings, strategy: Arc<dyn AggregationStrategy>) -> Self {
        Self {
            label: label.into(),
            settings,
            strategy,
        }
    }

    pub fn settings(&self) -> &FanOutSettings {
        &self.settings
    }

    pub async fn run(&self, original: &mut Exchange, branches: Vec<Branch>) -> Result<(), ProcessingError> {
        if branches.is_empty() {
            debug!(step = %self.label, exchange_id = %original.id(), "No branches to run");
            return Ok(());
        }
        debug!(
            step = %self.label,
            exchange_id = %original.id(),
            branches = branches.len(),
            parallel = self.settings.parallel,
            "Fanning out"
        );
        let aggregate = if self.settings.parallel {
            self.run_parallel(original, branches).await?
        } else {
            self.run_sequential(original, branches).await?
        };
        self.complete(original, aggregate)
    }

    async fn run_sequential(
        &self,
        original: &mut Exchange,
        branches: Vec<Branch>,
    ) -> Result<Option<Exchange>, ProcessingError> {
        let mut acc = None;
        for (index, branch) in branches.into_iter().enumerate() {
            let mut result = run_branch(branch.processor, branch.exchange, self.settings.share_unit_of_work).await;
            if self.settings.share_unit_of_work {
                original.handover_synchronizations(&mut result);
            }
            if result.is_failed() && self.settings.stop_on_exception {
                return Err(self.surface(original, result, index));
            }
            acc = self.fold(acc, result)?;
        }
        Ok(acc)
    }

    async fn run_parallel(
        &self,
        original: &mut Exchange,
        branches: Vec<Branch>,
    ) -> Result<Option<Exchange>, ProcessingError> {
        let total = branches.len();
        let share = self.settings.share_unit_of_work;
        let mut pending: FuturesUnordered<BoxFuture<'static, (usize, Exchange)>> = FuturesUnordered::new();
        let mut aborts: Vec<AbortHandle> = Vec::new();
        let abort_all = |aborts: &[AbortHandle]| aborts.iter().for_each(AbortHandle::abort);

        for (index, branch) in branches.into_iter().enumerate() {
            let work = async move { (index, run_branch(branch.processor, branch.exchange, share).await) };
            let Some(executor) = &self.settings.executor else {
                pending.push(work.boxed());
                continue;
            };
            match executor.try_spawn(work) {
                Ok(handle) => {
                    aborts.push(handle.abort_handle());
                    pending.push(
                        async move {
                            match handle.await {
                                Ok(done) => done,
                                Err(e) => (index, join_failure(e)),
                            }
                        }
                        .boxed(),
                    );
                }
                Err((error, work)) => match executor.rejected_policy() {
                    RejectedPolicy::CallerRuns => pending.push(work.boxed()),
                    RejectedPolicy::Discard => {
                        warn!(step = %self.label, branch = index, "Executor rejected branch, discarding");
                    }
                    RejectedPolicy::Abort => {
                        abort_all(&aborts);
                        return Err(error);
                    }
                },
            }
        }

        let deadline = self
            .settings
            .timeout
            .map(|timeout| (tokio::time::Instant::now() + timeout, timeout));
        let mut buffered: Vec<Option<Exchange>> = (0..total).map(|_| None).collect();
        let mut acc = None;
        let mut completed = 0usize;

        loop {
            let next = match deadline {
                Some((at, timeout)) => match tokio::time::timeout_at(at, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        abort_all(&aborts);
                        let partial = if self.settings.streaming {
                            acc
                        } else {
                            self.fold_lenient(buffered)
                        };
                        self.strategy.timeout(partial.as_ref(), completed, total, timeout);
                        warn!(step = %self.label, completed, total, ?timeout, "Parallel fan-out timed out");
                        return Err(ProcessingError::Timeout(timeout));
                    }
                },
                None => pending.next().await,
            };
            let Some((index, mut result)) = next else {
                break;
            };
            completed += 1;
            if share {
                original.handover_synchronizations(&mut result);
            }
            if result.is_failed() && self.settings.stop_on_exception {
                abort_all(&aborts);
                return Err(self.surface(original, result, index));
            }
            if self.settings.streaming {
                acc = self.fold(acc, result)?;
            } else if let Some(slot) = buffered.get_mut(index) {
                *slot = Some(result);
            }
        }

        if !self.settings.streaming {
            for result in buffered.into_iter().flatten() {
                acc = self.fold(acc, result)?;
            }
        }
        Ok(acc)
    }

    fn fold(&self, acc: Option<Exchange>, result: Exchange) -> Result<Option<Exchange>, ProcessingError> {
        if !self.settings.discard_on_aggregation_failure {
            return self.strategy.aggregate(acc, result).map(Some);
        }
        if result.is_failed() {
            warn!(
                step = %self.label,
                error = ?result.exception().map(ToString::to_string),
                "Discarding failed branch from aggregation"
            );
            return Ok(acc);
        }
        match self.strategy.aggregate(acc.clone(), result) {
            Ok(folded) => Ok(Some(folded)),
            Err(e) => {
                warn!(step = %self.label, error = %e, "Aggregation failed, discarding branch result");
                Ok(acc)
            }
        }
    }

    fn fold_lenient(&self, results: Vec<Option<Exchange>>) -> Option<Exchange> {
        results
            .into_iter()
            .flatten()
            .fold(None, |acc, result| match self.strategy.aggregate(acc.clone(), result) {
                Ok(folded) => Some(folded),
                Err(_) => acc,
            })
    }

    /// Hand the failed branch's outcome to the inbound exchange and return
    /// its error.
    fn surface(&self, original: &mut Exchange, mut failed: Exchange, index: usize) -> ProcessingError {
        let error = failed
            .take_exception()
            .unwrap_or_else(|| ProcessingError::custom("BranchFailed", format!("branch {index} failed")));
        debug!(step = %self.label, branch = index, error = %error, "Stopping fan-out on exception");
        original.copy_results_from(&failed);
        error
    }

    fn complete(&self, original: &mut Exchange, aggregate: Option<Exchange>) -> Result<(), ProcessingError> {
        let Some(mut aggregate) = aggregate else {
            return Ok(());
        };
        self.strategy.on_completion(&mut aggregate);
        let failure = aggregate.take_exception();
        if !self.strategy.prefers_original() {
            original.copy_results_from(&aggregate);
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Multicast
// ============================================================================

/// Sends a copy of the exchange to every child.
pub struct MulticastProcessor {
    outputs: Vec<ProcessorRef>,
    engine: FanOutEngine,
}

impl MulticastProcessor {
    pub fn new(outputs: Vec<ProcessorRef>, engine: FanOutEngine) -> Self {
        Self { outputs, engine }
    }
}

#[async_trait]
impl Processor for MulticastProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let branches = self
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| {
                let mut copy = exchange.copy();
                copy.set_property(props::MULTICAST_INDEX, index);
                Branch {
                    exchange: copy,
                    processor: output.clone(),
                }
            })
            .collect();
        self.engine.run(exchange, branches).await
    }
}

// ============================================================================
// Split
// ============================================================================

pub struct SplitProcessor {
    expression: ExpressionRef,
    body: ProcessorRef,
    engine: FanOutEngine,
}

impl SplitProcessor {
    pub fn new(expression: ExpressionRef, body: ProcessorRef, engine: FanOutEngine) -> Self {
        Self {
            expression,
            body,
            engine,
        }
    }
}

fn split_items(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

#[async_trait]
impl Processor for SplitProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let items = split_items(self.expression.evaluate(exchange)?);
        let size = items.len();
        let branches = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let mut piece = exchange.copy();
                piece.set_body(item);
                piece.set_property(props::SPLIT_INDEX, index);
                piece.set_property(props::SPLIT_SIZE, size);
                piece.set_property(props::SPLIT_COMPLETE, index + 1 == size);
                Branch {
                    exchange: piece,
                    processor: self.body.clone(),
                }
            })
            .collect();
        self.engine.run(exchange, branches).await
    }
}

// ============================================================================
// Recipient List
// ============================================================================

pub struct RecipientListProcessor {
    expression: ExpressionRef,
    delimiter: String,
    ignore_invalid_endpoints: bool,
    cache: ProducerCache,
    engine: FanOutEngine,
}

impl RecipientListProcessor {
    pub fn new(
        expression: ExpressionRef,
        delimiter: impl Into<String>,
        ignore_invalid_endpoints: bool,
        cache: ProducerCache,
        engine: FanOutEngine,
    ) -> Self {
        Self {
            expression,
            delimiter: delimiter.into(),
            ignore_invalid_endpoints,
            cache,
            engine,
        }
    }
}

#[async_trait]
impl Processor for RecipientListProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let value = self.expression.evaluate(exchange)?;
        let mut branches = Vec::new();
        for uri in destinations(&value, &self.delimiter) {
            let endpoint = match self.cache.acquire(&uri) {
                Ok(endpoint) => endpoint,
                Err(e) if self.ignore_invalid_endpoints => {
                    warn!(uri = %uri, error = %e, "Ignoring invalid recipient");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut copy = exchange.copy();
            copy.set_property(props::RECIPIENT_ENDPOINT, uri.as_str());
            branches.push(Branch {
                exchange: copy,
                processor: Arc::new(SendProcessor::new(endpoint, None)),
            });
        }
        self.engine.run(exchange, branches).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregation::{GroupedBody, UseLatest};
    use crate::domain::endpoint::EndpointResolver;
    use crate::domain::executor::ThreadPoolProfile;
    use crate::domain::expression::Expr;
    use crate::domain::processor::FnProcessor;
    use crate::infrastructure::endpoints::EndpointRegistry;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recording(log: Arc<Mutex<Vec<usize>>>, index: usize) -> ProcessorRef {
        FnProcessor::shared(move |ex| {
            log.lock().push(index);
            ex.set_body(json!(index));
            Ok(())
        })
    }

    fn failing() -> ProcessorRef {
        FnProcessor::shared(|_| Err(ProcessingError::custom("BranchError", "branch 2 failed")))
    }

    #[tokio::test]
    async fn test_sequential_stop_on_exception_skips_remaining() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let settings = FanOutSettings {
            stop_on_exception: true,
            ..FanOutSettings::default()
        };
        let multicast = MulticastProcessor::new(
            vec![recording(log.clone(), 1), failing(), recording(log.clone(), 3)],
            FanOutEngine::new("multicast1", settings, Arc::new(UseLatest)),
        );

        let mut exchange = Exchange::new("in");
        let err = multicast.process(&mut exchange).await.unwrap_err();
        assert_eq!(err.type_name(), "BranchError");
        assert_eq!(*log.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_failure_without_stop_runs_all_branches() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let multicast = MulticastProcessor::new(
            vec![recording(log.clone(), 1), failing(), recording(log.clone(), 3)],
            FanOutEngine::new("multicast1", FanOutSettings::default(), Arc::new(UseLatest)),
        );

        let mut exchange = Exchange::new("in");
        assert!(multicast.process(&mut exchange).await.is_err());
        assert_eq!(*log.lock(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_discard_failed_branches() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let settings = FanOutSettings {
            discard_on_aggregation_failure: true,
            ..FanOutSettings::default()
        };
        let multicast = MulticastProcessor::new(
            vec![recording(log.clone(), 1), failing(), recording(log.clone(), 3)],
            FanOutEngine::new("multicast1", settings, Arc::new(GroupedBody)),
        );

        let mut exchange = Exchange::new("in");
        multicast.process(&mut exchange).await.unwrap();
        assert_eq!(exchange.body(), &json!([1, 3]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_buffered_keeps_input_order() {
        let executor = ExecutorHandle::new("split", ThreadPoolProfile::new("split"));
        let settings = FanOutSettings {
            parallel: true,
            executor: Some(executor),
            ..FanOutSettings::default()
        };
        let slow_first = FnProcessor::shared(|ex| {
            let n = ex.body().as_i64().unwrap_or(0);
            std::thread::sleep(Duration::from_millis((5 - n as u64) * 5));
            ex.set_body(json!(n * 10));
            Ok(())
        });
        let split = SplitProcessor::new(
            Expr::body().shared(),
            slow_first,
            FanOutEngine::new("split1", settings, Arc::new(GroupedBody)),
        );

        let mut exchange = Exchange::new(json!([1, 2, 3, 4]));
        split.process(&mut exchange).await.unwrap();
        assert_eq!(exchange.body(), &json!([10, 20, 30, 40]));
    }

    #[tokio::test]
    async fn test_parallel_timeout() {
        let endpoints = EndpointRegistry::new();
        let slow = endpoints.mock("slow");
        slow.set_delay(Duration::from_secs(5));
        let resolver: Arc<dyn EndpointResolver> = Arc::new(endpoints);
        let endpoint = resolver.resolve("mock:slow").unwrap();

        let settings = FanOutSettings {
            parallel: true,
            timeout: Some(Duration::from_millis(50)),
            ..FanOutSettings::default()
        };
        let multicast = MulticastProcessor::new(
            vec![Arc::new(SendProcessor::new(endpoint, None))],
            FanOutEngine::new("multicast1", settings, Arc::new(UseLatest)),
        );
        let mut exchange = Exchange::new("in");
        let err = multicast.process(&mut exchange).await.unwrap_err();
        assert!(matches!(err, ProcessingError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_split_sets_index_properties() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = seen.clone();
            FnProcessor::shared(move |ex| {
                seen.lock().push((
                    ex.property(props::SPLIT_INDEX).cloned(),
                    ex.property(props::SPLIT_COMPLETE).cloned(),
                ));
                Ok(())
            })
        };
        let split = SplitProcessor::new(
            Expr::tokenize(Expr::body(), ",").shared(),
            recorder,
            FanOutEngine::new("split1", FanOutSettings::default(), Arc::new(UseLatest)),
        );
        let mut exchange = Exchange::new("a,b");
        split.process(&mut exchange).await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                (Some(json!(0)), Some(json!(false))),
                (Some(json!(1)), Some(json!(true)))
            ]
        );
    }

    #[tokio::test]
    async fn test_recipient_list_ignores_invalid() {
        let endpoints = Arc::new(EndpointRegistry::new());
        let resolver: Arc<dyn EndpointResolver> = endpoints.clone();
        let list = RecipientListProcessor::new(
            Expr::header("to").shared(),
            ",",
            true,
            ProducerCache::new(resolver, 10),
            FanOutEngine::new("recipientList1", FanOutSettings::default(), Arc::new(UseLatest)),
        );

        let mut exchange = Exchange::new("order").with_header("to", "mock:a,bogus,mock:b");
        list.process(&mut exchange).await.unwrap();
        assert_eq!(endpoints.mock("a").received_count(), 1);
        assert_eq!(endpoints.mock("b").received_count(), 1);
        assert_eq!(
            endpoints.mock("b").received_exchanges()[0].property(props::RECIPIENT_ENDPOINT),
            Some(&json!("mock:b"))
        );
    }
}
