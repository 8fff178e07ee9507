// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use conduit_core::application::processors::basic::SendProcessor;
use conduit_core::application::processors::resequence::{StreamParts, StreamResequencer};
use conduit_core::domain::aggregation::{AggregationRepository, AggregationStrategy, GroupedBody, VersionedExchange};
use conduit_core::domain::comparator::NumericSequence;
use conduit_core::domain::endpoint::EndpointResolver;
use conduit_core::domain::errors::ProcessingError;
use conduit_core::domain::exchange::Exchange;
use conduit_core::domain::expression::Expr;
use conduit_core::domain::idempotent::IdempotentRepository;
use conduit_core::domain::processor::{Processor, ProcessorRef, Service};
use conduit_core::domain::registry::BeanRef;
use conduit_core::domain::route::{RouteDefinition, StepDefinition};
use conduit_core::domain::step::{
    AggregateConfig, BatchResequence, FanOutOptions, IdempotentConfig, OptimisticLockRetryPolicy, ResequenceConfig,
    ResequenceMode, StepKind, StreamResequence, ThrottleConfig, ThrottleMode,
};
use conduit_core::infrastructure::aggregation_repository::MemoryAggregationRepository;
use conduit_core::infrastructure::endpoints::{EndpointRegistry, MockEndpoint};
use conduit_core::infrastructure::event_bus::EventBus;
use conduit_core::infrastructure::idempotent_repository::MemoryIdempotentRepository;
use conduit_core::{EngineConfig, EngineContext};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

async fn started(definition: RouteDefinition) -> EngineContext {
    let context = EngineContext::new(EngineConfig::default());
    let strategy: Arc<dyn AggregationStrategy> = Arc::new(GroupedBody);
    context.registry().bind("grouped", strategy);
    let repository: Arc<dyn IdempotentRepository> = Arc::new(MemoryIdempotentRepository::default());
    context.registry().bind("seen", repository);

    context.add_route(definition).await.unwrap();
    context.start().await.unwrap();
    context
}

// ============================================================================
// Aggregator
// ============================================================================

fn aggregate(configure: impl FnOnce(&mut AggregateConfig)) -> RouteDefinition {
    let mut config = AggregateConfig::new(Expr::header("order").shared());
    config.strategy = Some(BeanRef::named("grouped"));
    config.completion_timeout_checker_interval = Some(Duration::from_millis(20));
    configure(&mut config);
    RouteDefinition::new("orders", "direct:orders")
        .step(StepDefinition::new(StepKind::Aggregate(Box::new(config))).child(StepKind::to("mock:batched").into()))
        .unwrap()
}

#[tokio::test]
async fn test_aggregate_completes_by_size() {
    let context = started(aggregate(|config| config.completion_size = Some(3))).await;
    for n in 1..=3 {
        let mut exchange = Exchange::new(n).with_header("order", "A");
        context.send("direct:orders", &mut exchange).await.unwrap();
    }

    let batched = context.endpoints().mock("batched");
    assert!(batched.await_count(1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(batched.received_bodies(), vec![json!([1, 2, 3])]);
    context.stop().await;
}

#[tokio::test]
async fn test_aggregate_completes_partial_group_on_timeout() {
    let context = started(aggregate(|config| {
        config.completion_size = Some(3);
        config.completion_timeout = Some(Duration::from_millis(100));
    }))
    .await;
    for n in 1..=2 {
        let mut exchange = Exchange::new(n).with_header("order", "B");
        context.send("direct:orders", &mut exchange).await.unwrap();
    }

    let batched = context.endpoints().mock("batched");
    assert!(batched.await_count(1, Duration::from_secs(3)).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(batched.received_bodies(), vec![json!([1, 2])]);
    context.stop().await;
}

/// Optimistic store that fails the next `conflicts` writes.
struct ContendedRepository {
    inner: MemoryAggregationRepository,
    conflicts: AtomicUsize,
}

impl ContendedRepository {
    fn new(conflicts: usize) -> Self {
        Self {
            inner: MemoryAggregationRepository::optimistic(),
            conflicts: AtomicUsize::new(conflicts),
        }
    }

    fn remaining_conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AggregationRepository for ContendedRepository {
    async fn get(&self, key: &str) -> Result<Option<VersionedExchange>, ProcessingError> {
        self.inner.get(key).await
    }

    async fn add(&self, key: &str, exchange: Exchange, expected_version: Option<u64>) -> Result<u64, ProcessingError> {
        let conflict = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict {
            return Err(ProcessingError::OptimisticLock(key.to_string()));
        }
        self.inner.add(key, exchange, expected_version).await
    }

    async fn remove(&self, key: &str, expected_version: Option<u64>) -> Result<(), ProcessingError> {
        self.inner.remove(key, expected_version).await
    }

    async fn keys(&self) -> Result<Vec<String>, ProcessingError> {
        self.inner.keys().await
    }

    fn is_optimistic(&self) -> bool {
        true
    }
}

async fn optimistic_aggregate(
    repository: Arc<dyn AggregationRepository>,
    completion_size: usize,
    maximum_retries: usize,
) -> EngineContext {
    let context = EngineContext::new(EngineConfig::default());
    let strategy: Arc<dyn AggregationStrategy> = Arc::new(GroupedBody);
    context.registry().bind("grouped", strategy);
    context.registry().bind("store", repository);

    let mut config = AggregateConfig::new(Expr::header("order").shared());
    config.strategy = Some(BeanRef::named("grouped"));
    config.repository = Some(BeanRef::named("store"));
    config.optimistic_locking = true;
    config.completion_size = Some(completion_size);
    config.optimistic_lock_retry = OptimisticLockRetryPolicy {
        maximum_retries,
        retry_delay: Duration::from_millis(1),
        maximum_retry_delay: Duration::from_millis(5),
        exponential_backoff: true,
        random_backoff: true,
    };
    let definition = RouteDefinition::new("orders", "direct:orders")
        .step(StepDefinition::new(StepKind::Aggregate(Box::new(config))).child(StepKind::to("mock:batched").into()))
        .unwrap();
    context.add_route(definition).await.unwrap();
    context.start().await.unwrap();
    context
}

#[tokio::test]
async fn test_aggregate_retries_optimistic_conflicts() {
    let repository = Arc::new(ContendedRepository::new(2));
    let context = optimistic_aggregate(repository.clone(), 3, 5).await;
    for n in 1..=3 {
        let mut exchange = Exchange::new(n).with_header("order", "A");
        context.send("direct:orders", &mut exchange).await.unwrap();
    }

    let batched = context.endpoints().mock("batched");
    assert!(batched.await_count(1, Duration::from_secs(2)).await);
    assert_eq!(batched.received_bodies(), vec![json!([1, 2, 3])]);
    assert_eq!(repository.remaining_conflicts(), 0);
    context.stop().await;
}

#[tokio::test]
async fn test_aggregate_surfaces_exhausted_optimistic_retries() {
    let repository = Arc::new(ContendedRepository::new(usize::MAX));
    let context = optimistic_aggregate(repository, 3, 2).await;

    let mut exchange = Exchange::new(1).with_header("order", "A");
    let err = context.send("direct:orders", &mut exchange).await.unwrap_err();
    assert!(matches!(err, ProcessingError::OptimisticLock(_)));
    assert_eq!(context.endpoints().mock("batched").received_count(), 0);
    context.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_key_sends_land_in_one_group_each() {
    let repository: Arc<dyn AggregationRepository> = Arc::new(MemoryAggregationRepository::optimistic());
    let context = Arc::new(optimistic_aggregate(repository, 4, 0).await);

    let mut sends = Vec::new();
    for n in 0..16 {
        let context = context.clone();
        sends.push(tokio::spawn(async move {
            let mut exchange = Exchange::new(n).with_header("order", if n % 2 == 0 { "even" } else { "odd" });
            context.send("direct:orders", &mut exchange).await
        }));
    }
    for send in sends {
        send.await.unwrap().unwrap();
    }

    let batched = context.endpoints().mock("batched");
    assert!(batched.await_count(4, Duration::from_secs(3)).await);
    let groups = batched.received_bodies();
    assert_eq!(groups.len(), 4);
    let mut members: Vec<i64> = Vec::new();
    for group in &groups {
        let group = group.as_array().unwrap();
        assert_eq!(group.len(), 4);
        let parity = group[0].as_i64().unwrap() % 2;
        for member in group {
            let member = member.as_i64().unwrap();
            assert_eq!(member % 2, parity);
            members.push(member);
        }
    }
    members.sort_unstable();
    assert_eq!(members, (0..16).collect::<Vec<i64>>());
    context.stop().await;
}

// ============================================================================
// Resequencer
// ============================================================================

async fn resequence(reverse: bool) -> Vec<serde_json::Value> {
    let definition = RouteDefinition::new("seq", "direct:seq")
        .step(
            StepDefinition::new(StepKind::Resequence(ResequenceConfig {
                expression: Expr::body().shared(),
                mode: ResequenceMode::Batch(BatchResequence {
                    size: 5,
                    timeout: Duration::from_secs(1),
                    reverse,
                    ..BatchResequence::default()
                }),
            }))
            .child(StepKind::to("mock:ordered").into()),
        )
        .unwrap();
    let context = started(definition).await;
    for n in [5, 3, 1, 4, 2] {
        context.send("direct:seq", &mut Exchange::new(n)).await.unwrap();
    }
    let ordered = context.endpoints().mock("ordered");
    assert!(ordered.await_count(5, Duration::from_secs(3)).await);
    context.stop().await;
    ordered.received_bodies()
}

#[tokio::test]
async fn test_batch_resequence_numeric_order() {
    assert_eq!(resequence(false).await, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
}

#[tokio::test]
async fn test_batch_resequence_reversed() {
    assert_eq!(resequence(true).await, vec![json!(5), json!(4), json!(3), json!(2), json!(1)]);
}

fn stream_resequencer(settings: StreamResequence) -> (Arc<StreamResequencer>, Arc<MockEndpoint>) {
    let endpoints = Arc::new(EndpointRegistry::new());
    let resolver: Arc<dyn EndpointResolver> = endpoints.clone();
    let output: ProcessorRef = Arc::new(SendProcessor::new(resolver.resolve("mock:ordered").unwrap(), None));
    let parts = StreamParts {
        route_id: "seq".to_string(),
        label: "resequence1".to_string(),
        comparator: Arc::new(NumericSequence),
        output,
        event_bus: EventBus::new(16),
    };
    let resequencer = Arc::new(StreamResequencer::new(Expr::body().shared(), settings, parts));
    (resequencer, endpoints.mock("ordered"))
}

#[tokio::test]
async fn test_stream_rejects_element_that_waited_past_a_newer_delivery() {
    let (resequencer, ordered) = stream_resequencer(StreamResequence {
        capacity: 1,
        timeout: Duration::from_millis(30),
        reject_old: true,
        ..StreamResequence::default()
    });
    resequencer.start().await.unwrap();
    resequencer.process(&mut Exchange::new(2)).await.unwrap();

    // blocks on the full buffer until 2 times out and is delivered
    let late = {
        let resequencer = resequencer.clone();
        tokio::spawn(async move { resequencer.process(&mut Exchange::new(1)).await })
    };
    let result = tokio::time::timeout(Duration::from_secs(2), late).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProcessingError::MessageRejected(_))));

    tokio::time::sleep(Duration::from_millis(100)).await;
    resequencer.stop().await.unwrap();
    assert_eq!(ordered.received_bodies(), vec![json!(2)]);
    assert_eq!(resequencer.buffered(), 0);
}

#[tokio::test]
async fn test_stream_rejects_duplicate_admitted_while_blocked() {
    let (resequencer, ordered) = stream_resequencer(StreamResequence {
        capacity: 2,
        timeout: Duration::from_millis(30),
        reject_old: true,
        ..StreamResequence::default()
    });
    resequencer.start().await.unwrap();
    for n in [5, 6] {
        resequencer.process(&mut Exchange::new(n)).await.unwrap();
    }

    // both pass the early check while the buffer is full
    let waiting: Vec<_> = (0..2)
        .map(|_| {
            let resequencer = resequencer.clone();
            tokio::spawn(async move { resequencer.process(&mut Exchange::new(9)).await })
        })
        .collect();
    let mut rejected = 0;
    for handle in waiting {
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        match result {
            Ok(()) => {}
            Err(ProcessingError::MessageRejected(_)) => rejected += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(rejected, 1);

    assert!(ordered.await_count(3, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    resequencer.stop().await.unwrap();
    assert_eq!(ordered.received_bodies(), vec![json!(5), json!(6), json!(9)]);
}

#[tokio::test]
async fn test_stream_full_buffer_blocks_until_gap_timeout() {
    let (resequencer, ordered) = stream_resequencer(StreamResequence {
        capacity: 2,
        timeout: Duration::from_millis(50),
        ..StreamResequence::default()
    });
    resequencer.start().await.unwrap();
    let started = Instant::now();
    for n in [3, 4, 5] {
        resequencer.process(&mut Exchange::new(n)).await.unwrap();
    }
    // 5 had to wait for 3 to be released by its gap timeout
    assert!(started.elapsed() >= Duration::from_millis(40));

    assert!(ordered.await_count(3, Duration::from_secs(2)).await);
    resequencer.stop().await.unwrap();
    assert_eq!(ordered.received_bodies(), vec![json!(3), json!(4), json!(5)]);
}

// ============================================================================
// Throttle
// ============================================================================

#[tokio::test]
async fn test_time_window_throttle_admits_at_most_max_per_rolling_period() {
    let period = Duration::from_millis(400);
    let mut config = ThrottleConfig::new(Expr::constant(2).shared(), ThrottleMode::TimeWindow { period });
    config.reject_execution = true;
    let definition = RouteDefinition::new("limited", "direct:limited")
        .step(StepDefinition::new(StepKind::Throttle(config)).child(StepKind::to("mock:limited").into()))
        .unwrap();
    let context = started(definition).await;

    let started_at = Instant::now();
    let mut admitted = Vec::new();
    while started_at.elapsed() < Duration::from_millis(900) {
        let mut exchange = Exchange::new(admitted.len());
        match context.send("direct:limited", &mut exchange).await {
            Ok(()) => admitted.push(started_at.elapsed()),
            Err(e) => assert!(matches!(e, ProcessingError::ThrottleRejected(_))),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(admitted.len() >= 4, "admitted {admitted:?}");
    for run in admitted.windows(3) {
        assert!(run[2] - run[0] + Duration::from_millis(20) >= period, "admitted {admitted:?}");
    }
    assert_eq!(context.endpoints().mock("limited").received_count(), admitted.len());
    context.stop().await;
}

// ============================================================================
// Idempotent consumer
// ============================================================================

fn idempotent(remove_on_failure: bool) -> RouteDefinition {
    let mut config = IdempotentConfig::new(Expr::header("msgId").shared(), BeanRef::named("seen"));
    config.skip_duplicate = true;
    config.remove_on_failure = remove_on_failure;
    RouteDefinition::new("dedup", "direct:dedup")
        .step(StepDefinition::new(StepKind::IdempotentConsumer(config)).child(StepKind::to("mock:once").into()))
        .unwrap()
}

#[tokio::test]
async fn test_duplicate_key_delivered_once() {
    let context = started(idempotent(true)).await;
    for _ in 0..2 {
        let mut exchange = Exchange::new("payload").with_header("msgId", "k1");
        context.send("direct:dedup", &mut exchange).await.unwrap();
    }
    assert_eq!(context.endpoints().mock("once").received_count(), 1);
}

#[tokio::test]
async fn test_failed_delivery_releases_key() {
    let context = started(idempotent(true)).await;
    let once = context.endpoints().mock("once");
    once.fail_next(1, ProcessingError::custom("IoError", "downstream unavailable"));

    let mut first = Exchange::new("payload").with_header("msgId", "k1");
    assert!(context.send("direct:dedup", &mut first).await.is_err());
    let mut retry = Exchange::new("payload").with_header("msgId", "k1");
    context.send("direct:dedup", &mut retry).await.unwrap();
    assert_eq!(once.received_count(), 2);

    let mut duplicate = Exchange::new("payload").with_header("msgId", "k1");
    context.send("direct:dedup", &mut duplicate).await.unwrap();
    assert_eq!(once.received_count(), 2);
}

#[tokio::test]
async fn test_failed_delivery_keeps_key_without_remove_on_failure() {
    let context = started(idempotent(false)).await;
    let once = context.endpoints().mock("once");
    once.fail_next(1, ProcessingError::custom("IoError", "downstream unavailable"));

    let mut first = Exchange::new("payload").with_header("msgId", "k1");
    assert!(context.send("direct:dedup", &mut first).await.is_err());
    let mut retry = Exchange::new("payload").with_header("msgId", "k1");
    context.send("direct:dedup", &mut retry).await.unwrap();
    assert_eq!(once.received_count(), 1);
}

// ============================================================================
// Multicast
// ============================================================================

#[tokio::test]
async fn test_multicast_stop_on_exception_skips_later_branches() {
    let options = FanOutOptions {
        stop_on_exception: true,
        ..FanOutOptions::default()
    };
    let definition = RouteDefinition::new("fan", "direct:fan")
        .step(StepDefinition::new(StepKind::Multicast(options)).with_children(vec![
            StepKind::to("mock:b1").into(),
            StepKind::to("mock:b2").into(),
            StepKind::to("mock:b3").into(),
        ]))
        .unwrap();
    let context = started(definition).await;
    context
        .endpoints()
        .mock("b2")
        .fail_with(ProcessingError::custom("IoError", "branch two failed"));

    assert!(context.send("direct:fan", &mut Exchange::new("x")).await.is_err());
    assert_eq!(context.endpoints().mock("b1").received_count(), 1);
    assert_eq!(context.endpoints().mock("b2").received_count(), 1);
    assert_eq!(context.endpoints().mock("b3").received_count(), 0);
}
