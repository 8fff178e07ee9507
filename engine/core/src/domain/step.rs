// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Step Kinds
//!
//! [`StepKind`] is the closed tagged union of every step a route can declare.
//! Each variant carries its kind-specific configuration; structure (children)
//! lives in the route model arena, not here.
//!
//! Three kinds are *abstract*: `OnException`, `OnCompletion` and `Intercept`.
//! They never run in line; the dispatcher registers them onto the route's
//! cross-cutting tables instead.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::aggregation::{AggregationRepository, AggregationStrategy};
use super::comparator::SequenceComparator;
use super::exchange::ExchangePattern;
use super::executor::{ExecutorHandle, RejectedPolicy};
use super::expression::{ExpressionRef, PredicateRef};
use super::idempotent::IdempotentRepository;
use super::policy::Policy;
use super::processor::Processor;
use super::registry::BeanRef;
use super::route::RedeliveryPolicy;
use super::saga::{SagaCompletionMode, SagaPropagation, SagaService};

pub type StrategyRef = BeanRef<dyn AggregationStrategy>;
pub type AggregationRepositoryRef = BeanRef<dyn AggregationRepository>;
pub type IdempotentRepositoryRef = BeanRef<dyn IdempotentRepository>;
pub type ComparatorRef = BeanRef<dyn SequenceComparator>;
pub type PolicyRef = BeanRef<dyn Policy>;
pub type SagaServiceRef = BeanRef<dyn SagaService>;
pub type ProcessorBeanRef = BeanRef<dyn Processor>;

/// Where a step's thread pool comes from.
#[derive(Clone, Debug)]
pub enum ExecutorRef {
    /// An existing pool, given inline or by name. Borrowed, never owned.
    Pool(BeanRef<ExecutorHandle>),
    /// A thread pool profile id. The step creates a pool from it and owns it.
    Profile(String),
}

impl ExecutorRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Pool(BeanRef::named(name))
    }

    pub fn instance(pool: Arc<ExecutorHandle>) -> Self {
        Self::Pool(BeanRef::instance(pool))
    }

    pub fn profile(id: impl Into<String>) -> Self {
        Self::Profile(id.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Options shared by Multicast, Split and RecipientList.
#[derive(Clone, Default)]
pub struct FanOutOptions {
    pub parallel: bool,
    pub executor: Option<ExecutorRef>,
    /// Only valid together with `parallel`.
    pub timeout: Option<Duration>,
    /// Fold results as they complete instead of in input order.
    pub streaming: bool,
    pub stop_on_exception: bool,
    /// Branches share the inbound exchange's unit of work.
    pub share_unit_of_work: bool,
    pub strategy: Option<StrategyRef>,
    /// Drop failed branches from aggregation instead of failing.
    pub discard_on_aggregation_failure: bool,
}

#[derive(Clone)]
pub struct SplitConfig {
    pub expression: ExpressionRef,
    pub options: FanOutOptions,
}

#[derive(Clone)]
pub struct RecipientListConfig {
    pub expression: ExpressionRef,
    pub delimiter: String,
    pub ignore_invalid_endpoints: bool,
    pub cache_size: Option<usize>,
    pub options: FanOutOptions,
}

impl RecipientListConfig {
    pub fn new(expression: ExpressionRef) -> Self {
        Self {
            expression,
            delimiter: ",".to_string(),
            ignore_invalid_endpoints: false,
            cache_size: None,
            options: FanOutOptions::default(),
        }
    }
}

#[derive(Clone)]
pub struct RoutingSlipConfig {
    pub expression: ExpressionRef,
    pub delimiter: String,
    pub ignore_invalid_endpoints: bool,
    pub cache_size: Option<usize>,
}

impl RoutingSlipConfig {
    pub fn new(expression: ExpressionRef) -> Self {
        Self {
            expression,
            delimiter: ",".to_string(),
            ignore_invalid_endpoints: false,
            cache_size: None,
        }
    }
}

#[derive(Clone)]
pub struct WireTapConfig {
    pub uri: String,
    /// Replaces the body of the tapped copy.
    pub new_body: Option<ExpressionRef>,
    /// Send a copy (`true`) or a fresh exchange carrying only the new body.
    pub copy: bool,
    pub executor: Option<ExecutorRef>,
}

impl WireTapConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            new_body: None,
            copy: true,
            executor: None,
        }
    }
}

/// Retry policy applied when the aggregation repository reports a
/// concurrent modification.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticLockRetryPolicy {
    /// `0` retries without limit.
    pub maximum_retries: usize,
    pub retry_delay: Duration,
    pub maximum_retry_delay: Duration,
    pub exponential_backoff: bool,
    pub random_backoff: bool,
}

impl Default for OptimisticLockRetryPolicy {
    fn default() -> Self {
        Self {
            maximum_retries: 0,
            retry_delay: Duration::from_millis(50),
            maximum_retry_delay: Duration::from_secs(1),
            exponential_backoff: true,
            random_backoff: false,
        }
    }
}

impl OptimisticLockRetryPolicy {
    pub fn should_retry(&self, attempt: usize) -> bool {
        self.maximum_retries == 0 || attempt < self.maximum_retries
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.retry_delay;
        let delay = if self.random_backoff {
            let upper = base.as_millis().max(1) as u64;
            Duration::from_millis(rand::random_range(0..=upper))
        } else if self.exponential_backoff {
            let factor = 1u32.checked_shl(attempt.min(16) as u32).unwrap_or(u32::MAX);
            base.saturating_mul(factor)
        } else {
            base
        };
        delay.min(self.maximum_retry_delay)
    }
}

#[derive(Clone)]
pub struct AggregateConfig {
    pub correlation: ExpressionRef,
    pub strategy: Option<StrategyRef>,
    pub repository: Option<AggregationRepositoryRef>,
    pub completion_predicate: Option<PredicateRef>,
    pub completion_size: Option<usize>,
    pub completion_size_expression: Option<ExpressionRef>,
    /// Inactivity timeout per group.
    pub completion_timeout: Option<Duration>,
    pub completion_timeout_expression: Option<ExpressionRef>,
    /// Elapsed time since the first member.
    pub completion_interval: Option<Duration>,
    pub completion_timeout_checker_interval: Option<Duration>,
    pub completion_on_new_correlation_group: bool,
    /// Test the completion predicate on the incoming exchange before folding.
    pub eager_check_completion: bool,
    pub ignore_invalid_correlation_keys: bool,
    /// Remember this many closed keys; late members are rejected.
    pub close_correlation_key_on_completion: Option<usize>,
    pub discard_on_completion_timeout: bool,
    pub force_completion_on_stop: bool,
    pub complete_all_on_stop: bool,
    pub parallel_processing: bool,
    pub executor: Option<ExecutorRef>,
    pub optimistic_locking: bool,
    pub optimistic_lock_retry: OptimisticLockRetryPolicy,
}

impl AggregateConfig {
    pub fn new(correlation: ExpressionRef) -> Self {
        Self {
            correlation,
            strategy: None,
            repository: None,
            completion_predicate: None,
            completion_size: None,
            completion_size_expression: None,
            completion_timeout: None,
            completion_timeout_expression: None,
            completion_interval: None,
            completion_timeout_checker_interval: None,
            completion_on_new_correlation_group: false,
            eager_check_completion: false,
            ignore_invalid_correlation_keys: false,
            close_correlation_key_on_completion: None,
            discard_on_completion_timeout: false,
            force_completion_on_stop: false,
            complete_all_on_stop: false,
            parallel_processing: false,
            executor: None,
            optimistic_locking: false,
            optimistic_lock_retry: OptimisticLockRetryPolicy::default(),
        }
    }

    pub fn has_completion_condition(&self) -> bool {
        self.completion_predicate.is_some()
            || self.completion_size.is_some()
            || self.completion_size_expression.is_some()
            || self.completion_timeout.is_some()
            || self.completion_timeout_expression.is_some()
            || self.completion_interval.is_some()
            || self.completion_on_new_correlation_group
    }
}

#[derive(Clone, Debug)]
pub struct BatchResequence {
    pub size: usize,
    pub timeout: Duration,
    pub allow_duplicates: bool,
    pub reverse: bool,
    pub ignore_invalid_exchanges: bool,
}

impl Default for BatchResequence {
    fn default() -> Self {
        Self {
            size: 100,
            timeout: Duration::from_secs(1),
            allow_duplicates: false,
            reverse: false,
            ignore_invalid_exchanges: false,
        }
    }
}

#[derive(Clone)]
pub struct StreamResequence {
    pub capacity: usize,
    pub timeout: Duration,
    pub reject_old: bool,
    pub ignore_invalid_exchanges: bool,
    pub comparator: Option<ComparatorRef>,
}

impl Default for StreamResequence {
    fn default() -> Self {
        Self {
            capacity: 1000,
            timeout: Duration::from_secs(1),
            reject_old: false,
            ignore_invalid_exchanges: false,
            comparator: None,
        }
    }
}

#[derive(Clone)]
pub enum ResequenceMode {
    Batch(BatchResequence),
    Stream(StreamResequence),
}

#[derive(Clone)]
pub struct ResequenceConfig {
    pub expression: ExpressionRef,
    pub mode: ResequenceMode,
}

#[derive(Clone)]
pub struct IdempotentConfig {
    pub key: ExpressionRef,
    pub repository: IdempotentRepositoryRef,
    pub eager: bool,
    pub complete_eager: bool,
    pub skip_duplicate: bool,
    pub remove_on_failure: bool,
}

impl IdempotentConfig {
    pub fn new(key: ExpressionRef, repository: IdempotentRepositoryRef) -> Self {
        Self {
            key,
            repository,
            eager: true,
            complete_eager: false,
            skip_duplicate: true,
            remove_on_failure: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct SagaConfig {
    /// Falls back to the engine's registered saga service.
    pub service: Option<SagaServiceRef>,
    pub propagation: SagaPropagation,
    pub completion_mode: SagaCompletionMode,
    pub compensation: Option<String>,
    pub completion: Option<String>,
    pub timeout: Option<Duration>,
    pub options: Vec<(String, ExpressionRef)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ThrottleMode {
    /// Bound the number of exchanges in flight.
    Concurrent,
    /// Bound the number admitted per rolling window.
    TimeWindow { period: Duration },
}

#[derive(Clone)]
pub struct ThrottleConfig {
    pub max: ExpressionRef,
    pub mode: ThrottleMode,
    pub correlation: Option<ExpressionRef>,
    pub reject_execution: bool,
    pub async_delayed: bool,
    pub caller_runs_when_rejected: bool,
    pub executor: Option<ExecutorRef>,
}

impl ThrottleConfig {
    pub fn new(max: ExpressionRef, mode: ThrottleMode) -> Self {
        Self {
            max,
            mode,
            correlation: None,
            reject_execution: false,
            async_delayed: false,
            caller_runs_when_rejected: true,
            executor: None,
        }
    }
}

#[derive(Clone)]
pub struct DelayConfig {
    /// Milliseconds.
    pub delay: ExpressionRef,
    pub async_delayed: bool,
    pub caller_runs_when_rejected: bool,
    pub executor: Option<ExecutorRef>,
}

impl DelayConfig {
    pub fn new(delay: ExpressionRef) -> Self {
        Self {
            delay,
            async_delayed: false,
            caller_runs_when_rejected: true,
            executor: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct ThreadsConfig {
    pub executor: Option<ExecutorRef>,
    pub pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
    pub keep_alive: Option<Duration>,
    pub max_queue_size: Option<usize>,
    pub thread_name: Option<String>,
    pub rejected_policy: Option<RejectedPolicy>,
    pub caller_runs_when_rejected: Option<bool>,
}

impl ThreadsConfig {
    pub fn has_sizing(&self) -> bool {
        self.pool_size.is_some()
            || self.max_pool_size.is_some()
            || self.keep_alive.is_some()
            || self.max_queue_size.is_some()
            || self.rejected_policy.is_some()
    }
}

#[derive(Clone, Default)]
pub struct OnExceptionConfig {
    /// Error type names; empty matches any.
    pub exceptions: Vec<String>,
    pub on_when: Option<PredicateRef>,
    pub handled: bool,
    pub continued: bool,
    pub redelivery: Option<RedeliveryPolicy>,
    pub use_original_message: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OnCompletionMode {
    Complete,
    Failure,
    #[default]
    Always,
}

#[derive(Clone, Default)]
pub struct OnCompletionConfig {
    pub mode: OnCompletionMode,
    pub on_when: Option<PredicateRef>,
}

#[derive(Clone)]
pub enum StepKind {
    To { uri: String, pattern: Option<ExchangePattern> },
    ToDynamic { uri: ExpressionRef, ignore_invalid_endpoint: bool, cache_size: Option<usize> },
    Process { processor: ProcessorBeanRef },
    Log { message: ExpressionRef, level: LogLevel, category: Option<String> },
    SetHeader { name: String, value: ExpressionRef },
    SetProperty { name: String, value: ExpressionRef },
    SetBody { value: ExpressionRef },
    RemoveHeader { name: String },
    Stop,
    Filter { predicate: PredicateRef },
    /// Children are `When` nodes and at most one `Otherwise`.
    Choice { precondition: bool },
    When { predicate: PredicateRef },
    Otherwise,
    Split(SplitConfig),
    Multicast(FanOutOptions),
    RecipientList(RecipientListConfig),
    RoutingSlip(RoutingSlipConfig),
    WireTap(WireTapConfig),
    Aggregate(Box<AggregateConfig>),
    Resequence(ResequenceConfig),
    IdempotentConsumer(IdempotentConfig),
    Policy { policy: PolicyRef },
    Transacted { policy: Option<PolicyRef> },
    Saga(SagaConfig),
    Throttle(ThrottleConfig),
    Delay(DelayConfig),
    Threads(ThreadsConfig),
    /// Children are the guarded steps followed by `DoCatch`/`DoFinally` nodes.
    DoTry,
    DoCatch { exceptions: Vec<String>, on_when: Option<PredicateRef> },
    DoFinally,
    Pipeline,
    OnException(OnExceptionConfig),
    OnCompletion(OnCompletionConfig),
    Intercept { when: Option<PredicateRef> },
    Custom { name: String, options: HashMap<String, Value> },
}

impl StepKind {
    /// Every built-in kind name, in declaration order.
    pub const BUILTIN_KINDS: &'static [&'static str] = &[
        "to",
        "to_dynamic",
        "process",
        "log",
        "set_header",
        "set_property",
        "set_body",
        "remove_header",
        "stop",
        "filter",
        "choice",
        "when",
        "otherwise",
        "split",
        "multicast",
        "recipient_list",
        "routing_slip",
        "wire_tap",
        "aggregate",
        "resequence",
        "idempotent_consumer",
        "policy",
        "transacted",
        "saga",
        "throttle",
        "delay",
        "threads",
        "do_try",
        "do_catch",
        "do_finally",
        "pipeline",
        "on_exception",
        "on_completion",
        "intercept",
    ];

    pub fn to(uri: impl Into<String>) -> Self {
        Self::To {
            uri: uri.into(),
            pattern: None,
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom {
            name: name.into(),
            options: HashMap::new(),
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            Self::To { .. } => "to",
            Self::ToDynamic { .. } => "to_dynamic",
            Self::Process { .. } => "process",
            Self::Log { .. } => "log",
            Self::SetHeader { .. } => "set_header",
            Self::SetProperty { .. } => "set_property",
            Self::SetBody { .. } => "set_body",
            Self::RemoveHeader { .. } => "remove_header",
            Self::Stop => "stop",
            Self::Filter { .. } => "filter",
            Self::Choice { .. } => "choice",
            Self::When { .. } => "when",
            Self::Otherwise => "otherwise",
            Self::Split(_) => "split",
            Self::Multicast(_) => "multicast",
            Self::RecipientList(_) => "recipient_list",
            Self::RoutingSlip(_) => "routing_slip",
            Self::WireTap(_) => "wire_tap",
            Self::Aggregate(_) => "aggregate",
            Self::Resequence(_) => "resequence",
            Self::IdempotentConsumer(_) => "idempotent_consumer",
            Self::Policy { .. } => "policy",
            Self::Transacted { .. } => "transacted",
            Self::Saga(_) => "saga",
            Self::Throttle(_) => "throttle",
            Self::Delay(_) => "delay",
            Self::Threads(_) => "threads",
            Self::DoTry => "do_try",
            Self::DoCatch { .. } => "do_catch",
            Self::DoFinally => "do_finally",
            Self::Pipeline => "pipeline",
            Self::OnException(_) => "on_exception",
            Self::OnCompletion(_) => "on_completion",
            Self::Intercept { .. } => "intercept",
            Self::Custom { name, .. } => name,
        }
    }

    /// Cross-cutting kinds woven in separately from the linear chain.
    pub fn is_abstract(&self) -> bool {
        matches!(
            self,
            Self::OnException(_) | Self::OnCompletion(_) | Self::Intercept { .. }
        )
    }

    /// Kinds that install their own error boundary instead of inheriting the
    /// route's error handler.
    pub fn is_error_boundary(&self) -> bool {
        matches!(self, Self::DoTry | Self::Transacted { .. })
    }

    /// Static destination uri, if the step has one.
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::To { uri, .. } => Some(uri),
            Self::WireTap(cfg) => Some(&cfg.uri),
            _ => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::To { uri, .. } => write!(f, "To[{uri}]"),
            Self::ToDynamic { uri, .. } => write!(f, "ToD[{}]", uri.describe()),
            Self::Process { processor } => match processor.name() {
                Some(name) => write!(f, "Process[ref:{name}]"),
                None => write!(f, "Process"),
            },
            Self::Log { message, .. } => write!(f, "Log[{}]", message.describe()),
            Self::SetHeader { name, value } => write!(f, "SetHeader[{name}, {}]", value.describe()),
            Self::SetProperty { name, value } => write!(f, "SetProperty[{name}, {}]", value.describe()),
            Self::SetBody { value } => write!(f, "SetBody[{}]", value.describe()),
            Self::RemoveHeader { name } => write!(f, "RemoveHeader[{name}]"),
            Self::Stop => write!(f, "Stop"),
            Self::Filter { predicate } => write!(f, "Filter[{}]", predicate.describe()),
            Self::Choice { .. } => write!(f, "Choice"),
            Self::When { predicate } => write!(f, "When[{}]", predicate.describe()),
            Self::Otherwise => write!(f, "Otherwise"),
            Self::Split(cfg) => write!(f, "Split[{}]", cfg.expression.describe()),
            Self::Multicast(_) => write!(f, "Multicast"),
            Self::RecipientList(cfg) => write!(f, "RecipientList[{}]", cfg.expression.describe()),
            Self::RoutingSlip(cfg) => write!(f, "RoutingSlip[{}]", cfg.expression.describe()),
            Self::WireTap(cfg) => write!(f, "WireTap[{}]", cfg.uri),
            Self::Aggregate(cfg) => write!(f, "Aggregate[{}]", cfg.correlation.describe()),
            Self::Resequence(cfg) => write!(f, "Resequence[{}]", cfg.expression.describe()),
            Self::IdempotentConsumer(cfg) => write!(f, "IdempotentConsumer[{}]", cfg.key.describe()),
            Self::Policy { policy } => write!(f, "Policy[{}]", policy.name().unwrap_or("instance")),
            Self::Transacted { policy } => match policy.as_ref().and_then(|p| p.name()) {
                Some(name) => write!(f, "Transacted[ref:{name}]"),
                None => write!(f, "Transacted"),
            },
            Self::Saga(cfg) => write!(f, "Saga[{:?}]", cfg.propagation),
            Self::Throttle(cfg) => write!(f, "Throttle[{}]", cfg.max.describe()),
            Self::Delay(cfg) => write!(f, "Delay[{}]", cfg.delay.describe()),
            Self::Threads(_) => write!(f, "Threads"),
            Self::DoTry => write!(f, "DoTry"),
            Self::DoCatch { exceptions, .. } => write!(f, "DoCatch[{}]", exceptions.join(", ")),
            Self::DoFinally => write!(f, "DoFinally"),
            Self::Pipeline => write!(f, "Pipeline"),
            Self::OnException(cfg) => write!(f, "OnException[{}]", cfg.exceptions.join(", ")),
            Self::OnCompletion(cfg) => write!(f, "OnCompletion[{:?}]", cfg.mode),
            Self::Intercept { .. } => write!(f, "Intercept"),
            Self::Custom { name, .. } => write!(f, "Custom[{name}]"),
        }
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Identity of a step as seen by interceptors and policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    pub route_id: String,
    pub step_id: String,
    pub kind: String,
    pub label: String,
}

/// Wraps every channel-managed unit of a route.
pub trait InterceptStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn wrap(&self, step: &StepInfo, target: Arc<dyn Processor>) -> Arc<dyn Processor>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::expression::Expr;

    #[test]
    fn test_abstract_kinds() {
        assert!(StepKind::OnException(OnExceptionConfig::default()).is_abstract());
        assert!(StepKind::Intercept { when: None }.is_abstract());
        assert!(!StepKind::to("mock:a").is_abstract());
        assert!(StepKind::DoTry.is_error_boundary());
    }

    #[test]
    fn test_labels() {
        let split = StepKind::Split(SplitConfig {
            expression: Expr::tokenize(Expr::body(), ",").shared(),
            options: FanOutOptions::default(),
        });
        assert_eq!(split.to_string(), "Split[tokenize(body, ',')]");
        assert_eq!(StepKind::to("mock:x").to_string(), "To[mock:x]");
        assert_eq!(StepKind::custom("enrich").kind_name(), "enrich");
    }

    #[test]
    fn test_retry_delay_backoff() {
        let policy = OptimisticLockRetryPolicy {
            retry_delay: Duration::from_millis(10),
            maximum_retry_delay: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(5), Duration::from_millis(50));
        assert!(policy.should_retry(100));

        let bounded = OptimisticLockRetryPolicy {
            maximum_retries: 2,
            ..Default::default()
        };
        assert!(bounded.should_retry(1));
        assert!(!bounded.should_retry(2));
    }
}
