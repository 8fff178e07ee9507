// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Aggregation Collaborators
//!
//! Strategies fold exchanges pairwise; repositories hold in-progress
//! aggregates per correlation key.
//!
//! | Strategy | Result |
//! |----------|--------|
//! | [`UseLatest`] | the newest exchange (first failure is kept) |
//! | [`UseOriginal`] | the first exchange; fan-out keeps the inbound message |
//! | [`GroupedBody`] | array of every body in arrival order |
//! | [`StringConcat`] | bodies joined as text |
//! | [`FnStrategy`] | caller supplied closure |

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::errors::ProcessingError;
use super::exchange::Exchange;

pub trait AggregationStrategy: Send + Sync {
    /// Fold `new` into `old`. `old` is `None` for the first member of a group.
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, ProcessingError>;

    /// Invoked once on the aggregate just before it is released.
    fn on_completion(&self, _aggregate: &mut Exchange) {}

    /// Invoked by fan-out when a parallel call times out before every branch
    /// reported.
    fn timeout(&self, _aggregate: Option<&Exchange>, _completed: usize, _total: usize, _timeout: Duration) {}

    /// Fan-out keeps the inbound message instead of folding branch results
    /// into it.
    fn prefers_original(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

fn propagate_failure(old: &Option<Exchange>, result: &mut Exchange) {
    if result.exception().is_none() {
        if let Some(failure) = old.as_ref().and_then(|o| o.exception()) {
            result.set_exception(Some(failure.clone()));
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, old: Option<Exchange>, mut new: Exchange) -> Result<Exchange, ProcessingError> {
        propagate_failure(&old, &mut new);
        Ok(new)
    }

    fn name(&self) -> &str {
        "use-latest"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UseOriginal;

impl AggregationStrategy for UseOriginal {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, ProcessingError> {
        match old {
            Some(mut first) => {
                if first.exception().is_none() {
                    first.set_exception(new.exception().cloned());
                }
                Ok(first)
            }
            None => Ok(new),
        }
    }

    fn prefers_original(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "use-original"
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GroupedBody;

impl AggregationStrategy for GroupedBody {
    fn aggregate(&self, old: Option<Exchange>, mut new: Exchange) -> Result<Exchange, ProcessingError> {
        match old {
            None => {
                let body = new.body().clone();
                new.set_body(Value::Array(vec![body]));
                Ok(new)
            }
            Some(mut group) => {
                let body = new.body().clone();
                match &mut group.message.body {
                    Value::Array(items) => items.push(body),
                    other => {
                        let first = other.take();
                        *other = Value::Array(vec![first, body]);
                    }
                }
                if group.exception().is_none() {
                    group.set_exception(new.exception().cloned());
                }
                Ok(group)
            }
        }
    }

    fn name(&self) -> &str {
        "grouped-body"
    }
}

#[derive(Debug, Clone)]
pub struct StringConcat {
    pub delimiter: String,
}

impl StringConcat {
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            delimiter: delimiter.into(),
        }
    }
}

fn body_text(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl AggregationStrategy for StringConcat {
    fn aggregate(&self, old: Option<Exchange>, mut new: Exchange) -> Result<Exchange, ProcessingError> {
        let text = match &old {
            Some(previous) => format!(
                "{}{}{}",
                body_text(previous.body()),
                self.delimiter,
                body_text(new.body())
            ),
            None => body_text(new.body()),
        };
        propagate_failure(&old, &mut new);
        new.set_body(text);
        Ok(new)
    }

    fn name(&self) -> &str {
        "string-concat"
    }
}

type FoldFn = dyn Fn(Option<Exchange>, Exchange) -> Result<Exchange, ProcessingError> + Send + Sync;

/// Strategy backed by a closure.
pub struct FnStrategy {
    name: String,
    fold: Box<FoldFn>,
}

impl FnStrategy {
    pub fn new<F>(name: impl Into<String>, fold: F) -> Self
    where
        F: Fn(Option<Exchange>, Exchange) -> Result<Exchange, ProcessingError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            fold: Box::new(fold),
        }
    }
}

impl AggregationStrategy for FnStrategy {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Result<Exchange, ProcessingError> {
        (self.fold)(old, new)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Stored aggregate plus the version used for optimistic locking.
#[derive(Debug, Clone)]
pub struct VersionedExchange {
    pub exchange: Exchange,
    pub version: u64,
}

/// Store of in-progress aggregates, shared and externally synchronized.
///
/// | Operation | Optimistic repository | Pessimistic repository |
/// |-----------|-----------------------|------------------------|
/// | `add` with stale version | `Err(OptimisticLock)` | overwrites |
/// | `add` of new key with `Some(version)` | `Err(OptimisticLock)` | inserts |
#[async_trait]
pub trait AggregationRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<VersionedExchange>, ProcessingError>;

    /// Store `exchange` under `key`. `expected_version` is the version read by
    /// the caller, `None` when the key was absent. Returns the new version.
    async fn add(
        &self,
        key: &str,
        exchange: Exchange,
        expected_version: Option<u64>,
    ) -> Result<u64, ProcessingError>;

    /// Remove the aggregate stored under `key`. Optimistic repositories fail
    /// when `expected_version` is stale.
    async fn remove(&self, key: &str, expected_version: Option<u64>) -> Result<(), ProcessingError>;

    async fn keys(&self) -> Result<Vec<String>, ProcessingError>;

    fn is_optimistic(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fold(strategy: &dyn AggregationStrategy, bodies: &[Value]) -> Exchange {
        let mut acc = None;
        for body in bodies {
            acc = Some(strategy.aggregate(acc, Exchange::new(body.clone())).unwrap());
        }
        acc.unwrap()
    }

    #[test]
    fn test_grouped_body() {
        let result = fold(&GroupedBody, &[json!(1), json!(2), json!(3)]);
        assert_eq!(result.body(), &json!([1, 2, 3]));
    }

    #[test]
    fn test_string_concat() {
        let result = fold(&StringConcat::new("+"), &[json!("a"), json!("b"), json!(3)]);
        assert_eq!(result.body(), &json!("a+b+3"));
    }

    #[test]
    fn test_use_latest_keeps_first_failure() {
        let mut failed = Exchange::new("first");
        failed.set_exception(Some(ProcessingError::custom("Boom", "x")));
        let result = UseLatest.aggregate(Some(failed), Exchange::new("second")).unwrap();
        assert_eq!(result.body(), &json!("second"));
        assert!(result.is_failed());
    }

    #[test]
    fn test_use_original_keeps_first() {
        let result = fold(&UseOriginal, &[json!("a"), json!("b")]);
        assert_eq!(result.body(), &json!("a"));
    }
}
