// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde_json::Value;
use std::cmp::Ordering;

use super::expression::compare_values;

/// Orders resequencer elements by the value of their sequence expression.
pub trait SequenceComparator: Send + Sync {
    fn compare(&self, left: &Value, right: &Value) -> Ordering;

    /// True when `candidate` immediately follows `previous` with no gap.
    fn is_successor(&self, candidate: &Value, previous: &Value) -> bool;

    fn is_valid(&self, value: &Value) -> bool;
}

/// Integer sequence numbers, ascending; `n + 1` is the successor of `n`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericSequence;

fn as_sequence(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl SequenceComparator for NumericSequence {
    fn compare(&self, left: &Value, right: &Value) -> Ordering {
        match (as_sequence(left), as_sequence(right)) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => compare_values(left, right).unwrap_or(Ordering::Equal),
        }
    }

    fn is_successor(&self, candidate: &Value, previous: &Value) -> bool {
        match (as_sequence(candidate), as_sequence(previous)) {
            (Some(c), Some(p)) => p.checked_add(1) == Some(c),
            _ => false,
        }
    }

    fn is_valid(&self, value: &Value) -> bool {
        as_sequence(value).is_some()
    }
}
