// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;

use super::errors::ProcessingError;

/// Test-and-set store keyed by a dedup key.
///
/// Implementations must make `add` atomic: of two concurrent calls with the
/// same key exactly one observes `true`.
#[async_trait]
pub trait IdempotentRepository: Send + Sync {
    /// Mark `key` as seen. Returns `false` when it was already present.
    async fn add(&self, key: &str) -> Result<bool, ProcessingError>;

    async fn contains(&self, key: &str) -> Result<bool, ProcessingError>;

    /// Undo a mark after downstream failure.
    async fn remove(&self, key: &str) -> Result<bool, ProcessingError>;

    /// Confirm a mark once processing succeeded.
    async fn confirm(&self, _key: &str) -> Result<bool, ProcessingError> {
        Ok(true)
    }

    async fn clear(&self) -> Result<(), ProcessingError>;
}
