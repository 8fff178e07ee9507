// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::domain::aggregation::{AggregationRepository, VersionedExchange};
use crate::domain::errors::ProcessingError;
use crate::domain::exchange::Exchange;

/// In-memory aggregation store. In optimistic mode every write must present
/// the version it read; stale writes fail with `OptimisticLock`.
pub struct MemoryAggregationRepository {
    groups: DashMap<String, VersionedExchange>,
    optimistic: bool,
}

impl MemoryAggregationRepository {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
            optimistic: false,
        }
    }

    pub fn optimistic() -> Self {
        Self {
            groups: DashMap::new(),
            optimistic: true,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl Default for MemoryAggregationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregationRepository for MemoryAggregationRepository {
    async fn get(&self, key: &str) -> Result<Option<VersionedExchange>, ProcessingError> {
        Ok(self.groups.get(key).map(|entry| entry.value().clone()))
    }

    async fn add(
        &self,
        key: &str,
        exchange: Exchange,
        expected_version: Option<u64>,
    ) -> Result<u64, ProcessingError> {
        match self.groups.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if self.optimistic && expected_version != Some(current) {
                    return Err(ProcessingError::OptimisticLock(key.to_string()));
                }
                let version = current + 1;
                occupied.insert(VersionedExchange { exchange, version });
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if self.optimistic && expected_version.is_some() {
                    return Err(ProcessingError::OptimisticLock(key.to_string()));
                }
                vacant.insert(VersionedExchange {
                    exchange,
                    version: 1,
                });
                Ok(1)
            }
        }
    }

    async fn remove(&self, key: &str, expected_version: Option<u64>) -> Result<(), ProcessingError> {
        if self.optimistic {
            if let Some(expected) = expected_version {
                let removed = self.groups.remove_if(key, |_, stored| stored.version == expected);
                if removed.is_none() && self.groups.contains_key(key) {
                    return Err(ProcessingError::OptimisticLock(key.to_string()));
                }
                return Ok(());
            }
        }
        self.groups.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, ProcessingError> {
        Ok(self.groups.iter().map(|entry| entry.key().clone()).collect())
    }

    fn is_optimistic(&self) -> bool {
        self.optimistic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_optimistic_conflict() {
        let repo = MemoryAggregationRepository::optimistic();
        let v1 = repo.add("k", Exchange::new(1), None).await.unwrap();
        assert_eq!(v1, 1);

        // a second writer that also believed the key was absent loses
        let err = repo.add("k", Exchange::new(2), None).await.unwrap_err();
        assert!(matches!(err, ProcessingError::OptimisticLock(_)));

        let v2 = repo.add("k", Exchange::new(3), Some(v1)).await.unwrap();
        assert_eq!(v2, 2);
        assert!(repo.add("k", Exchange::new(4), Some(v1)).await.is_err());

        assert!(repo.remove("k", Some(v1)).await.is_err());
        repo.remove("k", Some(v2)).await.unwrap();
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_pessimistic_overwrites() {
        let repo = MemoryAggregationRepository::new();
        repo.add("k", Exchange::new(1), None).await.unwrap();
        repo.add("k", Exchange::new(2), None).await.unwrap();
        let stored = repo.get("k").await.unwrap().unwrap();
        assert_eq!(stored.exchange.body(), &serde_json::json!(2));
        assert_eq!(repo.keys().await.unwrap(), vec!["k".to_string()]);
    }
}
