// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use crate::domain::errors::ProcessingError;
use crate::domain::idempotent::IdempotentRepository;

const DEFAULT_CACHE_SIZE: usize = 1000;

/// In-memory repository remembering the most recently seen keys. The oldest
/// key is evicted once `capacity` keys are held.
pub struct MemoryIdempotentRepository {
    keys: Mutex<LruCache<String, ()>>,
}

impl MemoryIdempotentRepository {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            keys: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for MemoryIdempotentRepository {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

#[async_trait]
impl IdempotentRepository for MemoryIdempotentRepository {
    async fn add(&self, key: &str) -> Result<bool, ProcessingError> {
        let mut keys = self.keys.lock();
        if keys.contains(key) {
            keys.promote(key);
            return Ok(false);
        }
        keys.put(key.to_string(), ());
        Ok(true)
    }

    async fn contains(&self, key: &str) -> Result<bool, ProcessingError> {
        Ok(self.keys.lock().contains(key))
    }

    async fn remove(&self, key: &str) -> Result<bool, ProcessingError> {
        Ok(self.keys.lock().pop(key).is_some())
    }

    async fn clear(&self) -> Result<(), ProcessingError> {
        self.keys.lock().clear();
        Ok(())
    }
}
