// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

use crate::domain::endpoint::{Endpoint, EndpointResolver};
use crate::domain::errors::ProcessingError;

/// LRU-bounded cache of resolved endpoints for dynamic destinations.
pub struct ProducerCache {
    resolver: Arc<dyn EndpointResolver>,
    endpoints: Mutex<LruCache<String, Arc<dyn Endpoint>>>,
}

impl ProducerCache {
    pub fn new(resolver: Arc<dyn EndpointResolver>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver,
            endpoints: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn acquire(&self, uri: &str) -> Result<Arc<dyn Endpoint>, ProcessingError> {
        if let Some(endpoint) = self.endpoints.lock().get(uri) {
            return Ok(endpoint.clone());
        }
        let endpoint = self.resolver.resolve(uri)?;
        trace!(uri, "Caching resolved endpoint");
        self.endpoints.lock().put(uri.to_string(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.endpoints.lock().cap().get()
    }
}

/// Split a computed destination value into uris. Strings are split on
/// `delimiter`; arrays contribute each string element.
pub fn destinations(value: &serde_json::Value, delimiter: &str) -> Vec<String> {
    use serde_json::Value;
    let mut uris = Vec::new();
    let mut push = |text: &str| {
        for part in text.split(delimiter) {
            let part = part.trim();
            if !part.is_empty() {
                uris.push(part.to_string());
            }
        }
    };
    match value {
        Value::String(text) => push(text),
        Value::Array(items) => {
            for item in items {
                if let Value::String(text) = item {
                    push(text);
                }
            }
        }
        _ => {}
    }
    uris
}
