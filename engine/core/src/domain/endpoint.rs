// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::sync::{Arc, Weak};

use super::errors::ProcessingError;
use super::exchange::Exchange;

/// A resolved destination.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn uri(&self) -> &str;

    async fn send(&self, exchange: &mut Exchange) -> Result<(), ProcessingError>;
}

/// Entry point of a route that accepts exchanges from in-process endpoints.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn consume(&self, exchange: &mut Exchange) -> Result<(), ProcessingError>;
}

/// Destination resolution capability.
pub trait EndpointResolver: Send + Sync {
    /// Fails with `InvalidDestination` when the uri cannot be resolved.
    fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>, ProcessingError>;

    /// Attach a route input. Consumers are held weakly.
    fn register_consumer(&self, uri: &str, consumer: Weak<dyn Consumer>) -> Result<(), ProcessingError>;

    fn unregister_consumer(&self, uri: &str);
}

/// Split `scheme:rest` into its parts.
pub fn split_uri(uri: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = uri.split_once(':')?;
    if scheme.is_empty() {
        return None;
    }
    Some((scheme, rest.split('?').next().unwrap_or(rest)))
}
