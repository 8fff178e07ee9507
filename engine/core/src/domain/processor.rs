// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Runtime units and managed services
//
// A runtime unit is the executable counterpart of a step definition. Units
// that own background tasks or pools additionally implement `Service` and are
// started and stopped with their route.

use async_trait::async_trait;
use std::sync::Arc;

use super::errors::ProcessingError;
use super::exchange::Exchange;

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError>;

    /// True for the channel envelope; used to keep wrapping idempotent.
    fn is_channel(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait Service: Send + Sync {
    fn service_name(&self) -> &str;

    async fn start(&self) -> Result<(), ProcessingError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessingError> {
        Ok(())
    }
}

pub type ProcessorRef = Arc<dyn Processor>;

type SyncFn = dyn Fn(&mut Exchange) -> Result<(), ProcessingError> + Send + Sync;

/// Adapts a synchronous closure into a runtime unit.
pub struct FnProcessor {
    func: Box<SyncFn>,
}

impl FnProcessor {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), ProcessingError> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }

    pub fn shared<F>(func: F) -> Arc<dyn Processor>
    where
        F: Fn(&mut Exchange) -> Result<(), ProcessingError> + Send + Sync + 'static,
    {
        Arc::new(Self::new(func))
    }
}

#[async_trait]
impl Processor for FnProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        (self.func)(exchange)
    }
}
