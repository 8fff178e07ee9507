// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use crate::domain::errors::ProcessingError;
use crate::domain::exchange::Exchange;
use crate::domain::processor::{Processor, ProcessorRef};

/// Runs units in order on the same exchange. Stops early when a unit fails
/// or marks the exchange as stopped.
pub struct Pipeline {
    units: Vec<ProcessorRef>,
}

impl Pipeline {
    pub fn new(units: Vec<ProcessorRef>) -> Self {
        Self { units }
    }

    /// A single unit is returned as is.
    pub fn shared(mut units: Vec<ProcessorRef>) -> ProcessorRef {
        if units.len() == 1 {
            if let Some(unit) = units.pop() {
                return unit;
            }
        }
        Arc::new(Self::new(units))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        for (position, unit) in self.units.iter().enumerate() {
            if exchange.is_route_stopped() {
                trace!(exchange_id = %exchange.id(), position, "Exchange stopped, skipping remaining units");
                break;
            }
            unit.process(exchange).await?;
        }
        Ok(())
    }
}

/// Placeholder for a disabled step.
pub struct DisabledProcessor {
    label: String,
}

impl DisabledProcessor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Processor for DisabledProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        trace!(step = %self.label, exchange_id = %exchange.id(), "Step disabled");
        Ok(())
    }
}
