// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use tracing::trace;

use crate::domain::errors::ProcessingError;
use crate::domain::exchange::{props, Exchange};
use crate::domain::expression::PredicateRef;
use crate::domain::processor::{Processor, ProcessorRef};

/// Runs its children only when the predicate matches.
pub struct FilterProcessor {
    predicate: PredicateRef,
    body: ProcessorRef,
}

impl FilterProcessor {
    pub fn new(predicate: PredicateRef, body: ProcessorRef) -> Self {
        Self { predicate, body }
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let matched = self.predicate.matches(exchange)?;
        exchange.set_property(props::FILTER_MATCHED, matched);
        if matched {
            self.body.process(exchange).await
        } else {
            trace!(exchange_id = %exchange.id(), filter = %self.predicate.describe(), "Filter did not match");
            Ok(())
        }
    }
}

/// Content based router: the first matching branch wins.
pub struct ChoiceProcessor {
    branches: Vec<(PredicateRef, ProcessorRef)>,
    otherwise: Option<ProcessorRef>,
}

impl ChoiceProcessor {
    pub fn new(branches: Vec<(PredicateRef, ProcessorRef)>, otherwise: Option<ProcessorRef>) -> Self {
        Self { branches, otherwise }
    }
}

#[async_trait]
impl Processor for ChoiceProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        for (predicate, branch) in &self.branches {
            if predicate.matches(exchange)? {
                return branch.process(exchange).await;
            }
        }
        match &self.otherwise {
            Some(otherwise) => otherwise.process(exchange).await,
            None => Ok(()),
        }
    }
}
