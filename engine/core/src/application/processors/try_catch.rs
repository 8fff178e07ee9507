// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::domain::errors::ProcessingError;
use crate::domain::exchange::{props, Exchange};
use crate::domain::expression::PredicateRef;
use crate::domain::processor::{Processor, ProcessorRef};

/// Value stored under `EXCEPTION_CAUGHT` once a failure was handled.
pub fn caught(error: &ProcessingError) -> Value {
    json!({
        "type": error.type_name(),
        "message": error.to_string(),
    })
}

pub struct CatchClause {
    /// Error type names; empty catches everything.
    pub exceptions: Vec<String>,
    pub on_when: Option<PredicateRef>,
    pub body: ProcessorRef,
}

impl CatchClause {
    fn matches(&self, error: &ProcessingError, exchange: &mut Exchange) -> bool {
        let type_matches =
            self.exceptions.is_empty() || self.exceptions.iter().any(|name| error.matches_type(name));
        if !type_matches {
            return false;
        }
        let Some(on_when) = &self.on_when else {
            return true;
        };
        // the predicate sees the failure it is asked about
        exchange.set_exception(Some(error.clone()));
        let matched = on_when.matches(exchange).unwrap_or_else(|e| {
            warn!(error = %e, "doCatch onWhen predicate failed");
            false
        });
        exchange.set_exception(None);
        matched
    }
}

/// Guarded block with ordered catch clauses and an optional finally block.
pub struct TryProcessor {
    guarded: ProcessorRef,
    catches: Vec<CatchClause>,
    finally: Option<ProcessorRef>,
}

impl TryProcessor {
    pub fn new(guarded: ProcessorRef, catches: Vec<CatchClause>, finally: Option<ProcessorRef>) -> Self {
        Self {
            guarded,
            catches,
            finally,
        }
    }

    async fn guard(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let error = match self.guarded.process(exchange).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        for (index, clause) in self.catches.iter().enumerate() {
            if clause.matches(&error, exchange) {
                debug!(exchange_id = %exchange.id(), clause = index, error = %error, "Failure caught");
                exchange.set_property(props::EXCEPTION_CAUGHT, caught(&error));
                return clause.body.process(exchange).await;
            }
        }
        Err(error)
    }
}

#[async_trait]
impl Processor for TryProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let outcome = self.guard(exchange).await;
        let Some(finally) = &self.finally else {
            return outcome;
        };

        let stopped = exchange.is_route_stopped();
        exchange.set_route_stop(false);
        let finally_result = finally.process(exchange).await;
        exchange.set_route_stop(stopped || exchange.is_route_stopped());

        match (outcome, finally_result) {
            (Err(e), Ok(())) => Err(e),
            (Err(original), Err(e)) => {
                warn!(error = %original, "Failure superseded by doFinally failure");
                Err(e)
            }
            (Ok(()), result) => result,
        }
    }
}
