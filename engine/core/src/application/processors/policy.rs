// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::errors::ProcessingError;
use crate::domain::exchange::Exchange;
use crate::domain::policy::{Policy, TransactionManager};
use crate::domain::processor::{Processor, ProcessorRef};
use crate::domain::step::StepInfo;

/// Policy that runs its child pipeline inside a transaction.
pub struct TransactionPolicy {
    manager: Arc<dyn TransactionManager>,
}

impl TransactionPolicy {
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self { manager }
    }
}

impl Policy for TransactionPolicy {
    fn wrap(&self, step: &StepInfo, processor: ProcessorRef) -> ProcessorRef {
        Arc::new(TransactionProcessor {
            label: step.label.clone(),
            manager: self.manager.clone(),
            inner: processor,
        })
    }

    fn is_transactional(&self) -> bool {
        true
    }
}

/// Commits when the child pipeline succeeds; rolls back when it fails or the
/// exchange was marked rollback-only.
pub struct TransactionProcessor {
    label: String,
    manager: Arc<dyn TransactionManager>,
    inner: ProcessorRef,
}

#[async_trait]
impl Processor for TransactionProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let tx = self.manager.begin().await?;
        debug!(step = %self.label, exchange_id = %exchange.id(), tx = tx.0, "Transaction started");

        let result = self.inner.process(exchange).await;
        if result.is_err() || exchange.is_failed() || exchange.is_rollback_only() {
            if let Err(e) = self.manager.rollback(tx).await {
                warn!(step = %self.label, tx = tx.0, error = %e, "Rollback failed");
            }
            debug!(step = %self.label, tx = tx.0, "Transaction rolled back");
            return result;
        }

        self.manager.commit(tx).await?;
        debug!(step = %self.label, tx = tx.0, "Transaction committed");
        Ok(())
    }
}
