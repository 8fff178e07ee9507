// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use tracing::trace;

use crate::domain::exchange::Exchange;

/// Close the unit of work owned by `exchange`: every registered
/// synchronization runs once, in registration order, as complete or failure
/// depending on the exchange's state at this point.
pub async fn done(exchange: &mut Exchange) {
    let synchronizations = exchange.take_synchronizations();
    if synchronizations.is_empty() {
        return;
    }
    let failed = exchange.is_failed();
    trace!(exchange_id = %exchange.id(), count = synchronizations.len(), failed, "Running synchronizations");
    for sync in synchronizations {
        if failed {
            sync.on_failure(exchange).await;
        } else {
            sync.on_complete(exchange).await;
        }
    }
}
