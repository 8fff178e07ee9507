// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;
use tracing::debug;

use super::basic::unexpected;
use super::ReifyContext;
use crate::application::processors::policy::TransactionPolicy;
use crate::domain::errors::AssemblyError;
use crate::domain::policy::{Policy, DEFAULT_TRANSACTION_POLICY};
use crate::domain::processor::ProcessorRef;
use crate::domain::route::NodeIndex;
use crate::domain::step::StepKind;

type Reified = Result<Option<ProcessorRef>, AssemblyError>;

fn wrap_children(ctx: &ReifyContext<'_>, index: NodeIndex, policy: &dyn Policy) -> Reified {
    let info = ctx.info(index);
    policy.before_wrap(&info);
    let body = ctx.child_pipeline(index)?;
    Ok(Some(policy.wrap(&info, body)))
}

pub fn policy(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Policy { policy } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let policy = policy.resolve(ctx.registry())?;
    wrap_children(ctx, index, policy.as_ref())
}

/// Resolution order: the step's own policy, the conventional default name,
/// the only transactional policy in the registry, then the engine's
/// transaction manager.
fn transaction_policy(ctx: &ReifyContext<'_>, index: NodeIndex) -> Result<Arc<dyn Policy>, AssemblyError> {
    let StepKind::Transacted { policy } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    if let Some(policy) = policy {
        return policy.resolve(ctx.registry());
    }
    if let Some(policy) = ctx.registry().lookup::<dyn Policy>(DEFAULT_TRANSACTION_POLICY) {
        return Ok(policy);
    }

    let mut transactional: Vec<(String, Arc<dyn Policy>)> = ctx
        .registry()
        .find_by_type::<dyn Policy>()
        .into_iter()
        .filter(|(_, policy)| policy.is_transactional())
        .collect();
    if transactional.len() == 1 {
        let (name, policy) = transactional.remove(0);
        debug!(route_id = %ctx.route.route_id, policy = %name, "Using the only transactional policy in the registry");
        return Ok(policy);
    }

    match ctx.engine.transaction_manager() {
        Some(manager) => Ok(Arc::new(TransactionPolicy::new(manager))),
        None => Err(AssemblyError::NoSuchBean {
            name: DEFAULT_TRANSACTION_POLICY.to_string(),
            type_name: "TransactionPolicy",
        }),
    }
}

pub fn transacted(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let policy = transaction_policy(ctx, index)?;
    wrap_children(ctx, index, policy.as_ref())
}
