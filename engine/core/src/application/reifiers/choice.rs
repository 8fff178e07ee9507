// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;
use tracing::debug;

use super::basic::unexpected;
use super::ReifyContext;
use crate::application::processors::choice::{ChoiceProcessor, FilterProcessor};
use crate::application::processors::pipeline::Pipeline;
use crate::domain::errors::AssemblyError;
use crate::domain::exchange::Exchange;
use crate::domain::expression::PredicateRef;
use crate::domain::processor::ProcessorRef;
use crate::domain::route::NodeIndex;
use crate::domain::step::StepKind;

type Reified = Result<Option<ProcessorRef>, AssemblyError>;

pub fn filter(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Filter { predicate } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let predicate = ctx.init_predicate(predicate)?;
    Ok(Some(Arc::new(FilterProcessor::new(predicate, ctx.child_pipeline(index)?))))
}

/// A `When` outside a choice behaves as a filter.
pub fn when(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::When { predicate } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let predicate = ctx.init_predicate(predicate)?;
    Ok(Some(Arc::new(FilterProcessor::new(predicate, ctx.child_pipeline(index)?))))
}

struct Branches {
    whens: Vec<(NodeIndex, PredicateRef)>,
    otherwise: Option<NodeIndex>,
}

fn branches(ctx: &ReifyContext<'_>, index: NodeIndex) -> Result<Branches, AssemblyError> {
    let label = ctx.label(index);
    let mut whens = Vec::new();
    let mut otherwise = None;
    for child in ctx.children(index) {
        match &ctx.node(*child).kind {
            StepKind::When { predicate } => {
                if otherwise.is_some() {
                    return Err(AssemblyError::incompatible(&label, "when declared after otherwise"));
                }
                whens.push((*child, ctx.init_predicate(predicate)?));
            }
            StepKind::Otherwise => {
                if otherwise.replace(*child).is_some() {
                    return Err(AssemblyError::incompatible(&label, "more than one otherwise"));
                }
            }
            other => {
                return Err(AssemblyError::incompatible(
                    &label,
                    format!("'{}' is not allowed directly inside a choice", other.kind_name()),
                ));
            }
        }
    }
    if whens.is_empty() {
        return Err(AssemblyError::missing(label, "when"));
    }
    Ok(Branches { whens, otherwise })
}

pub fn choice(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Choice { precondition } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let Branches { whens, otherwise } = branches(ctx, index)?;

    if *precondition {
        return precondition_branch(ctx, index, whens, otherwise).map(Some);
    }

    let mut reified = Vec::with_capacity(whens.len());
    for (when, predicate) in whens {
        reified.push((predicate, ctx.child_pipeline(when)?));
    }
    let otherwise = match otherwise {
        Some(otherwise) => Some(ctx.child_pipeline(otherwise)?),
        None => None,
    };
    Ok(Some(Arc::new(ChoiceProcessor::new(reified, otherwise))))
}

/// Decide the branch once at assembly time; the other branches are never
/// reified.
fn precondition_branch(
    ctx: &ReifyContext<'_>,
    index: NodeIndex,
    whens: Vec<(NodeIndex, PredicateRef)>,
    otherwise: Option<NodeIndex>,
) -> Result<ProcessorRef, AssemblyError> {
    let sample = Exchange::default();
    for (position, (when, predicate)) in whens.into_iter().enumerate() {
        let matched = predicate.matches(&sample).map_err(|e| {
            AssemblyError::InvalidConfiguration(format!(
                "precondition of '{}' cannot be decided at assembly time: {e}",
                ctx.label(when)
            ))
        })?;
        if matched {
            debug!(route_id = %ctx.route.route_id, step = %ctx.label(index), branch = position, "Precondition selected branch");
            return ctx.child_pipeline(when);
        }
    }
    match otherwise {
        Some(otherwise) => {
            debug!(route_id = %ctx.route.route_id, step = %ctx.label(index), "Precondition selected otherwise");
            ctx.child_pipeline(otherwise)
        }
        None => Ok(Arc::new(Pipeline::new(Vec::new()))),
    }
}
