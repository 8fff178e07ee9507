// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use super::ReifyContext;
use crate::application::processors::basic::{
    LogProcessor, RemoveHeaderProcessor, SendDynamicProcessor, SendProcessor, SetValueProcessor, StopProcessor, Target,
};
use crate::domain::errors::AssemblyError;
use crate::domain::processor::{Processor, ProcessorRef};
use crate::domain::route::NodeIndex;
use crate::domain::step::StepKind;

type Reified = Result<Option<ProcessorRef>, AssemblyError>;

fn unit(processor: impl Processor + 'static) -> Reified {
    Ok(Some(Arc::new(processor)))
}

pub(super) fn unexpected(ctx: &ReifyContext<'_>, index: NodeIndex) -> AssemblyError {
    AssemblyError::InvalidConfiguration(format!(
        "step '{}' was dispatched to the wrong reifier",
        ctx.label(index)
    ))
}

pub fn to(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::To { uri, pattern } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    if uri.is_empty() {
        return Err(AssemblyError::missing(ctx.label(index), "uri"));
    }
    unit(SendProcessor::new(ctx.resolve_endpoint(uri)?, *pattern))
}

pub fn to_dynamic(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::ToDynamic {
        uri,
        ignore_invalid_endpoint,
        cache_size,
    } = &ctx.node(index).kind
    else {
        return Err(unexpected(ctx, index));
    };
    unit(SendDynamicProcessor::new(
        ctx.init_expression(uri)?,
        ctx.producer_cache(*cache_size),
        *ignore_invalid_endpoint,
    ))
}

pub fn process(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Process { processor } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    Ok(Some(processor.resolve(ctx.registry())?))
}

pub fn log(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Log {
        message,
        level,
        category,
    } = &ctx.node(index).kind
    else {
        return Err(unexpected(ctx, index));
    };
    let category = category.clone().unwrap_or_else(|| ctx.route.route_id.clone());
    unit(LogProcessor::new(ctx.init_expression(message)?, *level, category))
}

pub fn set_value(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let (target, value) = match &ctx.node(index).kind {
        StepKind::SetHeader { name, value } => (Target::Header(name.clone()), value),
        StepKind::SetProperty { name, value } => (Target::Property(name.clone()), value),
        StepKind::SetBody { value } => (Target::Body, value),
        _ => return Err(unexpected(ctx, index)),
    };
    if let Target::Header(name) | Target::Property(name) = &target {
        if name.is_empty() {
            return Err(AssemblyError::missing(ctx.label(index), "name"));
        }
    }
    unit(SetValueProcessor::new(target, ctx.init_expression(value)?))
}

pub fn remove_header(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::RemoveHeader { name } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    unit(RemoveHeaderProcessor::new(name.clone()))
}

pub fn stop(_ctx: &ReifyContext<'_>, _index: NodeIndex) -> Reified {
    unit(StopProcessor)
}

/// Pipeline, Otherwise, DoCatch and DoFinally outside their parent: the
/// children in sequence.
pub fn pipeline(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    ctx.child_pipeline(index).map(Some)
}
