// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use super::basic::unexpected;
use super::ReifyContext;
use crate::application::processors::saga::SagaProcessor;
use crate::domain::errors::AssemblyError;
use crate::domain::processor::ProcessorRef;
use crate::domain::route::NodeIndex;
use crate::domain::saga::SagaService;
use crate::domain::step::{SagaConfig, StepKind};

/// The step's own service, then the engine's, then the first one bound in
/// the registry.
fn saga_service(ctx: &ReifyContext<'_>, label: &str, config: &SagaConfig) -> Result<Arc<dyn SagaService>, AssemblyError> {
    if let Some(service) = &config.service {
        return service.resolve(ctx.registry());
    }
    if let Some(service) = ctx.engine.saga_service() {
        return Ok(service);
    }
    ctx.registry()
        .find_by_type::<dyn SagaService>()
        .into_iter()
        .next()
        .map(|(_, service)| service)
        .ok_or_else(|| AssemblyError::missing(label, "saga service"))
}

pub fn saga(ctx: &ReifyContext<'_>, index: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
    let StepKind::Saga(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let label = ctx.label(index);
    let service = saga_service(ctx, &label, config)?;

    // action endpoints must exist when the route starts, not when a saga ends
    for uri in [&config.compensation, &config.completion].into_iter().flatten() {
        ctx.resolve_endpoint(uri)?;
    }
    let mut options = Vec::with_capacity(config.options.len());
    for (name, expression) in &config.options {
        options.push((name.clone(), ctx.init_expression(expression)?));
    }
    let config = SagaConfig {
        options,
        ..config.clone()
    };

    let body = ctx.child_pipeline(index)?;
    Ok(Some(Arc::new(SagaProcessor::new(label, service, config, body))))
}
