// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use super::basic::unexpected;
use super::executors::{owned_single_thread_pool, pool_name, resolve_executor};
use super::ReifyContext;
use crate::application::processors::aggregate::{AggregateProcessor, AggregatorParts};
use crate::domain::aggregation::AggregationRepository;
use crate::domain::errors::AssemblyError;
use crate::domain::processor::{ProcessorRef, Service};
use crate::domain::route::NodeIndex;
use crate::domain::step::{AggregateConfig, StepKind};
use crate::infrastructure::aggregation_repository::MemoryAggregationRepository;

fn validate(label: &str, config: &AggregateConfig) -> Result<(), AssemblyError> {
    if !config.has_completion_condition() {
        return Err(AssemblyError::missing(label, "completion condition"));
    }
    if config.completion_size == Some(0) {
        return Err(AssemblyError::incompatible(label, "completion size must be positive"));
    }
    if config.completion_interval.is_some()
        && (config.completion_timeout.is_some() || config.completion_timeout_expression.is_some())
    {
        return Err(AssemblyError::incompatible(
            label,
            "completion interval and completion timeout cannot be combined",
        ));
    }
    Ok(())
}

pub fn aggregate(ctx: &ReifyContext<'_>, index: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
    let StepKind::Aggregate(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let label = ctx.label(index);
    validate(&label, config)?;

    let strategy = config
        .strategy
        .as_ref()
        .ok_or_else(|| AssemblyError::missing(&label, "strategy"))?
        .resolve(ctx.registry())?;
    let repository: Arc<dyn AggregationRepository> = match &config.repository {
        Some(repository) => repository.resolve(ctx.registry())?,
        None if config.optimistic_locking => Arc::new(MemoryAggregationRepository::optimistic()),
        None => Arc::new(MemoryAggregationRepository::new()),
    };

    ctx.init_expression(&config.correlation)?;
    if let Some(predicate) = &config.completion_predicate {
        ctx.init_predicate(predicate)?;
    }
    for expression in [&config.completion_size_expression, &config.completion_timeout_expression]
        .into_iter()
        .flatten()
    {
        ctx.init_expression(expression)?;
    }

    let name = pool_name(ctx, &label);
    let executor = match resolve_executor(ctx, &name, config.executor.as_ref(), config.parallel_processing)? {
        Some(executor) => executor,
        // mutations are serialized on a private single-thread pool
        None => owned_single_thread_pool(ctx, &name),
    };

    let output = ctx.child_pipeline(index)?;
    let parts = AggregatorParts {
        route_id: ctx.route.route_id.clone(),
        label,
        strategy,
        repository,
        output,
        executor,
        checker_interval: config
            .completion_timeout_checker_interval
            .unwrap_or(ctx.engine.config.aggregation.timeout_checker_interval),
        event_bus: ctx.engine.event_bus.clone(),
    };
    let aggregator = Arc::new(AggregateProcessor::new((**config).clone(), parts));
    ctx.route.add_service(aggregator.clone() as Arc<dyn Service>);
    Ok(Some(aggregator))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::domain::aggregation::{AggregationStrategy, GroupedBody};
    use crate::domain::errors::AssemblyError;
    use crate::domain::expression::Expr;
    use crate::domain::registry::BeanRef;
    use crate::domain::route::RouteDefinition;
    use crate::domain::step::{AggregateConfig, StepKind};
    use std::sync::Arc;

    fn config() -> AggregateConfig {
        let strategy: Arc<dyn AggregationStrategy> = Arc::new(GroupedBody);
        let mut config = AggregateConfig::new(Expr::header("id").shared());
        config.strategy = Some(BeanRef::instance(strategy));
        config
    }

    #[test]
    fn test_requires_completion_condition() {
        let (engine, _) = engine();
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::Aggregate(Box::new(config())))
            .unwrap();
        let err = build(&engine, route).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::MissingField { .. }));
    }

    #[test]
    fn test_default_executor_is_owned_single_thread() {
        let (engine, _) = engine();
        let mut config = config();
        config.completion_size = Some(3);
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::Aggregate(Box::new(config)))
            .unwrap();
        let (_, route) = build(&engine, route).unwrap();
        let owned = route.owned_executors();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].profile().concurrency(), 1);
        assert_eq!(route.services().len(), 1);
    }

    #[test]
    fn test_interval_and_timeout_are_exclusive() {
        let (engine, _) = engine();
        let mut config = config();
        config.completion_interval = Some(std::time::Duration::from_secs(1));
        config.completion_timeout = Some(std::time::Duration::from_secs(1));
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::Aggregate(Box::new(config)))
            .unwrap();
        let err = build(&engine, route).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::IncompatibleOptions { .. }));
    }
}
