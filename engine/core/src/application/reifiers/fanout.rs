// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use super::basic::unexpected;
use super::executors::{pool_name, resolve_executor};
use super::ReifyContext;
use crate::application::processors::multicast::{
    FanOutEngine, FanOutSettings, MulticastProcessor, RecipientListProcessor, SplitProcessor,
};
use crate::application::processors::routing_slip::{RoutingSlipProcessor, WireTapProcessor};
use crate::domain::aggregation::{AggregationStrategy, UseLatest};
use crate::domain::errors::AssemblyError;
use crate::domain::processor::ProcessorRef;
use crate::domain::route::NodeIndex;
use crate::domain::step::{FanOutOptions, StepKind};

type Reified = Result<Option<ProcessorRef>, AssemblyError>;

/// Validate the shared options and resolve their collaborators.
fn fan_out_engine(ctx: &ReifyContext<'_>, index: NodeIndex, options: &FanOutOptions) -> Result<FanOutEngine, AssemblyError> {
    let label = ctx.label(index);
    if options.timeout.is_some() && !options.parallel {
        return Err(AssemblyError::incompatible(&label, "timeout requires parallel processing"));
    }
    let executor = if options.parallel {
        resolve_executor(ctx, &pool_name(ctx, &label), options.executor.as_ref(), true)?
    } else {
        None
    };
    let strategy: Arc<dyn AggregationStrategy> = match &options.strategy {
        Some(strategy) => strategy.resolve(ctx.registry())?,
        None => Arc::new(UseLatest),
    };
    let settings = FanOutSettings {
        parallel: options.parallel,
        executor,
        timeout: options.timeout,
        streaming: options.streaming,
        stop_on_exception: options.stop_on_exception,
        share_unit_of_work: options.share_unit_of_work,
        discard_on_aggregation_failure: options.discard_on_aggregation_failure,
    };
    Ok(FanOutEngine::new(label, settings, strategy))
}

pub fn multicast(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Multicast(options) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let outputs = ctx.child_units(index)?;
    let engine = fan_out_engine(ctx, index, options)?;
    Ok(Some(Arc::new(MulticastProcessor::new(outputs, engine))))
}

pub fn split(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Split(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let body = ctx.child_pipeline(index)?;
    let engine = fan_out_engine(ctx, index, &config.options)?;
    Ok(Some(Arc::new(SplitProcessor::new(
        ctx.init_expression(&config.expression)?,
        body,
        engine,
    ))))
}

pub fn recipient_list(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::RecipientList(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    if config.delimiter.is_empty() {
        return Err(AssemblyError::missing(ctx.label(index), "delimiter"));
    }
    let engine = fan_out_engine(ctx, index, &config.options)?;
    Ok(Some(Arc::new(RecipientListProcessor::new(
        ctx.init_expression(&config.expression)?,
        config.delimiter.clone(),
        config.ignore_invalid_endpoints,
        ctx.producer_cache(config.cache_size),
        engine,
    ))))
}

pub fn routing_slip(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::RoutingSlip(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    if config.delimiter.is_empty() {
        return Err(AssemblyError::missing(ctx.label(index), "delimiter"));
    }
    Ok(Some(Arc::new(RoutingSlipProcessor::new(
        ctx.init_expression(&config.expression)?,
        config.delimiter.clone(),
        config.ignore_invalid_endpoints,
        ctx.producer_cache(config.cache_size),
    ))))
}

pub fn wire_tap(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::WireTap(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let label = ctx.label(index);
    if config.uri.is_empty() {
        return Err(AssemblyError::missing(label, "uri"));
    }
    if !config.copy && config.new_body.is_none() {
        return Err(AssemblyError::incompatible(label, "a tap without copy needs a new body"));
    }
    let endpoint = ctx.resolve_endpoint(&config.uri)?;
    let new_body = match &config.new_body {
        Some(body) => Some(ctx.init_expression(body)?),
        None => None,
    };
    let executor = resolve_executor(ctx, &pool_name(ctx, &label), config.executor.as_ref(), true)?
        .ok_or_else(|| AssemblyError::missing(&label, "executor"))?;
    Ok(Some(Arc::new(WireTapProcessor::new(endpoint, new_body, config.copy, executor))))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::domain::aggregation::{AggregationStrategy, StringConcat};
    use crate::domain::errors::{AssemblyError, ProcessingError};
    use crate::domain::exchange::Exchange;
    use crate::domain::expression::Expr;
    use crate::domain::registry::BeanRef;
    use crate::domain::route::{RouteDefinition, StepDefinition};
    use crate::domain::step::{FanOutOptions, SplitConfig, StepKind, WireTapConfig};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_timeout_requires_parallel() {
        let (engine, _) = engine();
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::Multicast(FanOutOptions {
                timeout: Some(Duration::from_secs(1)),
                ..FanOutOptions::default()
            }))
            .unwrap();
        let err = build(&engine, route).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::IncompatibleOptions { .. }));
    }

    #[tokio::test]
    async fn test_split_with_named_strategy() {
        let (engine, endpoints) = engine();
        let concat: Arc<dyn AggregationStrategy> = Arc::new(StringConcat::new("+"));
        engine.registry.bind("concat", concat);
        let route = RouteDefinition::new("r1", "direct:in")
            .step(
                StepDefinition::new(StepKind::Split(SplitConfig {
                    expression: Expr::tokenize(Expr::body(), ",").shared(),
                    options: FanOutOptions {
                        strategy: Some(BeanRef::named("concat")),
                        ..FanOutOptions::default()
                    },
                }))
                .child(StepKind::to("mock:part").into()),
            )
            .unwrap();
        let (unit, _) = build(&engine, route).unwrap();
        let mut exchange = Exchange::new("a,b,c");
        unit.process(&mut exchange).await.unwrap();
        assert_eq!(endpoints.mock("part").received_bodies(), vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(exchange.body(), &json!("a+b+c"));
    }

    #[tokio::test]
    async fn test_parallel_multicast_owns_default_pool() {
        let (engine, endpoints) = engine();
        let route = RouteDefinition::new("r1", "direct:in")
            .step(
                StepDefinition::new(StepKind::Multicast(FanOutOptions {
                    parallel: true,
                    ..FanOutOptions::default()
                }))
                .with_children(vec![StepKind::to("mock:a").into(), StepKind::to("mock:b").into()]),
            )
            .unwrap();
        let (unit, route) = build(&engine, route).unwrap();
        assert_eq!(route.owned_executors().len(), 1);
        unit.process(&mut Exchange::new(1)).await.unwrap();
        assert_eq!(endpoints.mock("a").received_count(), 1);
        assert_eq!(endpoints.mock("b").received_count(), 1);
    }

    #[tokio::test]
    async fn test_wire_tap_does_not_affect_main_flow() {
        let (engine, endpoints) = engine();
        endpoints.mock("tap").fail_with(ProcessingError::custom("IoError", "down"));
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::WireTap(WireTapConfig::new("mock:tap")))
            .unwrap()
            .step(StepKind::to("mock:main"))
            .unwrap();
        let (unit, _) = build(&engine, route).unwrap();
        unit.process(&mut Exchange::new("x")).await.unwrap();
        assert!(endpoints.mock("tap").await_count(1, Duration::from_secs(1)).await);
        assert_eq!(endpoints.mock("main").received_count(), 1);
    }
}
