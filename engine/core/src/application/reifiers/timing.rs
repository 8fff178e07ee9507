// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use super::basic::unexpected;
use super::executors::{owned_pool, pool_name, resolve_executor};
use super::ReifyContext;
use crate::application::processors::throttle::ThrottleProcessor;
use crate::application::processors::timing::{DelayProcessor, ThreadsProcessor};
use crate::domain::errors::AssemblyError;
use crate::domain::executor::{ExecutorServiceManager, RejectedPolicy, ThreadPoolProfile};
use crate::domain::processor::ProcessorRef;
use crate::domain::route::NodeIndex;
use crate::domain::step::{StepKind, ThreadsConfig, ThrottleConfig, ThrottleMode};

type Reified = Result<Option<ProcessorRef>, AssemblyError>;

pub fn throttle(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Throttle(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let label = ctx.label(index);
    if let ThrottleMode::TimeWindow { period } = &config.mode {
        if period.is_zero() {
            return Err(AssemblyError::incompatible(&label, "time window period must be positive"));
        }
    }
    let executor = if config.async_delayed {
        resolve_executor(ctx, &pool_name(ctx, &label), config.executor.as_ref(), true)?
    } else {
        None
    };
    let config = ThrottleConfig {
        max: ctx.init_expression(&config.max)?,
        correlation: match &config.correlation {
            Some(correlation) => Some(ctx.init_expression(correlation)?),
            None => None,
        },
        ..config.clone()
    };
    let body = ctx.optional_children(index)?;
    Ok(Some(Arc::new(ThrottleProcessor::new(
        ctx.route.route_id.clone(),
        label,
        config,
        executor,
        body,
    ))))
}

pub fn delay(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Delay(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let executor = if config.async_delayed {
        let label = ctx.label(index);
        resolve_executor(ctx, &pool_name(ctx, &label), config.executor.as_ref(), true)?
    } else {
        None
    };
    Ok(Some(Arc::new(DelayProcessor::new(
        ctx.init_expression(&config.delay)?,
        executor,
        config.caller_runs_when_rejected,
    ))))
}

fn sized_profile(name: &str, config: &ThreadsConfig) -> Result<ThreadPoolProfile, AssemblyError> {
    let mut profile = ThreadPoolProfile::new(name);
    if let Some(size) = config.pool_size {
        profile.pool_size = size;
        profile.max_pool_size = profile.max_pool_size.max(size);
    }
    if let Some(max) = config.max_pool_size {
        profile.max_pool_size = max;
    }
    if profile.pool_size == 0 || profile.max_pool_size < profile.pool_size {
        return Err(AssemblyError::incompatible(
            name,
            format!(
                "invalid pool sizing: pool size {} and max pool size {}",
                profile.pool_size, profile.max_pool_size
            ),
        ));
    }
    if let Some(keep_alive) = config.keep_alive {
        profile.keep_alive = keep_alive;
    }
    if config.max_queue_size.is_some() {
        profile.max_queue_size = config.max_queue_size;
    }
    if let Some(policy) = config.rejected_policy {
        profile.rejected_policy = policy;
    }
    Ok(profile)
}

pub fn threads(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Threads(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let label = ctx.label(index);
    if config.executor.is_some() && config.has_sizing() {
        return Err(AssemblyError::incompatible(
            &label,
            "an executor reference cannot be combined with pool sizing",
        ));
    }

    let name = config.thread_name.clone().unwrap_or_else(|| pool_name(ctx, &label));
    let executor = match &config.executor {
        Some(_) => resolve_executor(ctx, &name, config.executor.as_ref(), true)?
            .ok_or_else(|| AssemblyError::missing(&label, "executor"))?,
        None if config.has_sizing() => owned_pool(ctx, &name, &sized_profile(&name, config)?),
        None => owned_pool(ctx, &name, &ctx.engine.executors.default_profile()),
    };
    let caller_runs = config
        .caller_runs_when_rejected
        .unwrap_or(matches!(config.rejected_policy, None | Some(RejectedPolicy::CallerRuns)));

    let body = ctx.child_pipeline(index)?;
    Ok(Some(Arc::new(ThreadsProcessor::new(executor, body, caller_runs))))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::domain::errors::AssemblyError;
    use crate::domain::exchange::Exchange;
    use crate::domain::expression::Expr;
    use crate::domain::route::{RouteDefinition, StepDefinition};
    use crate::domain::step::{DelayConfig, ExecutorRef, StepKind, ThreadsConfig, ThrottleConfig, ThrottleMode};
    use std::time::Duration;

    fn threads_route(config: ThreadsConfig) -> RouteDefinition {
        RouteDefinition::new("r1", "direct:in")
            .step(StepDefinition::new(StepKind::Threads(config)).child(StepKind::to("mock:after").into()))
            .unwrap()
    }

    #[test]
    fn test_threads_rejects_executor_with_sizing() {
        let (engine, _) = engine();
        let config = ThreadsConfig {
            executor: Some(ExecutorRef::named("pool")),
            pool_size: Some(4),
            ..ThreadsConfig::default()
        };
        let err = build(&engine, threads_route(config)).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::IncompatibleOptions { .. }));
    }

    #[tokio::test]
    async fn test_threads_with_sizing_owns_pool() {
        let (engine, endpoints) = engine();
        let config = ThreadsConfig {
            pool_size: Some(2),
            max_pool_size: Some(4),
            thread_name: Some("workers".to_string()),
            ..ThreadsConfig::default()
        };
        let (unit, route) = build(&engine, threads_route(config)).unwrap();
        let owned = route.owned_executors();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name(), "workers");
        assert_eq!(owned[0].profile().concurrency(), 4);

        unit.process(&mut Exchange::new(1)).await.unwrap();
        assert_eq!(endpoints.mock("after").received_count(), 1);
    }

    #[test]
    fn test_threads_invalid_sizing() {
        let (engine, _) = engine();
        let config = ThreadsConfig {
            pool_size: Some(8),
            max_pool_size: Some(2),
            ..ThreadsConfig::default()
        };
        let err = build(&engine, threads_route(config)).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::IncompatibleOptions { .. }));
    }

    #[tokio::test]
    async fn test_throttle_rejects_over_limit() {
        let (engine, endpoints) = engine();
        let mut config = ThrottleConfig::new(Expr::constant(2).shared(), ThrottleMode::TimeWindow {
            period: Duration::from_secs(60),
        });
        config.reject_execution = true;
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::Throttle(config))
            .unwrap()
            .step(StepKind::to("mock:admitted"))
            .unwrap();
        let (unit, route) = build(&engine, route).unwrap();
        assert!(route.owned_executors().is_empty());

        let mut outcomes = Vec::new();
        for n in 0..3 {
            outcomes.push(unit.process(&mut Exchange::new(n)).await.is_ok());
        }
        assert_eq!(outcomes, vec![true, true, false]);
        assert_eq!(endpoints.mock("admitted").received_count(), 2);
    }

    #[tokio::test]
    async fn test_async_delay_owns_default_pool() {
        let (engine, endpoints) = engine();
        let mut config = DelayConfig::new(Expr::constant(5).shared());
        config.async_delayed = true;
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::Delay(config))
            .unwrap()
            .step(StepKind::to("mock:late"))
            .unwrap();
        let (unit, route) = build(&engine, route).unwrap();
        assert_eq!(route.owned_executors().len(), 1);
        unit.process(&mut Exchange::new("x")).await.unwrap();
        assert_eq!(endpoints.mock("late").received_count(), 1);
    }
}
