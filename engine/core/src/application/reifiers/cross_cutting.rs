// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Abstract steps register into the route's tables instead of producing a
// unit of their own. They are reified before the route's outputs.

use std::sync::Arc;
use tracing::debug;

use super::basic::unexpected;
use super::ReifyContext;
use crate::application::channel::InterceptStepStrategy;
use crate::application::route_context::{OnCompletionHandler, OnExceptionHandler};
use crate::domain::errors::AssemblyError;
use crate::domain::expression::PredicateRef;
use crate::domain::processor::ProcessorRef;
use crate::domain::route::NodeIndex;
use crate::domain::step::{OnCompletionConfig, OnExceptionConfig, StepKind};

type Reified = Result<Option<ProcessorRef>, AssemblyError>;

fn init_when(ctx: &ReifyContext<'_>, when: &Option<PredicateRef>) -> Result<Option<PredicateRef>, AssemblyError> {
    match when {
        Some(predicate) => Ok(Some(ctx.init_predicate(predicate)?)),
        None => Ok(None),
    }
}

pub fn on_exception(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::OnException(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let label = ctx.label(index);
    if config.handled && config.continued {
        return Err(AssemblyError::incompatible(&label, "handled and continued cannot both be set"));
    }
    let config = OnExceptionConfig {
        on_when: init_when(ctx, &config.on_when)?,
        ..config.clone()
    };
    let pipeline = ctx.child_pipeline(index)?;
    debug!(route_id = %ctx.route.route_id, step = %label, exceptions = ?config.exceptions, "Registered exception handler");
    ctx.route.add_on_exception(OnExceptionHandler {
        label,
        config,
        pipeline,
    });
    Ok(None)
}

pub fn on_completion(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::OnCompletion(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let config = OnCompletionConfig {
        mode: config.mode,
        on_when: init_when(ctx, &config.on_when)?,
    };
    let pipeline = ctx.child_pipeline(index)?;
    ctx.route.add_on_completion(OnCompletionHandler {
        label: ctx.label(index),
        config,
        pipeline,
    });
    Ok(None)
}

/// The intercept pipeline is reified before the strategy is registered so
/// it is not intercepted by itself.
pub fn intercept(ctx: &ReifyContext<'_>, index: NodeIndex) -> Reified {
    let StepKind::Intercept { when } = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let when = init_when(ctx, when)?;
    let pipeline = ctx.child_pipeline(index)?;
    ctx.route
        .add_intercept(Arc::new(InterceptStepStrategy::new(ctx.label(index), when, pipeline)));
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::domain::errors::{AssemblyError, ProcessingError};
    use crate::domain::exchange::Exchange;
    use crate::domain::expression::Expr;
    use crate::domain::route::{RouteDefinition, StepDefinition};
    use crate::domain::step::{OnExceptionConfig, StepKind};
    use serde_json::json;

    fn on_exception(handled: bool, continued: bool) -> StepDefinition {
        StepDefinition::new(StepKind::OnException(OnExceptionConfig {
            exceptions: vec!["IoError".to_string()],
            handled,
            continued,
            ..OnExceptionConfig::default()
        }))
        .child(StepKind::to("mock:handler").into())
    }

    #[tokio::test]
    async fn test_on_exception_registered_and_used() {
        let (engine, endpoints) = engine();
        endpoints.mock("flaky").fail_with(ProcessingError::custom("IoError", "down"));
        let route = RouteDefinition::new("r1", "direct:in")
            .step(on_exception(true, false))
            .unwrap()
            .step(StepKind::to("mock:flaky"))
            .unwrap()
            .step(StepKind::to("mock:after"))
            .unwrap();
        let (unit, route) = build(&engine, route).unwrap();
        assert_eq!(route.on_exceptions().read().len(), 1);

        unit.process(&mut Exchange::new(1)).await.unwrap();
        assert_eq!(endpoints.mock("handler").received_count(), 1);
        assert_eq!(endpoints.mock("after").received_count(), 0);
    }

    #[test]
    fn test_handled_and_continued_conflict() {
        let (engine, _) = engine();
        let route = RouteDefinition::new("r1", "direct:in")
            .step(on_exception(true, true))
            .unwrap()
            .step(StepKind::to("mock:x"))
            .unwrap();
        let err = build(&engine, route).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::IncompatibleOptions { .. }));
    }

    #[tokio::test]
    async fn test_intercept_runs_before_each_step() {
        let (engine, endpoints) = engine();
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepDefinition::new(StepKind::Intercept { when: None }).child(StepKind::to("mock:spy").into()))
            .unwrap()
            .step(StepKind::SetBody {
                value: Expr::constant("changed").shared(),
            })
            .unwrap()
            .step(StepKind::to("mock:out"))
            .unwrap();
        let (unit, _) = build(&engine, route).unwrap();
        unit.process(&mut Exchange::new("original")).await.unwrap();

        assert_eq!(endpoints.mock("spy").received_bodies(), vec![json!("original"), json!("changed")]);
        assert_eq!(endpoints.mock("out").received_count(), 1);
    }
}
