// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// doTry reification
//
// Children of a DoTry are the guarded steps followed by its DoCatch clauses
// and at most one DoFinally. The clauses are not reified as standalone steps;
// their children become the catch and finally bodies.

use std::sync::Arc;

use super::basic::unexpected;
use super::ReifyContext;
use crate::application::processors::try_catch::{CatchClause, TryProcessor};
use crate::domain::errors::AssemblyError;
use crate::domain::processor::ProcessorRef;
use crate::domain::route::NodeIndex;
use crate::domain::step::StepKind;

#[derive(Default)]
struct TryLayout {
    guarded: Vec<NodeIndex>,
    catches: Vec<NodeIndex>,
    finally: Option<NodeIndex>,
}

fn layout(ctx: &ReifyContext<'_>, index: NodeIndex) -> Result<TryLayout, AssemblyError> {
    let label = ctx.label(index);
    let mut layout = TryLayout::default();
    for child in ctx.children(index) {
        match &ctx.node(*child).kind {
            StepKind::DoCatch { .. } => {
                if layout.finally.is_some() {
                    return Err(AssemblyError::incompatible(&label, "doCatch declared after doFinally"));
                }
                layout.catches.push(*child);
            }
            StepKind::DoFinally => {
                if layout.finally.replace(*child).is_some() {
                    return Err(AssemblyError::incompatible(&label, "more than one doFinally"));
                }
            }
            _ if !layout.catches.is_empty() || layout.finally.is_some() => {
                return Err(AssemblyError::incompatible(
                    &label,
                    format!("step '{}' follows a doCatch or doFinally", ctx.label(*child)),
                ));
            }
            _ => layout.guarded.push(*child),
        }
    }
    if layout.catches.is_empty() && layout.finally.is_none() {
        return Err(AssemblyError::missing(label, "doCatch or doFinally"));
    }
    Ok(layout)
}

pub fn do_try(ctx: &ReifyContext<'_>, index: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
    if !matches!(ctx.node(index).kind, StepKind::DoTry) {
        return Err(unexpected(ctx, index));
    }
    let layout = layout(ctx, index)?;
    let guarded = ctx.outputs(&layout.guarded)?;

    let mut catches = Vec::with_capacity(layout.catches.len());
    for clause in layout.catches {
        let StepKind::DoCatch { exceptions, on_when } = &ctx.node(clause).kind else {
            return Err(unexpected(ctx, clause));
        };
        let on_when = match on_when {
            Some(predicate) => Some(ctx.init_predicate(predicate)?),
            None => None,
        };
        catches.push(CatchClause {
            exceptions: exceptions.clone(),
            on_when,
            body: ctx.child_pipeline(clause)?,
        });
    }
    let finally = match layout.finally {
        Some(finally) => Some(ctx.child_pipeline(finally)?),
        None => None,
    };
    Ok(Some(Arc::new(TryProcessor::new(guarded, catches, finally))))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::domain::errors::{AssemblyError, ProcessingError};
    use crate::domain::exchange::{props, Exchange};
    use crate::domain::expression::Expr;
    use crate::domain::route::{RouteDefinition, StepDefinition};
    use crate::domain::step::StepKind;

    fn catch(exceptions: &[&str], uri: &str) -> StepDefinition {
        StepDefinition::new(StepKind::DoCatch {
            exceptions: exceptions.iter().map(|e| e.to_string()).collect(),
            on_when: None,
        })
        .child(StepKind::to(uri).into())
    }

    #[tokio::test]
    async fn test_catch_then_finally() {
        let (engine, endpoints) = engine();
        endpoints.mock("risky").fail_with(ProcessingError::custom("IoError", "disk gone"));
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepDefinition::new(StepKind::DoTry).with_children(vec![
                StepKind::to("mock:risky").into(),
                StepKind::to("mock:skipped").into(),
                catch(&["ParseError"], "mock:parse"),
                catch(&["IoError"], "mock:io"),
                StepDefinition::new(StepKind::DoFinally).child(StepKind::to("mock:finally").into()),
            ]))
            .unwrap()
            .step(StepKind::to("mock:after"))
            .unwrap();
        let (unit, _) = build(&engine, route).unwrap();

        let mut exchange = Exchange::new("x");
        unit.process(&mut exchange).await.unwrap();
        assert_eq!(endpoints.mock("skipped").received_count(), 0);
        assert_eq!(endpoints.mock("parse").received_count(), 0);
        assert_eq!(endpoints.mock("io").received_count(), 1);
        assert_eq!(endpoints.mock("finally").received_count(), 1);
        assert_eq!(endpoints.mock("after").received_count(), 1);
        assert!(exchange.property(props::EXCEPTION_CAUGHT).is_some());
    }

    #[test]
    fn test_try_needs_catch_or_finally() {
        let (engine, _) = engine();
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepDefinition::new(StepKind::DoTry).child(StepKind::to("mock:x").into()))
            .unwrap();
        let err = build(&engine, route).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::MissingField { .. }));
    }

    #[test]
    fn test_steps_after_catch_rejected() {
        let (engine, _) = engine();
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepDefinition::new(StepKind::DoTry).with_children(vec![
                StepKind::to("mock:x").into(),
                catch(&[], "mock:any"),
                StepKind::SetBody {
                    value: Expr::constant("late").shared(),
                }
                .into(),
            ]))
            .unwrap();
        let err = build(&engine, route).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::IncompatibleOptions { .. }));
    }
}
