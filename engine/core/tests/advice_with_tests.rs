// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use conduit_core::domain::errors::AssemblyError;
use conduit_core::domain::exchange::Exchange;
use conduit_core::domain::expression::Expr;
use conduit_core::domain::route::{ErrorHandlerDefinition, RouteDefinition, StepDefinition};
use conduit_core::domain::step::StepKind;
use conduit_core::{EngineConfig, EngineContext};
use serde_json::json;

fn route() -> RouteDefinition {
    RouteDefinition::new("billing", "direct:billing")
        .step(StepKind::to("mock:audit"))
        .unwrap()
        .step(
            StepDefinition::new(StepKind::Pipeline)
                .with_id("enrich")
                .with_children(vec![
                    StepKind::SetHeader {
                        name: "enriched".to_string(),
                        value: Expr::constant(true).shared(),
                    }
                    .into(),
                    StepKind::to("mock:enricher").into(),
                ]),
        )
        .unwrap()
        .step(StepKind::to("mock:invoice"))
        .unwrap()
}

async fn context() -> EngineContext {
    let context = EngineContext::new(EngineConfig::default());
    context.add_route(route()).await.unwrap();
    context.start().await.unwrap();
    context
}

fn kinds(context: &EngineContext) -> Vec<String> {
    context.route("billing").unwrap().definition().model.kind_sequence()
}

#[tokio::test]
async fn test_replace_then_remove_matches_direct_remove() {
    let replaced = context().await;
    replaced
        .advice_with("billing", |advice| {
            advice
                .weave_by_id("enrich")
                .replace(vec![StepDefinition::new(StepKind::to("mock:stub")).with_id("stub")])?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(kinds(&replaced), vec!["to", "to", "to"]);
    replaced
        .advice_with("billing", |advice| {
            advice.weave_by_id("stub").remove()?;
            Ok(())
        })
        .await
        .unwrap();

    let removed = context().await;
    removed
        .advice_with("billing", |advice| {
            advice.weave_by_id("enrich").remove()?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(kinds(&replaced), kinds(&removed));
    assert_eq!(kinds(&removed), vec!["to", "to"]);

    for context in [&replaced, &removed] {
        context.send("direct:billing", &mut Exchange::new(10)).await.unwrap();
        assert_eq!(context.endpoints().mock("audit").received_count(), 1);
        assert_eq!(context.endpoints().mock("enricher").received_count(), 0);
        assert_eq!(context.endpoints().mock("stub").received_count(), 0);
        assert_eq!(context.endpoints().mock("invoice").received_bodies(), vec![json!(10)]);
    }
}

#[tokio::test]
async fn test_insert_around_uri_match() {
    let context = context().await;
    context
        .advice_with("billing", |advice| {
            advice.weave_by_uri("mock:invoice").before(vec![StepKind::SetBody {
                value: Expr::constant("priced").shared(),
            }
            .into()])?;
            advice.weave_by_uri("mock:invoice").after(vec![StepKind::to("mock:archive").into()])?;
            Ok(())
        })
        .await
        .unwrap();

    context.send("direct:billing", &mut Exchange::new(1)).await.unwrap();
    assert_eq!(context.endpoints().mock("invoice").received_bodies(), vec![json!("priced")]);
    assert_eq!(context.endpoints().mock("archive").received_count(), 1);
}

#[tokio::test]
async fn test_nested_matches_respect_max_depth() {
    let context = context().await;
    let err = context
        .advice_with("billing", |advice| {
            advice.weave_by_uri("mock:enricher").max_depth(1).remove()?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AssemblyError::AdviceRejected(_)));

    context
        .advice_with("billing", |advice| {
            advice.weave_by_uri("mock:enricher").max_depth(2).remove()?;
            Ok(())
        })
        .await
        .unwrap();
    context.send("direct:billing", &mut Exchange::new(1)).await.unwrap();
    assert_eq!(context.endpoints().mock("enricher").received_count(), 0);
}

#[tokio::test]
async fn test_error_handler_change_is_rejected() {
    let context = context().await;
    let err = context
        .advice_with("billing", |advice| {
            advice.weave_by_type("to").select_last().remove()?;
            advice.error_handler(ErrorHandlerDefinition::None);
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AssemblyError::AdviceRejected(_)));
    assert_eq!(kinds(&context), vec!["to", "pipeline", "set_header", "to", "to"]);
}
