// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `conduit selfcheck` - assemble a small route in-process, push exchanges
//! through it and report what the mock endpoints received.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use conduit_core::domain::expression::Expr;
use conduit_core::{EngineConfig, EngineContext, Exchange, RouteDefinition, StepDefinition, StepKind};

const ROUTE_ID: &str = "selfcheck";
const FROM_URI: &str = "direct:selfcheck";

fn selfcheck_route() -> Result<RouteDefinition> {
    let route = RouteDefinition::new(ROUTE_ID, FROM_URI)
        .step(StepKind::SetHeader {
            name: "checked".to_string(),
            value: Expr::constant(true).shared(),
        })?
        .step(
            StepDefinition::new(StepKind::Filter {
                predicate: Expr::body().gt(Expr::constant(0)).shared(),
            })
            .with_id("positive-only")
            .with_children(vec![StepKind::to("mock:positive").into()]),
        )?
        .step(StepKind::to("mock:done"))?;
    Ok(route)
}

pub async fn execute(config_override: Option<PathBuf>, count: usize) -> Result<()> {
    let config = EngineConfig::load_or_default(config_override).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    let context = EngineContext::new(config);
    context
        .add_route(selfcheck_route()?)
        .await
        .context("Failed to assemble selfcheck route")?;
    context.start().await.context("Failed to start engine")?;

    let route = context
        .route(ROUTE_ID)
        .context("selfcheck route missing after assembly")?;
    println!("{}", "Route steps:".bold());
    for kind in route.definition().model.kind_sequence() {
        println!("  - {kind}");
    }
    println!();

    let mut failures = 0usize;
    for i in 0..count {
        // Alternate signs so the filter both passes and drops.
        let body = if i % 2 == 0 { i as i64 + 1 } else { -(i as i64) };
        let mut exchange = Exchange::new(body);
        if let Err(e) = context.send(FROM_URI, &mut exchange).await {
            failures += 1;
            println!("  {} exchange {}: {}", "✗".red(), exchange.id(), e);
        }
    }

    let done = context.endpoints().mock("mock:done").received_count();
    let positive = context.endpoints().mock("mock:positive").received_count();
    context.stop().await;

    println!("{}", "Results:".bold());
    println!("  sent:          {count}");
    println!("  mock:done:     {done}");
    println!("  mock:positive: {positive}");
    println!("  failed:        {failures}");

    let expected_positive = count.div_ceil(2);
    if failures > 0 || done != count || positive != expected_positive {
        bail!("selfcheck failed");
    }

    println!("{}", "✓ Selfcheck passed".green());
    Ok(())
}
