// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use super::basic::unexpected;
use super::ReifyContext;
use crate::application::processors::idempotent::IdempotentConsumer;
use crate::domain::errors::AssemblyError;
use crate::domain::processor::ProcessorRef;
use crate::domain::registry::BeanRef;
use crate::domain::route::NodeIndex;
use crate::domain::step::{IdempotentConfig, StepKind};

pub fn idempotent_consumer(ctx: &ReifyContext<'_>, index: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
    let StepKind::IdempotentConsumer(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let repository = config.repository.resolve(ctx.registry())?;
    let config = IdempotentConfig {
        key: ctx.init_expression(&config.key)?,
        repository: BeanRef::instance(repository.clone()),
        ..config.clone()
    };
    Ok(Some(Arc::new(IdempotentConsumer::new(
        ctx.route.route_id.clone(),
        config,
        repository,
        ctx.child_pipeline(index)?,
        ctx.engine.event_bus.clone(),
    ))))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::domain::errors::AssemblyError;
    use crate::domain::exchange::Exchange;
    use crate::domain::expression::Expr;
    use crate::domain::idempotent::IdempotentRepository;
    use crate::domain::registry::BeanRef;
    use crate::domain::route::{RouteDefinition, StepDefinition};
    use crate::domain::step::{IdempotentConfig, StepKind};
    use crate::infrastructure::idempotent_repository::MemoryIdempotentRepository;
    use std::sync::Arc;

    fn route(repository: BeanRef<dyn IdempotentRepository>) -> RouteDefinition {
        RouteDefinition::new("r1", "direct:in")
            .step(
                StepDefinition::new(StepKind::IdempotentConsumer(IdempotentConfig {
                    key: Expr::header("msgId").shared(),
                    repository,
                    eager: true,
                    complete_eager: false,
                    skip_duplicate: true,
                    remove_on_failure: true,
                }))
                .child(StepKind::to("mock:once").into()),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_named_repository_deduplicates() {
        let (engine, endpoints) = engine();
        let repository: Arc<dyn IdempotentRepository> = Arc::new(MemoryIdempotentRepository::default());
        engine.registry.bind("seen", repository);
        let (unit, _) = build(&engine, route(BeanRef::named("seen"))).unwrap();
        for _ in 0..3 {
            unit.process(&mut Exchange::new("x").with_header("msgId", "m1")).await.unwrap();
        }
        unit.process(&mut Exchange::new("y").with_header("msgId", "m2")).await.unwrap();
        assert_eq!(endpoints.mock("once").received_count(), 2);
    }

    #[test]
    fn test_missing_repository() {
        let (engine, _) = engine();
        let err = build(&engine, route(BeanRef::named("absent"))).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::NoSuchBean { .. }));
    }
}
