// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::sync::Arc;

use super::basic::unexpected;
use super::ReifyContext;
use crate::application::processors::resequence::{BatchResequencer, StreamParts, StreamResequencer};
use crate::domain::comparator::{NumericSequence, SequenceComparator};
use crate::domain::errors::AssemblyError;
use crate::domain::processor::{ProcessorRef, Service};
use crate::domain::route::NodeIndex;
use crate::domain::step::{ResequenceMode, StepKind};

pub fn resequence(ctx: &ReifyContext<'_>, index: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
    let StepKind::Resequence(config) = &ctx.node(index).kind else {
        return Err(unexpected(ctx, index));
    };
    let label = ctx.label(index);
    let expression = ctx.init_expression(&config.expression)?;

    match &config.mode {
        ResequenceMode::Batch(batch) => {
            if batch.size == 0 {
                return Err(AssemblyError::incompatible(&label, "batch size must be positive"));
            }
            let output = ctx.child_pipeline(index)?;
            let resequencer = Arc::new(BatchResequencer::new(label, expression, batch.clone(), output));
            ctx.route.add_service(resequencer.clone() as Arc<dyn Service>);
            Ok(Some(resequencer))
        }
        ResequenceMode::Stream(stream) => {
            if stream.capacity == 0 {
                return Err(AssemblyError::incompatible(&label, "stream capacity must be positive"));
            }
            let comparator: Arc<dyn SequenceComparator> = match &stream.comparator {
                Some(comparator) => comparator.resolve(ctx.registry())?,
                None => Arc::new(NumericSequence),
            };
            let parts = StreamParts {
                route_id: ctx.route.route_id.clone(),
                label,
                comparator,
                output: ctx.child_pipeline(index)?,
                event_bus: ctx.engine.event_bus.clone(),
            };
            let resequencer = Arc::new(StreamResequencer::new(expression, stream.clone(), parts));
            ctx.route.add_service(resequencer.clone() as Arc<dyn Service>);
            Ok(Some(resequencer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::domain::errors::AssemblyError;
    use crate::domain::exchange::Exchange;
    use crate::domain::expression::Expr;
    use crate::domain::registry::BeanRef;
    use crate::domain::route::{RouteDefinition, StepDefinition};
    use crate::domain::step::{BatchResequence, ResequenceConfig, ResequenceMode, StepKind, StreamResequence};
    use serde_json::json;
    use std::time::Duration;

    fn route(mode: ResequenceMode) -> RouteDefinition {
        RouteDefinition::new("r1", "direct:in")
            .step(
                StepDefinition::new(StepKind::Resequence(ResequenceConfig {
                    expression: Expr::body().shared(),
                    mode,
                }))
                .child(StepKind::to("mock:ordered").into()),
            )
            .unwrap()
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let (engine, _) = engine();
        let mode = ResequenceMode::Batch(BatchResequence {
            size: 0,
            ..BatchResequence::default()
        });
        let err = build(&engine, route(mode)).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::IncompatibleOptions { .. }));
    }

    #[test]
    fn test_unknown_comparator_bean() {
        let (engine, _) = engine();
        let mode = ResequenceMode::Stream(StreamResequence {
            comparator: Some(BeanRef::named("bySeq")),
            ..StreamResequence::default()
        });
        let err = build(&engine, route(mode)).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::NoSuchBean { name, .. } if name == "bySeq"));
    }

    #[tokio::test]
    async fn test_batch_registered_as_route_service() {
        let (engine, endpoints) = engine();
        let mode = ResequenceMode::Batch(BatchResequence {
            size: 3,
            timeout: Duration::from_millis(500),
            ..BatchResequence::default()
        });
        let (unit, route) = build(&engine, route(mode)).unwrap();
        let services = route.services();
        assert_eq!(services.len(), 1);
        services[0].start().await.unwrap();

        for n in [3, 1, 2] {
            unit.process(&mut Exchange::new(n)).await.unwrap();
        }
        let ordered = endpoints.mock("ordered");
        assert!(ordered.await_count(3, Duration::from_secs(2)).await);
        assert_eq!(ordered.received_bodies(), vec![json!(1), json!(2), json!(3)]);
        services[0].stop().await.unwrap();
    }
}
