// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Reification
//
// Turns route model nodes into runtime units. Dispatch is total over
// `StepKind`: custom reifiers registered on the engine are consulted by kind
// name first, then the built-in table, and anything else is rejected with
// `UnsupportedStepKind`.
//
// Children are reified depth-first before their parent so composite units
// wrap already built (and channel-wrapped) children. Abstract kinds register
// themselves onto the route context and produce no unit. Failures are
// enriched once with the failing step and the route id.

mod aggregate;
mod basic;
mod choice;
mod cross_cutting;
pub mod executors;
mod fanout;
mod idempotent;
mod policy;
mod resequence;
mod saga;
mod timing;
mod try_catch;

use std::sync::Arc;
use tracing::debug;

use crate::application::channel::{Channel, ChannelOptions};
use crate::application::error_handler::ErrorHandlerParts;
use crate::application::processors::pipeline::{DisabledProcessor, Pipeline};
use crate::application::processors::producer_cache::ProducerCache;
use crate::application::route_context::RouteContext;
use crate::application::services::EngineServices;
use crate::domain::endpoint::Endpoint;
use crate::domain::errors::AssemblyError;
use crate::domain::expression::{ExpressionRef, PredicateRef};
use crate::domain::processor::ProcessorRef;
use crate::domain::registry::Registry;
use crate::domain::route::{ErrorHandlerDefinition, NodeIndex, RouteModel, StepNode};
use crate::domain::step::{StepInfo, StepKind};

pub use executors::will_create_new_thread_pool;

/// Builds the runtime unit of one node. Registered on the engine to support
/// custom step kinds or to override a built-in one.
pub trait Reifier: Send + Sync {
    fn reify(&self, ctx: &ReifyContext<'_>, node: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError>;
}

type ReifyFn = fn(&ReifyContext<'_>, NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError>;

/// Built-in reifier for a kind; `None` for custom kinds.
fn builtin(kind: &StepKind) -> Option<ReifyFn> {
    let reify: ReifyFn = match kind {
        StepKind::To { .. } => basic::to,
        StepKind::ToDynamic { .. } => basic::to_dynamic,
        StepKind::Process { .. } => basic::process,
        StepKind::Log { .. } => basic::log,
        StepKind::SetHeader { .. } | StepKind::SetProperty { .. } | StepKind::SetBody { .. } => basic::set_value,
        StepKind::RemoveHeader { .. } => basic::remove_header,
        StepKind::Stop => basic::stop,
        StepKind::Pipeline => basic::pipeline,
        StepKind::Filter { .. } => choice::filter,
        StepKind::Choice { .. } => choice::choice,
        StepKind::When { .. } => choice::when,
        StepKind::Otherwise => basic::pipeline,
        StepKind::Split(_) => fanout::split,
        StepKind::Multicast(_) => fanout::multicast,
        StepKind::RecipientList(_) => fanout::recipient_list,
        StepKind::RoutingSlip(_) => fanout::routing_slip,
        StepKind::WireTap(_) => fanout::wire_tap,
        StepKind::Aggregate(_) => aggregate::aggregate,
        StepKind::Resequence(_) => resequence::resequence,
        StepKind::IdempotentConsumer(_) => idempotent::idempotent_consumer,
        StepKind::Policy { .. } => policy::policy,
        StepKind::Transacted { .. } => policy::transacted,
        StepKind::Saga(_) => saga::saga,
        StepKind::Throttle(_) => timing::throttle,
        StepKind::Delay(_) => timing::delay,
        StepKind::Threads(_) => timing::threads,
        StepKind::DoTry => try_catch::do_try,
        StepKind::DoCatch { .. } | StepKind::DoFinally => basic::pipeline,
        StepKind::OnException(_) => cross_cutting::on_exception,
        StepKind::OnCompletion(_) => cross_cutting::on_completion,
        StepKind::Intercept { .. } => cross_cutting::intercept,
        StepKind::Custom { .. } => return None,
    };
    Some(reify)
}

/// Everything a reifier may consult while building one route.
pub struct ReifyContext<'a> {
    pub engine: &'a Arc<EngineServices>,
    pub route: &'a RouteContext,
    pub model: &'a RouteModel,
    error_handler: Option<ErrorHandlerParts>,
}

impl<'a> ReifyContext<'a> {
    pub fn new(
        engine: &'a Arc<EngineServices>,
        route: &'a RouteContext,
        model: &'a RouteModel,
    ) -> Result<Self, AssemblyError> {
        let error_handler = match &route.error_handler {
            ErrorHandlerDefinition::None => None,
            definition => {
                let dead_letter = match definition {
                    ErrorHandlerDefinition::DeadLetter { uri, .. } => {
                        Some(engine.endpoints.resolve(uri).map_err(|e| {
                            AssemblyError::InvalidConfiguration(format!("cannot resolve dead letter endpoint '{uri}': {e}"))
                        })?)
                    }
                    _ => None,
                };
                Some(ErrorHandlerParts {
                    route_id: route.route_id.clone(),
                    definition: definition.clone(),
                    on_exceptions: route.on_exceptions(),
                    dead_letter,
                    event_bus: engine.event_bus.clone(),
                })
            }
        };
        Ok(Self {
            engine,
            route,
            model,
            error_handler,
        })
    }

    pub fn node(&self, index: NodeIndex) -> &'a StepNode {
        self.model.node(index)
    }

    pub fn label(&self, index: NodeIndex) -> String {
        self.node(index).label()
    }

    pub fn info(&self, index: NodeIndex) -> StepInfo {
        let node = self.node(index);
        let label = node.label();
        StepInfo {
            route_id: self.route.route_id.clone(),
            step_id: node.id().unwrap_or(&label).to_string(),
            kind: node.kind.kind_name().to_string(),
            label,
        }
    }

    pub fn registry(&self) -> &dyn Registry {
        self.engine.registry.as_ref()
    }

    pub fn children(&self, index: NodeIndex) -> &'a [NodeIndex] {
        self.model.children(index)
    }

    /// Reify one node and wrap the result in its channel.
    pub fn reify(&self, index: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
        self.dispatch(index)
            .map_err(|e| e.enrich(&self.route.route_id, &self.label(index)))
    }

    fn dispatch(&self, index: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
        let node = self.node(index);
        let kind = node.kind.kind_name();

        if node.disabled || self.engine.config.is_kind_disabled(kind) {
            debug!(route_id = %self.route.route_id, step = %node.label(), "Step disabled");
            if node.kind.is_abstract() {
                return Ok(None);
            }
            return Ok(Some(Arc::new(DisabledProcessor::new(node.label()))));
        }

        let unit = if let Some(custom) = self.engine.custom_reifier(kind) {
            custom.reify(self, index)?
        } else if let Some(reify) = builtin(&node.kind) {
            reify(self, index)?
        } else {
            return Err(AssemblyError::UnsupportedStepKind(kind.to_string()));
        };

        if node.kind.is_abstract() {
            return Ok(None);
        }
        Ok(unit.map(|unit| self.channel(index, unit)))
    }

    /// Reify `indices` in order into one pipeline.
    pub fn outputs(&self, indices: &[NodeIndex]) -> Result<ProcessorRef, AssemblyError> {
        let mut units = Vec::with_capacity(indices.len());
        for index in indices {
            if let Some(unit) = self.reify(*index)? {
                units.push(unit);
            }
        }
        Ok(Pipeline::shared(units))
    }

    /// The pipeline of a node's children.
    pub fn child_pipeline(&self, index: NodeIndex) -> Result<ProcessorRef, AssemblyError> {
        self.outputs(self.children(index))
    }

    /// Reified children as separate units, for fan-out branches.
    pub fn child_units(&self, index: NodeIndex) -> Result<Vec<ProcessorRef>, AssemblyError> {
        let mut units = Vec::new();
        for child in self.children(index) {
            if let Some(unit) = self.reify(*child)? {
                units.push(unit);
            }
        }
        Ok(units)
    }

    /// Children pipeline, or `None` when the node has no children.
    pub fn optional_children(&self, index: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
        if self.children(index).is_empty() {
            return Ok(None);
        }
        self.child_pipeline(index).map(Some)
    }

    pub fn resolve_endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>, AssemblyError> {
        self.engine
            .endpoints
            .resolve(uri)
            .map_err(|e| AssemblyError::InvalidConfiguration(format!("cannot resolve endpoint '{uri}': {e}")))
    }

    /// Destination cache bounded by `size`, or the engine default.
    pub fn producer_cache(&self, size: Option<usize>) -> ProducerCache {
        ProducerCache::new(
            self.engine.endpoints.clone(),
            size.unwrap_or(self.engine.config.producer_cache_size),
        )
    }

    pub fn init_expression(&self, expression: &ExpressionRef) -> Result<ExpressionRef, AssemblyError> {
        expression.init(self.registry())?;
        Ok(expression.clone())
    }

    pub fn init_predicate(&self, predicate: &PredicateRef) -> Result<PredicateRef, AssemblyError> {
        predicate.init(self.registry())?;
        Ok(predicate.clone())
    }

    /// Whether the node gets the route's error handler in its channel. Error
    /// boundaries and everything nested inside them, as well as the handler
    /// pipelines of cross-cutting steps, do not.
    pub fn inherits_error_handler(&self, index: NodeIndex) -> bool {
        if self.error_handler.is_none() {
            return false;
        }
        let node = self.node(index);
        if node.inherit_error_handler == Some(false) || self.is_boundary(&node.kind) {
            return false;
        }
        !self.model.ancestors(index).any(|ancestor| {
            let kind = &self.node(ancestor).kind;
            self.is_boundary(kind) || matches!(kind, StepKind::OnException(_) | StepKind::OnCompletion(_))
        })
    }

    fn is_boundary(&self, kind: &StepKind) -> bool {
        match kind {
            StepKind::Policy { policy } => policy
                .resolve(self.registry())
                .map(|policy| policy.is_transactional())
                .unwrap_or(false),
            other => other.is_error_boundary(),
        }
    }

    fn channel(&self, index: NodeIndex, unit: ProcessorRef) -> ProcessorRef {
        let node = self.node(index);
        let mut strategies = self.engine.interceptors();
        strategies.extend(self.route.interceptors());
        strategies.extend(node.interceptors.iter().cloned());

        let error_handler = if self.inherits_error_handler(index) {
            self.error_handler.clone()
        } else {
            None
        };
        let options = ChannelOptions {
            info: self.info(index),
            first: node.parent().is_none() && self.route.claim_first(),
            delayer: self.route.delayer,
            tracing: self.route.tracing,
            strategies,
            error_handler,
        };
        Channel::wrap(options, unit)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::domain::config::EngineConfig;
    use crate::domain::exchange::Exchange;
    use crate::domain::route::{RedeliveryPolicy, RouteDefinition, StepDefinition};
    use serde_json::json;
    use std::time::Duration;

    struct Upper;

    impl Reifier for Upper {
        fn reify(&self, _ctx: &ReifyContext<'_>, _node: NodeIndex) -> Result<Option<ProcessorRef>, AssemblyError> {
            Ok(Some(crate::domain::processor::FnProcessor::shared(|exchange: &mut Exchange| {
                let upper = exchange.body().as_str().unwrap_or_default().to_uppercase();
                exchange.set_body(upper);
                Ok(())
            })))
        }
    }

    #[test]
    fn test_unknown_custom_kind_is_rejected() {
        let (engine, _) = engine();
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::custom("enrich"))
            .unwrap();
        let err = build(&engine, route).err().unwrap();
        assert!(matches!(err.root_cause(), AssemblyError::UnsupportedStepKind(kind) if kind == "enrich"));
        assert!(matches!(&err, AssemblyError::RouteAssemblyFailed { route_id, step, .. } if route_id == "r1" && step == "enrich1"));
    }

    #[tokio::test]
    async fn test_custom_reifier_consulted_first() {
        let (engine, _) = engine();
        engine.register_reifier("upper", Arc::new(Upper));
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::custom("upper"))
            .unwrap();
        let (unit, _) = build(&engine, route).unwrap();
        let mut exchange = Exchange::new("abc");
        unit.process(&mut exchange).await.unwrap();
        assert_eq!(exchange.body(), &json!("ABC"));
        assert!(unit.is_channel());
    }

    #[tokio::test]
    async fn test_disabled_kinds_become_no_ops() {
        let config = EngineConfig {
            disabled_kinds: vec!["to".to_string()],
            ..EngineConfig::default()
        };
        let (engine, endpoints) = engine_with(config);
        let route = RouteDefinition::new("r1", "direct:in")
            .step(StepKind::to("mock:out"))
            .unwrap()
            .step(StepDefinition::new(StepKind::Stop).disabled())
            .unwrap()
            .step(StepKind::SetBody {
                value: crate::domain::expression::Expr::constant("after").shared(),
            })
            .unwrap();
        let (unit, _) = build(&engine, route).unwrap();
        let mut exchange = Exchange::new("x");
        unit.process(&mut exchange).await.unwrap();
        assert_eq!(endpoints.mock("out").received_count(), 0);
        assert_eq!(exchange.body(), &json!("after"));
    }

    #[tokio::test]
    async fn test_children_of_try_do_not_inherit_error_handler() {
        let (engine, endpoints) = engine();
        endpoints.mock("flaky").fail_with(crate::domain::errors::ProcessingError::custom("IoError", "down"));
        let route = RouteDefinition::new("r1", "direct:in")
            .with_error_handler(ErrorHandlerDefinition::DefaultWith {
                redelivery: RedeliveryPolicy::retries(2, Duration::from_millis(1)),
            })
            .step(StepDefinition::new(StepKind::DoTry).with_children(vec![
                StepKind::to("mock:flaky").into(),
                StepDefinition::new(StepKind::DoCatch {
                    exceptions: vec!["IoError".to_string()],
                    on_when: None,
                })
                .child(StepKind::to("mock:caught").into()),
            ]))
            .unwrap();
        let (unit, _) = build(&engine, route).unwrap();
        unit.process(&mut Exchange::new("x")).await.unwrap();
        // no redelivery inside the try block
        assert_eq!(endpoints.mock("flaky").received_count(), 1);
        assert_eq!(endpoints.mock("caught").received_count(), 1);
    }

    #[tokio::test]
    async fn test_opting_out_skips_redelivery() {
        let (engine, endpoints) = engine();
        endpoints.mock("flaky").fail_with(crate::domain::errors::ProcessingError::custom("IoError", "down"));
        let route = RouteDefinition::new("r1", "direct:in")
            .with_error_handler(ErrorHandlerDefinition::DefaultWith {
                redelivery: RedeliveryPolicy::retries(2, Duration::from_millis(1)),
            })
            .step(StepDefinition::new(StepKind::to("mock:flaky")).inherit_error_handler(false))
            .unwrap();
        let (unit, _) = build(&engine, route).unwrap();
        assert!(unit.process(&mut Exchange::new("x")).await.is_err());
        assert_eq!(endpoints.mock("flaky").received_count(), 1);
    }
}
