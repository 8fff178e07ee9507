// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::producer_cache::{destinations, ProducerCache};
use crate::domain::endpoint::Endpoint;
use crate::domain::errors::ProcessingError;
use crate::domain::exchange::{props, Exchange, ExchangePattern};
use crate::domain::executor::{ExecutorHandle, RejectedPolicy};
use crate::domain::expression::ExpressionRef;
use crate::domain::processor::Processor;

/// Sends the exchange through a chain of destinations computed once per
/// exchange. Each destination sees the previous destination's output.
pub struct RoutingSlipProcessor {
    expression: ExpressionRef,
    delimiter: String,
    ignore_invalid_endpoints: bool,
    cache: ProducerCache,
}

impl RoutingSlipProcessor {
    pub fn new(
        expression: ExpressionRef,
        delimiter: impl Into<String>,
        ignore_invalid_endpoints: bool,
        cache: ProducerCache,
    ) -> Self {
        Self {
            expression,
            delimiter: delimiter.into(),
            ignore_invalid_endpoints,
            cache,
        }
    }
}

#[async_trait]
impl Processor for RoutingSlipProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let slip = destinations(&self.expression.evaluate(exchange)?, &self.delimiter);
        debug!(exchange_id = %exchange.id(), hops = slip.len(), "Following routing slip");
        for uri in slip {
            if exchange.is_route_stopped() {
                break;
            }
            let endpoint = match self.cache.acquire(&uri) {
                Ok(endpoint) => endpoint,
                Err(e) if self.ignore_invalid_endpoints => {
                    warn!(uri = %uri, error = %e, "Skipping invalid routing slip destination");
                    continue;
                }
                Err(e) => return Err(e),
            };
            exchange.set_property(props::SLIP_ENDPOINT, uri.as_str());
            endpoint.send(exchange).await?;
        }
        Ok(())
    }
}

/// Fire-and-forget copy of the exchange sent alongside the main flow.
pub struct WireTapProcessor {
    endpoint: Arc<dyn Endpoint>,
    new_body: Option<ExpressionRef>,
    copy: bool,
    executor: ExecutorHandle,
}

impl WireTapProcessor {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        new_body: Option<ExpressionRef>,
        copy: bool,
        executor: ExecutorHandle,
    ) -> Self {
        Self {
            endpoint,
            new_body,
            copy,
            executor,
        }
    }

    fn tap(&self, exchange: &Exchange) -> Result<Exchange, ProcessingError> {
        let mut tap = if self.copy {
            exchange.copy()
        } else {
            Exchange::default()
        };
        if let Some(body) = &self.new_body {
            tap.set_body(body.evaluate(exchange)?);
        }
        tap.pattern = ExchangePattern::InOnly;
        Ok(tap)
    }
}

async fn deliver(endpoint: Arc<dyn Endpoint>, mut tap: Exchange) {
    if let Err(e) = endpoint.send(&mut tap).await {
        warn!(endpoint = %endpoint.uri(), exchange_id = %tap.id(), error = %e, "Wire tap delivery failed");
    }
}

#[async_trait]
impl Processor for WireTapProcessor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let tap = self.tap(exchange)?;
        let task = deliver(self.endpoint.clone(), tap);
        if let Err((error, task)) = self.executor.try_spawn(task) {
            match self.executor.rejected_policy() {
                RejectedPolicy::CallerRuns => task.await,
                RejectedPolicy::Discard | RejectedPolicy::Abort => {
                    warn!(endpoint = %self.endpoint.uri(), error = %error, "Wire tap dropped");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::endpoint::EndpointResolver;
    use crate::domain::executor::ThreadPoolProfile;
    use crate::domain::expression::Expr;
    use crate::infrastructure::endpoints::EndpointRegistry;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slip_chains_destinations() {
        let endpoints = Arc::new(EndpointRegistry::new());
        endpoints.mock("a").set_reply("from-a");
        let resolver: Arc<dyn EndpointResolver> = endpoints.clone();
        let slip = RoutingSlipProcessor::new(
            Expr::header("slip").shared(),
            ",",
            false,
            ProducerCache::new(resolver, 10),
        );

        let mut exchange = Exchange::new("start")
            .with_pattern(ExchangePattern::InOut)
            .with_header("slip", "mock:a,mock:b");
        slip.process(&mut exchange).await.unwrap();

        assert_eq!(endpoints.mock("b").received_bodies(), vec![json!("from-a")]);
        assert_eq!(exchange.property(props::SLIP_ENDPOINT), Some(&json!("mock:b")));
    }

    #[tokio::test]
    async fn test_wire_tap_does_not_alter_exchange() {
        let endpoints = Arc::new(EndpointRegistry::new());
        let resolver: Arc<dyn EndpointResolver> = endpoints.clone();
        let tap = WireTapProcessor::new(
            resolver.resolve("mock:audit").unwrap(),
            Some(Expr::constant("audit").shared()),
            true,
            ExecutorHandle::new("tap", ThreadPoolProfile::new("tap")),
        );

        let mut exchange = Exchange::new("payload");
        tap.process(&mut exchange).await.unwrap();
        assert_eq!(exchange.body(), &json!("payload"));

        let audit = endpoints.mock("audit");
        assert!(audit.await_count(1, Duration::from_secs(1)).await);
        assert_eq!(audit.received_bodies(), vec![json!("audit")]);
    }
}
