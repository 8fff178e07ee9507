// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Channel
//
// Every reified step is wrapped once in a channel. From the inside out:
//
//   unit -> delayer -> tracer -> interceptors (engine, route, step) -> error handler
//
// The first interceptor in the combined list ends up outermost. Wrapping an
// existing channel returns it unchanged.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::application::error_handler::{ErrorHandlerParts, ErrorHandlerProcessor};
use crate::domain::errors::ProcessingError;
use crate::domain::exchange::Exchange;
use crate::domain::expression::PredicateRef;
use crate::domain::processor::{Processor, ProcessorRef};
use crate::domain::step::{InterceptStrategy, StepInfo};

pub struct ChannelOptions {
    pub info: StepInfo,
    /// First unit of the route.
    pub first: bool,
    pub delayer: Option<Duration>,
    pub tracing: bool,
    /// Outermost first.
    pub strategies: Vec<Arc<dyn InterceptStrategy>>,
    /// `None` when the step does not inherit the route's error handler.
    pub error_handler: Option<ErrorHandlerParts>,
}

pub struct Channel {
    info: StepInfo,
    first: bool,
    inner: ProcessorRef,
}

impl Channel {
    pub fn wrap(options: ChannelOptions, target: ProcessorRef) -> ProcessorRef {
        if target.is_channel() {
            return target;
        }
        let ChannelOptions {
            info,
            first,
            delayer,
            tracing,
            strategies,
            error_handler,
        } = options;

        let mut current = target;
        if let Some(delay) = delayer {
            current = Arc::new(DelayInterceptor { delay, inner: current });
        }
        if tracing {
            current = Arc::new(TraceInterceptor {
                info: info.clone(),
                inner: current,
            });
        }
        for strategy in strategies.iter().rev() {
            current = strategy.wrap(&info, current);
        }
        if let Some(parts) = error_handler {
            current = Arc::new(ErrorHandlerProcessor::new(info.label.clone(), parts, current));
        }

        Arc::new(Channel {
            info,
            first,
            inner: current,
        })
    }

    pub fn info(&self) -> &StepInfo {
        &self.info
    }
}

#[async_trait]
impl Processor for Channel {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        if self.first {
            trace!(route_id = %self.info.route_id, exchange_id = %exchange.id(), "Exchange entered route");
        }
        self.inner.process(exchange).await
    }

    fn is_channel(&self) -> bool {
        true
    }
}

/// Fixed pause before the step runs.
struct DelayInterceptor {
    delay: Duration,
    inner: ProcessorRef,
}

#[async_trait]
impl Processor for DelayInterceptor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        tokio::time::sleep(self.delay).await;
        self.inner.process(exchange).await
    }
}

/// Logs every step an exchange passes through.
struct TraceInterceptor {
    info: StepInfo,
    inner: ProcessorRef,
}

#[async_trait]
impl Processor for TraceInterceptor {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let started = Instant::now();
        debug!(
            route_id = %self.info.route_id,
            step = %self.info.label,
            exchange_id = %exchange.id(),
            body = %exchange.body(),
            "Trace: entering step"
        );
        let result = self.inner.process(exchange).await;
        debug!(
            route_id = %self.info.route_id,
            step = %self.info.label,
            exchange_id = %exchange.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            failed = result.is_err(),
            "Trace: leaving step"
        );
        result
    }
}

/// Route-wide interception installed by an `Intercept` step: its pipeline
/// runs before every later step, optionally only when `when` matches.
pub struct InterceptStepStrategy {
    name: String,
    when: Option<PredicateRef>,
    pipeline: ProcessorRef,
}

impl InterceptStepStrategy {
    pub fn new(name: impl Into<String>, when: Option<PredicateRef>, pipeline: ProcessorRef) -> Self {
        Self {
            name: name.into(),
            when,
            pipeline,
        }
    }
}

impl InterceptStrategy for InterceptStepStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, _step: &StepInfo, target: ProcessorRef) -> ProcessorRef {
        Arc::new(Intercepted {
            when: self.when.clone(),
            pipeline: self.pipeline.clone(),
            target,
        })
    }
}

struct Intercepted {
    when: Option<PredicateRef>,
    pipeline: ProcessorRef,
    target: ProcessorRef,
}

#[async_trait]
impl Processor for Intercepted {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let applies = match &self.when {
            Some(when) => when.matches(exchange)?,
            None => true,
        };
        if applies {
            self.pipeline.process(exchange).await?;
            if exchange.is_route_stopped() {
                return Ok(());
            }
        }
        self.target.process(exchange).await
    }
}
