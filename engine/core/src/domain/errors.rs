// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Engine Error Taxonomy
//!
//! Two families of errors flow through the engine:
//!
//! | Family | Type | When | Retried |
//! |--------|------|------|---------|
//! | Assembly | [`AssemblyError`] | while reifying a route model | never |
//! | Runtime | [`ProcessingError`] | while an exchange is in flight | per node policy |
//!
//! Assembly errors abort route startup for the affected route only. Runtime
//! errors are scoped to one exchange; they travel as `Err` values and may be
//! parked on the exchange (`Exchange::set_exception`) when a fan-out branch or
//! an error handler needs to hand them to a downstream collaborator.

use std::time::Duration;
use thiserror::Error;

/// Wildcard accepted by catch clauses and exception handlers.
pub const ANY_EXCEPTION: &str = "*";

/// Runtime failure of a single exchange.
///
/// Cloneable so that it can be stored on an exchange and handed to
/// aggregation strategies, completion callbacks and saga coordinators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessingError {
    #[error("Expression evaluation failed: {0}")]
    Expression(String),

    #[error("Invalid destination '{uri}': {reason}")]
    InvalidDestination { uri: String, reason: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task rejected by executor '{0}'")]
    RejectedExecution(String),

    #[error("Optimistic lock conflict on key '{0}'")]
    OptimisticLock(String),

    #[error("Repository failure: {0}")]
    Repository(String),

    #[error("Throttle limit exceeded: {0}")]
    ThrottleRejected(String),

    #[error("Invalid correlation key: {0}")]
    InvalidCorrelationKey(String),

    #[error("Correlation key '{0}' has been closed")]
    ClosedCorrelationKey(String),

    #[error("Message rejected: {0}")]
    MessageRejected(String),

    #[error("Saga propagation is mandatory but no saga is active")]
    SagaMandatory,

    #[error("Saga '{0}' is active but propagation forbids it")]
    SagaNotAllowed(String),

    #[error("Compensation failed for saga '{saga_id}': {reason}")]
    Compensation { saga_id: String, reason: String },

    #[error("Contract violation: {0}")]
    ContractViolation(String),

    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    #[error("Service '{0}' is not started")]
    NotStarted(String),

    #[error("{kind}: {message}")]
    Custom { kind: String, message: String },
}

impl ProcessingError {
    /// Build a user-defined failure with its own type name.
    pub fn custom(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Custom {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Stable type name used by catch clauses and exception handlers.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Expression(_) => "ExpressionError",
            Self::InvalidDestination { .. } => "InvalidDestination",
            Self::Timeout(_) => "Timeout",
            Self::RejectedExecution(_) => "RejectedExecution",
            Self::OptimisticLock(_) => "OptimisticLock",
            Self::Repository(_) => "RepositoryError",
            Self::ThrottleRejected(_) => "ThrottleRejected",
            Self::InvalidCorrelationKey(_) => "InvalidCorrelationKey",
            Self::ClosedCorrelationKey(_) => "ClosedCorrelationKey",
            Self::MessageRejected(_) => "MessageRejected",
            Self::SagaMandatory => "SagaMandatory",
            Self::SagaNotAllowed(_) => "SagaNotAllowed",
            Self::Compensation { .. } => "CompensationError",
            Self::ContractViolation(_) => "ContractViolation",
            Self::Aggregation(_) => "AggregationError",
            Self::NotStarted(_) => "NotStarted",
            Self::Custom { kind, .. } => kind,
        }
    }

    /// True when `name` selects this error (exact type name or wildcard).
    pub fn matches_type(&self, name: &str) -> bool {
        name == ANY_EXCEPTION || name == self.type_name()
    }
}

/// Configuration problem detected while turning a route model into a runtime
/// pipeline. Always fatal for the route being assembled.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Unsupported step kind '{0}'")]
    UnsupportedStepKind(String),

    #[error("Step '{step}' is missing mandatory field '{field}'")]
    MissingField { step: String, field: &'static str },

    #[error("Step '{step}' has incompatible options: {reason}")]
    IncompatibleOptions { step: String, reason: String },

    #[error("No bean named '{name}' of type {type_name} found in registry")]
    NoSuchBean {
        name: String,
        type_name: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to create route '{route_id}' at step '{step}': {source}")]
    RouteAssemblyFailed {
        route_id: String,
        step: String,
        #[source]
        source: Box<AssemblyError>,
    },

    #[error("Route '{0}' already exists")]
    DuplicateRoute(String),

    #[error("Route '{0}' not found")]
    RouteNotFound(String),

    #[error("AdviceWith rejected: {0}")]
    AdviceRejected(String),

    #[error("Route '{route_id}' failed to start: {reason}")]
    StartupFailed { route_id: String, reason: String },
}

impl AssemblyError {
    /// Attach the failing step and owning route. Errors that already carry a
    /// position are returned untouched so the innermost step is reported.
    pub fn enrich(self, route_id: &str, step: &str) -> Self {
        match self {
            enriched @ Self::RouteAssemblyFailed { .. } => enriched,
            other => Self::RouteAssemblyFailed {
                route_id: route_id.to_string(),
                step: step.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any position wrapper removed.
    pub fn root_cause(&self) -> &AssemblyError {
        match self {
            Self::RouteAssemblyFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn missing(step: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            step: step.into(),
            field,
        }
    }

    pub fn incompatible(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::IncompatibleOptions {
            step: step.into(),
            reason: reason.into(),
        }
    }
}
