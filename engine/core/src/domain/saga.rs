// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Saga - long-running unit of work with compensating actions
//
// A saga step contributes an optional compensation endpoint and an optional
// completion endpoint. The coordinator (an external collaborator) invokes the
// compensations in reverse order on failure and the completions on success.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::errors::ProcessingError;

/// How a saga step relates to a saga already active on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaPropagation {
    /// Join the current saga or start a new one.
    #[default]
    Required,
    /// Always start a new saga, suspending the current one.
    RequiresNew,
    /// Join the current saga; fail when none is active.
    Mandatory,
    /// Join the current saga if any, otherwise run without one.
    Supports,
    /// Suspend the current saga while the children run.
    NotSupported,
    /// Fail when a saga is active.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaCompletionMode {
    /// Complete as soon as the saga step's children succeed.
    #[default]
    Auto,
    /// Complete when the exchange's unit of work completes.
    AutoOnRouteCompletion,
    /// Left to an explicit completion by the route author.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Completing,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Actions contributed by one saga step.
#[derive(Debug, Clone, Default)]
pub struct SagaStep {
    pub compensation: Option<String>,
    pub completion: Option<String>,
    /// Values captured when the step began; sent as headers with the
    /// compensation and completion exchanges.
    pub options: HashMap<String, Value>,
    pub timeout: Option<Duration>,
}

#[async_trait]
pub trait SagaCoordinator: Send + Sync {
    fn id(&self) -> &str;

    fn status(&self) -> SagaStatus;

    async fn begin_step(&self, step: SagaStep) -> Result<(), ProcessingError>;

    async fn complete(&self) -> Result<(), ProcessingError>;

    async fn compensate(&self) -> Result<(), ProcessingError>;
}

#[async_trait]
pub trait SagaService: Send + Sync {
    async fn new_saga(&self) -> Result<Arc<dyn SagaCoordinator>, ProcessingError>;

    async fn get_saga(&self, id: &str) -> Result<Option<Arc<dyn SagaCoordinator>>, ProcessingError>;
}
