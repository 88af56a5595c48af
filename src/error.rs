//! Crate-wide error taxonomy.
//!
//! Every fallible core operation resolves to [`AidosError`] at its public
//! boundary. Component-local error enums may exist internally (see
//! [`crate::graph::GraphError`]) and convert in via `#[from]` or an explicit
//! `map_err`, the way `goose-conductor`'s `StoreError` wraps `sqlx::Error`.

use thiserror::Error;

/// The seven error kinds named in the design's error-handling section.
#[derive(Debug, Error)]
pub enum AidosError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("resource limit reached: {0}")]
    ResourceLimit(String),

    #[error("budget exceeded: {0}")]
    Budget(String),

    #[error("agent execution error: {0}")]
    AgentExecution(String),

    #[error("safety veto: {0}")]
    SafetyVeto(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl AidosError {
    /// Whether the caller may retry the operation that produced this error.
    ///
    /// Resource-limit errors are the only retryable kind — the orchestrator
    /// retries a spawn once a worker slot frees, bounded by `maxRetries`.
    /// Everything else is either a one-shot programmer error or a
    /// non-retryable termination condition.
    pub fn recoverable(&self) -> bool {
        matches!(self, AidosError::ResourceLimit(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            AidosError::Configuration(_) => "configuration_error",
            AidosError::Validation(_) => "validation_error",
            AidosError::ResourceLimit(_) => "resource_limit_error",
            AidosError::Budget(_) => "budget_error",
            AidosError::AgentExecution(_) => "agent_execution_error",
            AidosError::SafetyVeto(_) => "safety_veto",
            AidosError::InvalidState(_) => "invalid_state_error",
        }
    }
}

pub type AidosResult<T> = Result<T, AidosError>;
