// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for procflow-core.
//!
//! A single error enum covers the whole runtime. Every variant maps to a stable
//! error code so callers (and the job runner) can decide what to do with it
//! without matching on message text.

use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while executing commands, operations and jobs.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A structural edit would violate an execution-tree or job-state invariant.
    ///
    /// Fatal to the enclosing command and never retried automatically.
    #[error("Illegal state transition for '{id}': {message}")]
    IllegalStateTransition {
        /// Execution or job the transition was attempted on.
        id: String,
        /// What was wrong.
        message: String,
    },

    /// The stored revision no longer matches the one this unit of work loaded.
    #[error("Optimistic lock failure on {entity} '{id}': entity was modified concurrently")]
    OptimisticLock {
        /// Entity kind (execution, variable, job, event_subscription).
        entity: &'static str,
        /// Entity id.
        id: String,
    },

    /// A job handler failed.
    #[error("Job '{job_id}' failed: {message}")]
    JobExecutionFailure {
        /// The failing job.
        job_id: String,
        /// Failure description recorded on the job.
        message: String,
    },

    /// No handler is registered for a job type.
    #[error("No job handler registered for type '{job_type}'")]
    HandlerNotFound {
        /// The unknown job type.
        job_type: String,
    },

    /// The job's lock is no longer held by the worker executing it.
    #[error("Lock on job '{job_id}' is no longer held by worker '{worker_id}'")]
    LockLost {
        /// The job.
        job_id: String,
        /// The worker that expected to hold the lock.
        worker_id: String,
    },

    /// Execution was not found.
    #[error("Execution '{execution_id}' not found")]
    ExecutionNotFound {
        /// The execution ID that was not found.
        execution_id: String,
    },

    /// The model resolver has no flow graph for this id.
    #[error("Process definition '{definition_id}' not found")]
    ProcessDefinitionNotFound {
        /// The definition id.
        definition_id: String,
    },

    /// Job was not found.
    #[error("Job '{job_id}' not found")]
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// A message did not correlate to exactly one waiting execution.
    #[error("Message '{message_name}' correlated to {matches} executions, expected exactly one")]
    MessageCorrelation {
        /// The message name.
        message_name: String,
        /// Number of matching subscriptions.
        matches: usize,
    },

    /// A service task references a delegate that was never registered.
    #[error("No activity delegate registered under '{name}'")]
    DelegateNotFound {
        /// The delegate name.
        name: String,
    },

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Serialization or deserialization of a stored value failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Shorthand for an [`EngineError::IllegalStateTransition`].
    pub fn illegal_state(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IllegalStateTransition {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an [`EngineError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an [`EngineError::Database`].
    pub fn database(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Database {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    /// True for concurrent-modification failures, which callers may retry.
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::IllegalStateTransition { .. } => "ILLEGAL_STATE_TRANSITION",
            Self::OptimisticLock { .. } => "OPTIMISTIC_LOCK",
            Self::JobExecutionFailure { .. } => "JOB_EXECUTION_FAILURE",
            Self::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            Self::LockLost { .. } => "LOCK_LOST",
            Self::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            Self::ProcessDefinitionNotFound { .. } => "PROCESS_DEFINITION_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::MessageCorrelation { .. } => "MESSAGE_CORRELATION",
            Self::DelegateNotFound { .. } => "DELEGATE_NOT_FOUND",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
