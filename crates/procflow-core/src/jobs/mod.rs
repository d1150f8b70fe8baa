// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable jobs.
//!
//! Work that has to survive a crash or run later is persisted as a [`Job`]
//! and picked up by the [`JobExecutor`]. Workers claim jobs with a
//! compare-and-swap on the job revision, run the registered [`JobHandler`]
//! in a fresh unit of work, and on failure reschedule the job with backoff
//! until its retries run out and it is dead-lettered.
//!
//! Job kinds:
//! - `timer`: waiting for its due date, promoted to `ready` by the executor
//! - `ready`: acquirable by workers
//! - `external_worker`: fetched and completed by external workers
//! - `suspended`: parked, never acquired
//! - `dead_letter`: retries exhausted, needs an operator

pub mod acquisition;
pub mod commands;
pub mod executor;
pub mod external;

pub use self::acquisition::JobAcquisition;
pub use self::commands::{
    ActivateJobCommand, DeadLetterJobCommand, DeleteJobCommand, ExecuteJobCommand,
    FailJobCommand, PromoteTimerJobCommand, ReclaimJobLockCommand, RetryDeadLetterJobCommand,
    ScheduleJobCommand, SetJobRetriesCommand, SuspendJobCommand, UnlockJobCommand,
};
pub use self::executor::{JobExecutor, JobOutcome};
pub use self::external::{
    CompleteExternalTaskCommand, ExtendExternalTaskLockCommand, ExternalTaskFailureCommand,
    LockedExternalTask, UnlockExternalTaskCommand,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::operations::Operation;
use crate::persistence::{Execution, Job, JobKind};

/// Job type continuing an execution asynchronously.
pub const ASYNC_CONTINUATION: &str = "async-continuation";
/// Job type firing a timer catch event.
pub const TIMER_TRANSITION: &str = "timer-transition";
/// Job type of external-worker tasks.
pub const EXTERNAL_TASK: &str = "external-task";

/// Async-continuation configuration: continue by executing the activity.
pub const ASYNC_BEFORE: &str = "before";
/// Async-continuation configuration: continue by leaving the activity.
pub const ASYNC_AFTER: &str = "after";

/// Code run when a job executes.
///
/// Handlers run inside the job's unit of work; the job row is deleted in the
/// same commit. Returning an error rolls the unit of work back and fails the
/// job attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job.
    async fn execute(&self, job: &Job, ctx: &mut CommandContext) -> Result<()>;
}

/// Handlers by job type.
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `async-continuation` and `timer-transition` handlers.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(ASYNC_CONTINUATION, Arc::new(AsyncContinuationHandler));
        registry.register(TIMER_TRANSITION, Arc::new(TimerTransitionHandler));
        registry
    }

    /// Register a handler, replacing any previous one for the same type.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Look up a handler.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Whether a handler is registered for `job_type`.
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }
}

impl std::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("JobHandlerRegistry")
            .field("handlers", &types)
            .finish()
    }
}

/// Continues an execution that paused before or after an activity.
pub struct AsyncContinuationHandler;

#[async_trait]
impl JobHandler for AsyncContinuationHandler {
    async fn execute(&self, job: &Job, ctx: &mut CommandContext) -> Result<()> {
        let execution_id = linked_execution(job)?;
        ctx.load_execution(execution_id).await?;

        let operation = match job.handler_configuration.as_deref() {
            Some(ASYNC_BEFORE) => Operation::ExecuteActivity,
            Some(ASYNC_AFTER) => Operation::TakeOutgoingFlows {
                skip_async_after: true,
            },
            other => {
                return Err(EngineError::validation(
                    "handler_configuration",
                    format!("unknown async continuation '{}'", other.unwrap_or_default()),
                ));
            }
        };
        ctx.plan(operation, execution_id);
        Ok(())
    }
}

/// Leaves the timer catch event a timer job was created for.
pub struct TimerTransitionHandler;

#[async_trait]
impl JobHandler for TimerTransitionHandler {
    async fn execute(&self, job: &Job, ctx: &mut CommandContext) -> Result<()> {
        let execution_id = linked_execution(job)?;
        let execution = ctx.load_execution(execution_id).await?;

        if let Some(activity_id) = job.handler_configuration.as_deref()
            && execution.activity_id.as_deref() != Some(activity_id)
        {
            return Err(EngineError::illegal_state(
                execution_id,
                format!("execution is no longer waiting at timer '{}'", activity_id),
            ));
        }

        ctx.plan(
            Operation::TakeOutgoingFlows {
                skip_async_after: false,
            },
            execution_id,
        );
        Ok(())
    }
}

fn linked_execution(job: &Job) -> Result<&str> {
    job.execution_id
        .as_deref()
        .ok_or_else(|| EngineError::illegal_state(&job.id, "job is not linked to an execution"))
}

/// Description of a job to create.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Handler key.
    pub job_type: String,
    /// Initial kind; `timer` jobs need a due date.
    pub kind: JobKind,
    /// Opaque handler payload.
    pub handler_configuration: Option<String>,
    /// Execution the job continues.
    pub execution_id: Option<String>,
    /// Process instance of the execution.
    pub process_instance_id: Option<String>,
    /// Flow graph of the process instance.
    pub process_definition_id: Option<String>,
    /// Tenant.
    pub tenant_id: Option<String>,
    /// Topic of an external-worker job.
    pub topic: Option<String>,
    /// Acquisition priority.
    pub priority: i64,
    /// When the job becomes due.
    pub due_date: Option<DateTime<Utc>>,
    /// Retries; the engine default when `None`.
    pub retries: Option<i32>,
    /// Caller-supplied correlation id.
    pub correlation_id: Option<String>,
}

impl NewJob {
    /// A `ready` job of the given type, not linked to any execution.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            kind: JobKind::Ready,
            handler_configuration: None,
            execution_id: None,
            process_instance_id: None,
            process_definition_id: None,
            tenant_id: None,
            topic: None,
            priority: 0,
            due_date: None,
            retries: None,
            correlation_id: None,
        }
    }

    /// A `ready` job continuing `execution`.
    pub fn for_execution(job_type: impl Into<String>, execution: &Execution) -> Self {
        Self {
            execution_id: Some(execution.id.clone()),
            process_instance_id: Some(execution.process_instance_id.clone()),
            process_definition_id: Some(execution.process_definition_id.clone()),
            tenant_id: execution.tenant_id.clone(),
            ..Self::new(job_type)
        }
    }

    /// Set the kind.
    pub fn kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the handler configuration.
    pub fn configuration(mut self, configuration: impl Into<String>) -> Self {
        self.handler_configuration = Some(configuration.into());
        self
    }

    /// Set the due date.
    pub fn due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    /// Set the topic.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retries.
    pub fn retries(mut self, retries: i32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set the correlation id.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Add a job to the unit of work. Returns its id.
pub fn create_job(ctx: &mut CommandContext, new_job: NewJob) -> String {
    let id = ctx.new_id();
    let job = Job {
        id: id.clone(),
        correlation_id: new_job.correlation_id,
        kind: new_job.kind,
        job_type: new_job.job_type,
        handler_configuration: new_job.handler_configuration,
        execution_id: new_job.execution_id,
        process_instance_id: new_job.process_instance_id,
        process_definition_id: new_job.process_definition_id,
        topic: new_job.topic,
        priority: new_job.priority,
        due_date: new_job.due_date,
        lock_owner: None,
        lock_expiration_time: None,
        retries: new_job
            .retries
            .unwrap_or(ctx.config().default_retries),
        failed_attempts: 0,
        exception_message: None,
        exception_stacktrace: None,
        tenant_id: new_job.tenant_id,
        created_at: ctx.now(),
        revision: 1,
    };
    tracing::debug!(
        job_id = %job.id,
        job_type = %job.job_type,
        kind = %job.kind,
        "Created job"
    );
    ctx.insert_job(job);
    id
}

pub(crate) fn create_async_continuation(
    ctx: &mut CommandContext,
    execution: &Execution,
    configuration: &str,
) -> Result<String> {
    let new_job = NewJob::for_execution(ASYNC_CONTINUATION, execution).configuration(configuration);
    Ok(create_job(ctx, new_job))
}

/// `now + duration`, rejecting durations the calendar cannot represent.
pub(crate) fn add_duration(
    now: DateTime<Utc>,
    duration: std::time::Duration,
    field: &str,
) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| EngineError::validation(field, "duration out of range"))
}
