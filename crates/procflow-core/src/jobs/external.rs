// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External tasks.
//!
//! An external task is an `external_worker` job created when an execution
//! reaches an external task activity. Workers outside the engine fetch and
//! lock tasks by topic, then complete them (the execution continues) or
//! report a failure (the task is retried after a timeout or dead-lettered).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::{Command, CommandContext};
use crate::engine::EngineEvent;
use crate::error::{EngineError, Result};
use crate::operations::Operation;
use crate::persistence::{Job, JobKind, VariableValue};
use crate::variables;

/// An external task locked for a worker, with the variables visible to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedExternalTask {
    /// Task (job) id.
    pub id: String,
    /// Topic the task was fetched from.
    pub topic: String,
    /// Worker holding the lock.
    pub worker_id: String,
    /// When the lock expires.
    pub lock_expiration_time: DateTime<Utc>,
    /// Execution waiting for the task.
    pub execution_id: String,
    /// Process instance of the execution.
    pub process_instance_id: String,
    /// External task activity.
    pub activity_id: String,
    /// Remaining retries.
    pub retries: i32,
    /// Priority.
    pub priority: i64,
    /// Message of the last reported failure.
    pub error_message: Option<String>,
    /// Variables visible from the execution.
    pub variables: BTreeMap<String, VariableValue>,
}

impl LockedExternalTask {
    pub(crate) fn from_job(job: &Job, variables: BTreeMap<String, VariableValue>) -> Result<Self> {
        let missing = |field: &str| {
            EngineError::illegal_state(&job.id, format!("external task has no {}", field))
        };
        Ok(Self {
            id: job.id.clone(),
            topic: job.topic.clone().ok_or_else(|| missing("topic"))?,
            worker_id: job.lock_owner.clone().ok_or_else(|| missing("lock owner"))?,
            lock_expiration_time: job
                .lock_expiration_time
                .ok_or_else(|| missing("lock expiration"))?,
            execution_id: job.execution_id.clone().ok_or_else(|| missing("execution"))?,
            process_instance_id: job
                .process_instance_id
                .clone()
                .ok_or_else(|| missing("process instance"))?,
            activity_id: job
                .handler_configuration
                .clone()
                .ok_or_else(|| missing("activity"))?,
            retries: job.retries,
            priority: job.priority,
            error_message: job.exception_message.clone(),
            variables,
        })
    }
}

/// Reads the variables handed to a fetched task.
#[derive(Debug, Clone)]
pub(crate) struct ReadTaskVariablesCommand {
    pub(crate) execution_id: String,
}

#[async_trait]
impl Command for ReadTaskVariablesCommand {
    type Output = BTreeMap<String, VariableValue>;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output> {
        ctx.load_execution(&self.execution_id).await?;
        variables::all(ctx, &self.execution_id)
    }
}

/// Load an external task and check the caller holds a valid lock on it.
async fn locked_task(ctx: &mut CommandContext, task_id: &str, worker_id: &str) -> Result<Job> {
    let job = ctx
        .load_job(task_id)
        .await?
        .ok_or_else(|| EngineError::JobNotFound {
            job_id: task_id.to_string(),
        })?;
    if job.kind != JobKind::ExternalWorker {
        return Err(EngineError::illegal_state(
            task_id,
            format!("job is '{}', not an external task", job.kind),
        ));
    }
    if job.lock_owner.as_deref() != Some(worker_id) || !job.is_locked_at(ctx.now()) {
        return Err(EngineError::LockLost {
            job_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        });
    }
    Ok(job)
}

fn task_mut<'a>(ctx: &'a mut CommandContext, task_id: &str) -> Result<&'a mut Job> {
    ctx.job_mut(task_id).ok_or_else(|| EngineError::JobNotFound {
        job_id: task_id.to_string(),
    })
}

/// Complete a locked external task: write the variables and continue the
/// waiting execution past the activity.
#[derive(Debug, Clone)]
pub struct CompleteExternalTaskCommand {
    /// Task id.
    pub task_id: String,
    /// Worker holding the lock.
    pub worker_id: String,
    /// Variables to set on the execution (non-local writes).
    pub variables: BTreeMap<String, VariableValue>,
}

#[async_trait]
impl Command for CompleteExternalTaskCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let job = locked_task(ctx, &self.task_id, &self.worker_id).await?;
        let execution_id = job
            .execution_id
            .clone()
            .ok_or_else(|| EngineError::illegal_state(&job.id, "external task has no execution"))?;
        let execution = ctx.load_execution(&execution_id).await?;
        if execution.activity_id != job.handler_configuration {
            return Err(EngineError::illegal_state(
                &execution_id,
                "execution is no longer waiting at the external task",
            ));
        }

        ctx.delete_job(&job.id);
        variables::set_all(ctx, &execution_id, &self.variables)?;
        ctx.plan(
            Operation::TakeOutgoingFlows {
                skip_async_after: false,
            },
            execution_id,
        );
        info!(task_id = %job.id, worker_id = %self.worker_id, "External task completed");
        Ok(())
    }
}

/// Report a failed attempt at an external task.
///
/// The worker decides the remaining retries. With retries left the task is
/// unlocked and becomes fetchable again after `retry_timeout`; with none it
/// is dead-lettered.
#[derive(Debug, Clone)]
pub struct ExternalTaskFailureCommand {
    /// Task id.
    pub task_id: String,
    /// Worker holding the lock.
    pub worker_id: String,
    /// Failure message.
    pub error_message: String,
    /// Failure details.
    pub error_details: Option<String>,
    /// Remaining retries after this failure.
    pub retries: i32,
    /// Delay before the task can be fetched again.
    pub retry_timeout: Duration,
}

#[async_trait]
impl Command for ExternalTaskFailureCommand {
    type Output = JobKind;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobKind> {
        if self.retries < 0 {
            return Err(EngineError::validation("retries", "must not be negative"));
        }
        locked_task(ctx, &self.task_id, &self.worker_id).await?;
        let now = ctx.now();
        let due_date = super::add_duration(now, self.retry_timeout, "retry_timeout")?;

        let job = task_mut(ctx, &self.task_id)?;
        job.retries = self.retries;
        job.failed_attempts += 1;
        job.exception_message = Some(self.error_message.clone());
        job.exception_stacktrace = self.error_details.clone();
        job.release_lock();

        if job.retries > 0 {
            job.due_date = Some(due_date);
            debug!(task_id = %job.id, retries = job.retries, "External task failure recorded");
            return Ok(JobKind::ExternalWorker);
        }

        job.transition_to(JobKind::DeadLetter)?;
        let event = EngineEvent::JobDeadLettered {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            exception_message: job.exception_message.clone(),
        };
        ctx.publish(event);
        info!(task_id = %self.task_id, "External task moved to dead letter");
        Ok(JobKind::DeadLetter)
    }
}

/// Extend the lock of an external task the worker still holds.
#[derive(Debug, Clone)]
pub struct ExtendExternalTaskLockCommand {
    /// Task id.
    pub task_id: String,
    /// Worker holding the lock.
    pub worker_id: String,
    /// New lock duration, counted from now.
    pub lock_duration: Duration,
}

#[async_trait]
impl Command for ExtendExternalTaskLockCommand {
    type Output = DateTime<Utc>;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<DateTime<Utc>> {
        locked_task(ctx, &self.task_id, &self.worker_id).await?;
        let expiration = super::add_duration(ctx.now(), self.lock_duration, "lock_duration")?;
        task_mut(ctx, &self.task_id)?.lock_expiration_time = Some(expiration);
        Ok(expiration)
    }
}

/// Release the lock of an external task regardless of owner.
#[derive(Debug, Clone)]
pub struct UnlockExternalTaskCommand {
    /// Task id.
    pub task_id: String,
}

#[async_trait]
impl Command for UnlockExternalTaskCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let job = ctx
            .load_job(&self.task_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound {
                job_id: self.task_id.clone(),
            })?;
        if job.kind != JobKind::ExternalWorker {
            return Err(EngineError::illegal_state(
                &job.id,
                "job is not an external task",
            ));
        }
        task_mut(ctx, &self.task_id)?.release_lock();
        Ok(())
    }
}
