// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands over jobs: execution, failure handling, scheduler passes and
//! operator actions.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::NewJob;
use crate::context::{Command, CommandContext};
use crate::engine::EngineEvent;
use crate::error::{EngineError, Result};
use crate::persistence::{Job, JobKind};

async fn load_job(ctx: &mut CommandContext, job_id: &str) -> Result<Job> {
    ctx.load_job(job_id)
        .await?
        .ok_or_else(|| EngineError::JobNotFound {
            job_id: job_id.to_string(),
        })
}

fn job_mut<'a>(ctx: &'a mut CommandContext, job_id: &str) -> Result<&'a mut Job> {
    ctx.job_mut(job_id).ok_or_else(|| EngineError::JobNotFound {
        job_id: job_id.to_string(),
    })
}

fn ensure_lock_owner(job: &Job, worker_id: &str) -> Result<()> {
    if job.lock_owner.as_deref() != Some(worker_id) {
        return Err(EngineError::LockLost {
            job_id: job.id.clone(),
            worker_id: worker_id.to_string(),
        });
    }
    Ok(())
}

fn dead_letter(ctx: &mut CommandContext, job_id: &str) -> Result<()> {
    let job = job_mut(ctx, job_id)?;
    job.transition_to(JobKind::DeadLetter)?;
    job.release_lock();
    let event = EngineEvent::JobDeadLettered {
        job_id: job.id.clone(),
        job_type: job.job_type.clone(),
        exception_message: job.exception_message.clone(),
    };
    warn!(
        job_id,
        job_type = %job.job_type,
        failed_attempts = job.failed_attempts,
        "Job moved to dead letter"
    );
    ctx.publish(event);
    Ok(())
}

// ============================================================================
// Execution
// ============================================================================

/// Run a locked job's handler and delete the job in the same unit of work.
///
/// Fails with [`EngineError::LockLost`] when the worker no longer owns the
/// lock and with [`EngineError::HandlerNotFound`] when no handler is
/// registered for the job type.
#[derive(Debug, Clone)]
pub struct ExecuteJobCommand {
    /// Job to run.
    pub job_id: String,
    /// Worker holding the lock.
    pub worker_id: String,
}

#[async_trait]
impl Command for ExecuteJobCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let job = load_job(ctx, &self.job_id).await?;
        ensure_lock_owner(&job, &self.worker_id)?;

        let handler = ctx
            .job_handler(&job.job_type)
            .ok_or_else(|| EngineError::HandlerNotFound {
                job_type: job.job_type.clone(),
            })?;

        if let Some(process_instance_id) = job.process_instance_id.as_deref() {
            ctx.load_process_instance(process_instance_id).await?;
        }

        ctx.delete_job(&job.id);
        handler.execute(&job, ctx).await
    }
}

/// Record a failed attempt.
///
/// Decrements the retries and releases the lock. With retries left the job
/// waits as a timer until the backoff delay has passed; otherwise it moves to
/// the dead-letter queue. Returns the job's new kind.
#[derive(Debug, Clone)]
pub struct FailJobCommand {
    /// The failed job.
    pub job_id: String,
    /// Worker holding the lock.
    pub worker_id: String,
    /// Failure message.
    pub message: String,
    /// Failure details.
    pub details: Option<String>,
}

#[async_trait]
impl Command for FailJobCommand {
    type Output = JobKind;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobKind> {
        let job = load_job(ctx, &self.job_id).await?;
        ensure_lock_owner(&job, &self.worker_id)?;

        let now = ctx.now();
        let backoff = ctx.config().job_backoff.clone();
        let exhausted = {
            let job = job_mut(ctx, &self.job_id)?;
            job.retries = (job.retries - 1).max(0);
            job.failed_attempts += 1;
            job.exception_message = Some(self.message.clone());
            job.exception_stacktrace = self.details.clone();
            job.release_lock();
            if job.retries > 0 {
                let delay = backoff.delay_for_attempt(job.failed_attempts.max(1) as u32);
                let due_date = super::add_duration(now, delay, "job_backoff")?;
                job.transition_to(JobKind::Timer)?;
                job.due_date = Some(due_date);
                debug!(
                    job_id = %job.id,
                    retries = job.retries,
                    due_date = %due_date,
                    "Job rescheduled after failure"
                );
            }
            job.retries == 0
        };

        if exhausted {
            dead_letter(ctx, &self.job_id)?;
            return Ok(JobKind::DeadLetter);
        }
        Ok(JobKind::Timer)
    }
}

/// Move a job straight to the dead-letter queue, keeping its retries.
///
/// Used when retrying cannot help, such as an unknown job type.
#[derive(Debug, Clone)]
pub struct DeadLetterJobCommand {
    /// The job.
    pub job_id: String,
    /// Failure message.
    pub message: String,
}

#[async_trait]
impl Command for DeadLetterJobCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        load_job(ctx, &self.job_id).await?;
        {
            let job = job_mut(ctx, &self.job_id)?;
            job.failed_attempts += 1;
            job.exception_message = Some(self.message.clone());
        }
        dead_letter(ctx, &self.job_id)
    }
}

/// Release a worker's lock without counting a failed attempt.
///
/// Returns false when the lock is held by someone else (or nobody).
#[derive(Debug, Clone)]
pub struct UnlockJobCommand {
    /// The job.
    pub job_id: String,
    /// Worker that believes it holds the lock.
    pub worker_id: String,
}

#[async_trait]
impl Command for UnlockJobCommand {
    type Output = bool;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<bool> {
        let Some(job) = ctx.load_job(&self.job_id).await? else {
            return Ok(false);
        };
        if job.lock_owner.as_deref() != Some(self.worker_id.as_str()) {
            return Ok(false);
        }
        job_mut(ctx, &self.job_id)?.release_lock();
        Ok(true)
    }
}

// ============================================================================
// Scheduler passes
// ============================================================================

/// Promote a due timer job to `ready`. Returns false if it is not a due timer.
#[derive(Debug, Clone)]
pub struct PromoteTimerJobCommand {
    /// The timer job.
    pub job_id: String,
}

#[async_trait]
impl Command for PromoteTimerJobCommand {
    type Output = bool;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<bool> {
        let Some(job) = ctx.load_job(&self.job_id).await? else {
            return Ok(false);
        };
        let now = ctx.now();
        let due = job.due_date.map(|due| due <= now).unwrap_or(true);
        if job.kind != JobKind::Timer || !due {
            return Ok(false);
        }
        job_mut(ctx, &self.job_id)?.transition_to(JobKind::Ready)?;
        debug!(job_id = %self.job_id, "Promoted timer job");
        Ok(true)
    }
}

/// Clear a lock that expired without the job being completed.
///
/// Returns false when the job is unlocked or the lock is still valid.
#[derive(Debug, Clone)]
pub struct ReclaimJobLockCommand {
    /// The job.
    pub job_id: String,
}

#[async_trait]
impl Command for ReclaimJobLockCommand {
    type Output = bool;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<bool> {
        let Some(job) = ctx.load_job(&self.job_id).await? else {
            return Ok(false);
        };
        if job.lock_owner.is_none() || job.is_locked_at(ctx.now()) {
            return Ok(false);
        }
        info!(
            job_id = %job.id,
            previous_owner = job.lock_owner.as_deref().unwrap_or_default(),
            "Reclaiming expired job lock"
        );
        job_mut(ctx, &self.job_id)?.release_lock();
        Ok(true)
    }
}

// ============================================================================
// Operator actions
// ============================================================================

/// Schedule a standalone or execution-bound job.
///
/// A job with a due date in the future starts as a timer; external-worker
/// jobs keep their kind. Returns the job id.
#[derive(Debug, Clone)]
pub struct ScheduleJobCommand {
    /// The job to create.
    pub job: NewJob,
}

#[async_trait]
impl Command for ScheduleJobCommand {
    type Output = String;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<String> {
        if self.job.job_type.trim().is_empty() {
            return Err(EngineError::validation("job_type", "must not be empty"));
        }
        if self.job.retries.is_some_and(|retries| retries < 1) {
            return Err(EngineError::validation("retries", "must be positive"));
        }
        let mut new_job = self.job.clone();
        if let Some(execution_id) = self.job.execution_id.as_deref() {
            let execution = ctx.load_execution(execution_id).await?;
            new_job.process_instance_id = Some(execution.process_instance_id);
            new_job.process_definition_id = Some(execution.process_definition_id);
        }

        if new_job.kind != JobKind::ExternalWorker {
            let now = ctx.now();
            new_job.kind = match new_job.due_date {
                Some(due) if due > now => JobKind::Timer,
                _ => JobKind::Ready,
            };
        } else if new_job.topic.is_none() {
            return Err(EngineError::validation(
                "topic",
                "external-worker jobs need a topic",
            ));
        }

        Ok(super::create_job(ctx, new_job))
    }
}

/// Set the remaining retries of a job.
///
/// Zero retries move a `ready`, `timer` or `external_worker` job to the
/// dead-letter queue. A suspended job must keep at least one retry.
#[derive(Debug, Clone)]
pub struct SetJobRetriesCommand {
    /// The job.
    pub job_id: String,
    /// New retry count.
    pub retries: i32,
}

#[async_trait]
impl Command for SetJobRetriesCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        if self.retries < 0 {
            return Err(EngineError::validation("retries", "must not be negative"));
        }
        let job = load_job(ctx, &self.job_id).await?;
        if self.retries == 0 && job.kind == JobKind::Suspended {
            return Err(EngineError::validation(
                "retries",
                "a suspended job needs at least one retry",
            ));
        }
        job_mut(ctx, &self.job_id)?.retries = self.retries;
        if self.retries == 0 && job.kind != JobKind::DeadLetter {
            dead_letter(ctx, &self.job_id)?;
        }
        Ok(())
    }
}

/// Return a dead-lettered job to its queue with fresh retries.
#[derive(Debug, Clone)]
pub struct RetryDeadLetterJobCommand {
    /// The dead-lettered job.
    pub job_id: String,
    /// Retries to grant; the engine default when `None`.
    pub retries: Option<i32>,
}

#[async_trait]
impl Command for RetryDeadLetterJobCommand {
    type Output = JobKind;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobKind> {
        let retries = self.retries.unwrap_or(ctx.config().default_retries);
        if retries <= 0 {
            return Err(EngineError::validation("retries", "must be positive"));
        }
        let job = load_job(ctx, &self.job_id).await?;
        if job.kind != JobKind::DeadLetter {
            return Err(EngineError::illegal_state(
                &job.id,
                format!("job is '{}', not dead-lettered", job.kind),
            ));
        }

        let now = ctx.now();
        let job = job_mut(ctx, &self.job_id)?;
        let next = job.resume_kind(now);
        job.transition_to(next)?;
        job.retries = retries;
        job.failed_attempts = 0;
        job.exception_message = None;
        job.exception_stacktrace = None;
        info!(job_id = %job.id, kind = %next, retries, "Retrying dead-lettered job");
        Ok(next)
    }
}

/// Park a job so that it is never acquired.
#[derive(Debug, Clone)]
pub struct SuspendJobCommand {
    /// The job.
    pub job_id: String,
}

#[async_trait]
impl Command for SuspendJobCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        load_job(ctx, &self.job_id).await?;
        let job = job_mut(ctx, &self.job_id)?;
        if job.kind != JobKind::Suspended {
            job.transition_to(JobKind::Suspended)?;
        }
        Ok(())
    }
}

/// Return a suspended job to its queue. Returns the new kind.
#[derive(Debug, Clone)]
pub struct ActivateJobCommand {
    /// The job.
    pub job_id: String,
}

#[async_trait]
impl Command for ActivateJobCommand {
    type Output = JobKind;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<JobKind> {
        let job = load_job(ctx, &self.job_id).await?;
        if job.kind != JobKind::Suspended {
            return Ok(job.kind);
        }
        let now = ctx.now();
        let job = job_mut(ctx, &self.job_id)?;
        let next = job.resume_kind(now);
        job.transition_to(next)?;
        Ok(next)
    }
}

/// Delete a job.
#[derive(Debug, Clone)]
pub struct DeleteJobCommand {
    /// The job.
    pub job_id: String,
}

#[async_trait]
impl Command for DeleteJobCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        load_job(ctx, &self.job_id).await?;
        ctx.delete_job(&self.job_id);
        Ok(())
    }
}
