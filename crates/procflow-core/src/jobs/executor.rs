// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background job executor.
//!
//! Runs three kinds of loops until shutdown:
//! - workers: acquire ready jobs and execute each in its own unit of work
//! - timer promotion: move due timer jobs to the ready queue
//! - lock reclamation: clear locks whose expiration passed
//!
//! Idle workers sleep for the poll interval but wake early when a command
//! commits a new ready job.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::acquisition::JobAcquisition;
use super::commands::{
    DeadLetterJobCommand, ExecuteJobCommand, FailJobCommand, PromoteTimerJobCommand,
    ReclaimJobLockCommand, UnlockJobCommand,
};
use crate::config::JobExecutorConfig;
use crate::context::CommandExecutor;
use crate::engine::EngineServices;
use crate::error::{EngineError, Result};
use crate::persistence::{Job, JobKind, JobQuery};

/// What happened to one executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded, job deleted.
    Completed,
    /// Handler failed, job rescheduled.
    Retrying,
    /// Job moved to the dead-letter queue.
    DeadLettered,
    /// Nothing was recorded: the lock was lost or the unit of work conflicted.
    Abandoned,
}

/// Acquires and executes jobs.
pub struct JobExecutor {
    services: Arc<EngineServices>,
    commands: CommandExecutor,
    acquisition: JobAcquisition,
    config: JobExecutorConfig,
}

impl JobExecutor {
    /// Create an executor.
    pub fn new(services: Arc<EngineServices>, config: JobExecutorConfig) -> Self {
        Self {
            commands: CommandExecutor::new(services.clone()),
            acquisition: JobAcquisition::new(&services),
            services,
            config,
        }
    }

    /// Executor configuration.
    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// One acquisition round: lock a batch and execute it. Returns the number
    /// of jobs acquired.
    pub async fn acquire_and_execute(&self) -> Result<usize> {
        let jobs = self
            .acquisition
            .acquire(
                &self.config.worker_id,
                self.config.acquire_batch_size,
                self.services.config.lock_duration,
            )
            .await?;
        let acquired = jobs.len();
        for job in jobs {
            self.execute_job(&job).await;
        }
        Ok(acquired)
    }

    /// Execute a job this executor has locked and record the outcome.
    pub async fn execute_job(&self, job: &Job) -> JobOutcome {
        let worker_id = self.config.worker_id.clone();
        let command = ExecuteJobCommand {
            job_id: job.id.clone(),
            worker_id: worker_id.clone(),
        };

        let err = match self.commands.execute(&command).await {
            Ok(()) => {
                debug!(job_id = %job.id, job_type = %job.job_type, "Job completed");
                return JobOutcome::Completed;
            }
            Err(e) => e,
        };

        match err {
            EngineError::OptimisticLock { .. } | EngineError::LockLost { .. } => {
                warn!(
                    job_id = %job.id,
                    error = %err,
                    "Job execution lost a race, releasing lock"
                );
                let unlock = UnlockJobCommand {
                    job_id: job.id.clone(),
                    worker_id,
                };
                if let Err(e) = self.commands.execute(&unlock).await {
                    debug!(job_id = %job.id, error = %e, "Could not release job lock");
                }
                JobOutcome::Abandoned
            }
            EngineError::HandlerNotFound { .. }
            | EngineError::IllegalStateTransition { .. } => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    error_code = err.error_code(),
                    error = %err,
                    "Job cannot succeed on retry"
                );
                let command = DeadLetterJobCommand {
                    job_id: job.id.clone(),
                    message: err.to_string(),
                };
                match self.commands.execute(&command).await {
                    Ok(()) => JobOutcome::DeadLettered,
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
                        JobOutcome::Abandoned
                    }
                }
            }
            err => {
                let message = match &err {
                    EngineError::JobExecutionFailure { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    error_code = err.error_code(),
                    error = %err,
                    "Job failed"
                );
                let command = FailJobCommand {
                    job_id: job.id.clone(),
                    worker_id,
                    message,
                    details: Some(format!("{:?}", err)),
                };
                match self.commands.execute(&command).await {
                    Ok(JobKind::DeadLetter) => JobOutcome::DeadLettered,
                    Ok(_) => JobOutcome::Retrying,
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to record job failure");
                        JobOutcome::Abandoned
                    }
                }
            }
        }
    }

    /// Promote every due timer job. Returns the number promoted.
    pub async fn promote_due_timers(&self) -> Result<usize> {
        let now = self.services.clock.now();
        let due = self
            .services
            .persistence
            .find_jobs(&JobQuery {
                kind: Some(JobKind::Timer),
                due_before: Some(now),
                ..Default::default()
            })
            .await?;

        let mut promoted = 0;
        for job in due {
            let command = PromoteTimerJobCommand {
                job_id: job.id.clone(),
            };
            match self.commands.execute(&command).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) if e.is_optimistic_lock() => {
                    debug!(job_id = %job.id, "Timer changed concurrently, skipping");
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to promote timer"),
            }
        }
        if promoted > 0 {
            debug!(promoted, "Promoted due timers");
            self.services.job_available.notify_waiters();
        }
        Ok(promoted)
    }

    /// Clear every expired lock. Returns the number reclaimed.
    pub async fn reclaim_expired_locks(&self) -> Result<usize> {
        let now = self.services.clock.now();
        let expired = self
            .services
            .persistence
            .find_jobs(&JobQuery {
                lock_expired_before: Some(now),
                ..Default::default()
            })
            .await?;

        let mut reclaimed = 0;
        for job in expired {
            let command = ReclaimJobLockCommand {
                job_id: job.id.clone(),
            };
            match self.commands.execute(&command).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) if e.is_optimistic_lock() => {
                    debug!(job_id = %job.id, "Lock changed concurrently, skipping");
                }
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to reclaim lock"),
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, "Reclaimed expired job locks");
            self.services.job_available.notify_waiters();
        }
        Ok(reclaimed)
    }

    /// Spawn the worker, promotion and reclamation loops.
    ///
    /// Every loop exits when `shutdown` flips to true or its sender is dropped.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            worker_id = %self.config.worker_id,
            workers = self.config.worker_count,
            batch_size = self.config.acquire_batch_size,
            "Starting job executor"
        );

        let mut handles = Vec::with_capacity(self.config.worker_count + 2);
        for index in 0..self.config.worker_count {
            handles.push(tokio::spawn(
                self.clone().run_worker(index, shutdown.clone()),
            ));
        }
        handles.push(tokio::spawn(self.clone().run_timer_promotion(shutdown.clone())));
        handles.push(tokio::spawn(self.run_lock_reclamation(shutdown)));
        handles
    }

    async fn run_worker(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = index, "Job worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let acquired = match self.acquire_and_execute().await {
                Ok(count) => count,
                Err(e) => {
                    error!(worker = index, error = %e, "Job acquisition failed");
                    0
                }
            };
            if acquired > 0 {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.services.job_available.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(worker = index, "Job worker stopped");
    }

    async fn run_timer_promotion(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.promote_due_timers().await {
                error!(error = %e, "Timer promotion failed");
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.timer_promotion_interval) => {}
            }
        }
        debug!("Timer promotion stopped");
    }

    async fn run_lock_reclamation(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.reclaim_expired_locks().await {
                error!(error = %e, "Lock reclamation failed");
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.lock_reclaim_interval) => {}
            }
        }
        debug!("Lock reclamation stopped");
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::context::CommandContext;
    use crate::jobs::{JobHandler, JobHandlerRegistry};
    use crate::persistence::{Change, ChangeSet, InMemoryPersistence, Persistence};
    use crate::test_support::{sample_job, services_with_handlers};

    struct Failing;

    #[async_trait]
    impl JobHandler for Failing {
        async fn execute(&self, job: &Job, _ctx: &mut CommandContext) -> Result<()> {
            Err(EngineError::JobExecutionFailure {
                job_id: job.id.clone(),
                message: "always fails".into(),
            })
        }
    }

    struct Succeeding;

    #[async_trait]
    impl JobHandler for Succeeding {
        async fn execute(&self, _job: &Job, _ctx: &mut CommandContext) -> Result<()> {
            Ok(())
        }
    }

    async fn setup(
        jobs: Vec<Job>,
        clock: Arc<ManualClock>,
    ) -> (JobExecutor, Arc<InMemoryPersistence>) {
        let persistence = Arc::new(InMemoryPersistence::new());
        let mut handlers = JobHandlerRegistry::new();
        handlers.register("ok", Arc::new(Succeeding));
        handlers.register("fail", Arc::new(Failing));
        let services = services_with_handlers(persistence.clone(), clock, handlers);
        persistence
            .flush(ChangeSet {
                jobs: jobs.into_iter().map(Change::Insert).collect(),
                ..Default::default()
            })
            .await
            .unwrap();
        let config = JobExecutorConfig {
            worker_id: "worker-1".into(),
            ..Default::default()
        };
        (JobExecutor::new(services, config), persistence)
    }

    fn typed(id: &str, job_type: &str, clock: &ManualClock) -> Job {
        let mut job = sample_job(id, JobKind::Ready, clock.now());
        job.job_type = job_type.into();
        job
    }

    #[tokio::test]
    async fn test_successful_job_is_deleted() {
        let clock = Arc::new(ManualClock::default());
        let (executor, persistence) = setup(vec![typed("a", "ok", &clock)], clock).await;

        assert_eq!(executor.acquire_and_execute().await.unwrap(), 1);
        assert!(persistence.find_job("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_job_retries_then_dead_letters() {
        let clock = Arc::new(ManualClock::default());
        let mut job = typed("a", "fail", &clock);
        job.retries = 2;
        let (executor, persistence) = setup(vec![job], clock.clone()).await;

        assert_eq!(executor.acquire_and_execute().await.unwrap(), 1);
        let stored = persistence.find_job("a").await.unwrap().unwrap();
        assert_eq!(stored.kind, JobKind::Timer);
        assert_eq!(stored.retries, 1);

        // Not acquirable until promoted.
        assert_eq!(executor.acquire_and_execute().await.unwrap(), 0);
        clock.advance(chrono::Duration::hours(1));
        assert_eq!(executor.promote_due_timers().await.unwrap(), 1);

        assert_eq!(executor.acquire_and_execute().await.unwrap(), 1);
        let stored = persistence.find_job("a").await.unwrap().unwrap();
        assert_eq!(stored.kind, JobKind::DeadLetter);
        assert_eq!(stored.retries, 0);
        assert_eq!(stored.failed_attempts, 2);
        assert_eq!(stored.exception_message.as_deref(), Some("always fails"));
    }

    #[tokio::test]
    async fn test_unknown_job_type_is_dead_lettered_with_retries() {
        let clock = Arc::new(ManualClock::default());
        let (executor, persistence) = setup(vec![typed("a", "unknown", &clock)], clock).await;

        executor.acquire_and_execute().await.unwrap();
        let stored = persistence.find_job("a").await.unwrap().unwrap();
        assert_eq!(stored.kind, JobKind::DeadLetter);
        assert_eq!(stored.retries, 3);
    }

    #[tokio::test]
    async fn test_lost_lock_leaves_job_untouched() {
        let clock = Arc::new(ManualClock::default());
        let (executor, persistence) = setup(vec![typed("a", "ok", &clock)], clock.clone()).await;

        let stolen = persistence
            .lock_job("a", 1, "someone-else", clock.now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(stolen);
        let job = persistence.find_job("a").await.unwrap().unwrap();

        assert_eq!(executor.execute_job(&job).await, JobOutcome::Abandoned);
        let stored = persistence.find_job("a").await.unwrap().unwrap();
        assert_eq!(stored.lock_owner.as_deref(), Some("someone-else"));
        assert_eq!(stored.retries, 3);
    }

    #[tokio::test]
    async fn test_reclaim_expired_locks() {
        let clock = Arc::new(ManualClock::default());
        let (executor, persistence) = setup(vec![typed("a", "ok", &clock)], clock.clone()).await;
        persistence
            .lock_job("a", 1, "crashed", clock.now() + chrono::Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(executor.reclaim_expired_locks().await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(executor.reclaim_expired_locks().await.unwrap(), 1);
        let stored = persistence.find_job("a").await.unwrap().unwrap();
        assert!(stored.lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_spawned_loops_stop_on_shutdown() {
        let clock = Arc::new(ManualClock::default());
        let (executor, _) = setup(vec![], clock).await;
        let (tx, rx) = watch::channel(false);

        let handles = Arc::new(executor).spawn(rx);
        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
