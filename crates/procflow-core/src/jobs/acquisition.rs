// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job acquisition.
//!
//! Candidates are read without locks, then each one is claimed with a
//! compare-and-swap on its revision. A worker that loses the race simply
//! skips the job, so a job is never handed to two workers at once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::clock::Clock;
use crate::engine::EngineServices;
use crate::error::{EngineError, Result};
use crate::persistence::{Job, JobKind, Persistence};

/// Claims jobs for a worker.
#[derive(Clone)]
pub struct JobAcquisition {
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
}

impl JobAcquisition {
    /// Create an acquisition over the engine's persistence and clock.
    pub fn new(services: &EngineServices) -> Self {
        Self {
            persistence: services.persistence.clone(),
            clock: services.clock.clone(),
        }
    }

    /// Lock up to `max_jobs` ready jobs for `worker_id`.
    ///
    /// Returns the jobs as they were stored after locking.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn acquire(
        &self,
        worker_id: &str,
        max_jobs: usize,
        lock_duration: Duration,
    ) -> Result<Vec<Job>> {
        self.acquire_kind(JobKind::Ready, None, worker_id, max_jobs, lock_duration)
            .await
    }

    /// Lock up to `max_tasks` external-worker jobs on any of `topics`.
    #[instrument(skip(self, topics), fields(worker_id = %worker_id))]
    pub async fn acquire_external(
        &self,
        worker_id: &str,
        topics: &[String],
        max_tasks: usize,
        lock_duration: Duration,
    ) -> Result<Vec<Job>> {
        self.acquire_kind(
            JobKind::ExternalWorker,
            Some(topics),
            worker_id,
            max_tasks,
            lock_duration,
        )
        .await
    }

    async fn acquire_kind(
        &self,
        kind: JobKind,
        topics: Option<&[String]>,
        worker_id: &str,
        max_jobs: usize,
        lock_duration: Duration,
    ) -> Result<Vec<Job>> {
        if max_jobs == 0 {
            return Ok(Vec::new());
        }
        if worker_id.is_empty() {
            return Err(EngineError::validation("worker_id", "must not be empty"));
        }

        let now = self.clock.now();
        let expiration = super::add_duration(now, lock_duration, "lock_duration")?;
        let candidates = self
            .persistence
            .find_acquirable_jobs(kind, topics, now, max_jobs as i64)
            .await?;

        let mut acquired = Vec::with_capacity(candidates.len());
        for mut job in candidates {
            let locked = self
                .persistence
                .lock_job(&job.id, job.revision, worker_id, expiration)
                .await?;
            if !locked {
                debug!(job_id = %job.id, "Job acquired by another worker, skipping");
                continue;
            }
            job.lock_owner = Some(worker_id.to_string());
            job.lock_expiration_time = Some(expiration);
            job.revision += 1;
            debug!(job_id = %job.id, job_type = %job.job_type, "Acquired job");
            acquired.push(job);
        }
        Ok(acquired)
    }
}
