// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Holds every table in ordered maps behind a single async mutex, so a flush
//! is validated and applied as one critical section. Used by tests and by
//! embedders that do not need durability.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};

use super::{
    Change, ChangeSet, Entity, EventSubscription, EventSubscriptionQuery, Execution, Job,
    JobKind, JobQuery, Persistence, VariableInstance,
};

#[derive(Debug, Default)]
struct Store {
    executions: BTreeMap<String, Execution>,
    variables: BTreeMap<String, VariableInstance>,
    jobs: BTreeMap<String, Job>,
    event_subscriptions: BTreeMap<String, EventSubscription>,
}

/// In-memory persistence provider.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    store: Mutex<Store>,
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions.
    pub async fn execution_count(&self) -> usize {
        self.store.lock().await.executions.len()
    }

    /// Number of stored variables.
    pub async fn variable_count(&self) -> usize {
        self.store.lock().await.variables.len()
    }

    /// Number of stored jobs.
    pub async fn job_count(&self) -> usize {
        self.store.lock().await.jobs.len()
    }

    /// Number of stored event subscriptions.
    pub async fn event_subscription_count(&self) -> usize {
        self.store.lock().await.event_subscriptions.len()
    }
}

/// Check one table's changes against the stored revisions without applying them.
fn validate<T: Entity>(table: &BTreeMap<String, T>, changes: &[Change<T>]) -> Result<()> {
    for change in changes {
        match change {
            Change::Insert(entity) => {
                if table.contains_key(entity.id()) {
                    return Err(EngineError::OptimisticLock {
                        entity: T::KIND,
                        id: entity.id().to_string(),
                    });
                }
            }
            Change::Update(entity) => {
                let stored = table.get(entity.id()).map(|e| e.revision());
                if stored != Some(entity.revision()) {
                    return Err(EngineError::OptimisticLock {
                        entity: T::KIND,
                        id: entity.id().to_string(),
                    });
                }
            }
            Change::Delete { id, revision } => {
                let stored = table.get(id).map(|e| e.revision());
                if stored != Some(*revision) {
                    return Err(EngineError::OptimisticLock {
                        entity: T::KIND,
                        id: id.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Apply validated changes, assigning the revisions the store would.
fn apply<T: Entity>(
    table: &mut BTreeMap<String, T>,
    changes: Vec<Change<T>>,
    set_revision: impl Fn(&mut T, i32),
) {
    for change in changes {
        match change {
            Change::Insert(mut entity) => {
                set_revision(&mut entity, 1);
                table.insert(entity.id().to_string(), entity);
            }
            Change::Update(mut entity) => {
                let next = entity.revision() + 1;
                set_revision(&mut entity, next);
                table.insert(entity.id().to_string(), entity);
            }
            Change::Delete { id, .. } => {
                table.remove(&id);
            }
        }
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn find_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self.store.lock().await.executions.get(id).cloned())
    }

    async fn find_executions_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Result<Vec<Execution>> {
        let store = self.store.lock().await;
        Ok(store
            .executions
            .values()
            .filter(|e| e.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn find_process_instances(
        &self,
        process_definition_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Execution>> {
        let store = self.store.lock().await;
        Ok(store
            .executions
            .values()
            .filter(|e| e.parent_id.is_none())
            .filter(|e| {
                process_definition_id
                    .map(|d| e.process_definition_id == d)
                    .unwrap_or(true)
            })
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn find_variables_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Result<Vec<VariableInstance>> {
        let store = self.store.lock().await;
        Ok(store
            .variables
            .values()
            .filter(|v| v.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn find_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.store.lock().await.jobs.get(id).cloned())
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let store = self.store.lock().await;
        let mut jobs: Vec<Job> = store
            .jobs
            .values()
            .filter(|j| query.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }

    async fn find_acquirable_jobs(
        &self,
        kind: JobKind,
        topics: Option<&[String]>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let store = self.store.lock().await;
        let mut jobs: Vec<Job> = store
            .jobs
            .values()
            .filter(|j| j.kind == kind)
            .filter(|j| j.retries > 0)
            .filter(|j| !j.is_locked_at(now))
            .filter(|j| j.due_date.map(|due| due <= now).unwrap_or(true))
            .filter(|j| match topics {
                Some(topics) => j
                    .topic
                    .as_ref()
                    .map(|t| topics.contains(t))
                    .unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(
                    a.due_date
                        .unwrap_or(a.created_at)
                        .cmp(&b.due_date.unwrap_or(b.created_at)),
                )
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn find_event_subscriptions(
        &self,
        query: &EventSubscriptionQuery,
    ) -> Result<Vec<EventSubscription>> {
        let store = self.store.lock().await;
        let mut subscriptions: Vec<EventSubscription> = store
            .event_subscriptions
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subscriptions)
    }

    async fn lock_job(
        &self,
        job_id: &str,
        expected_revision: i32,
        lock_owner: &str,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut store = self.store.lock().await;
        match store.jobs.get_mut(job_id) {
            Some(job) if job.revision == expected_revision => {
                job.lock_owner = Some(lock_owner.to_string());
                job.lock_expiration_time = Some(lock_expiration_time);
                job.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn flush(&self, changes: ChangeSet) -> Result<()> {
        let mut store = self.store.lock().await;

        validate(&store.executions, &changes.executions)?;
        validate(&store.variables, &changes.variables)?;
        validate(&store.jobs, &changes.jobs)?;
        validate(&store.event_subscriptions, &changes.event_subscriptions)?;

        let ChangeSet {
            executions,
            variables,
            jobs,
            event_subscriptions,
        } = changes;
        apply(&mut store.executions, executions, |e, r| e.revision = r);
        apply(&mut store.variables, variables, |v, r| v.revision = r);
        apply(&mut store.jobs, jobs, |j, r| j.revision = r);
        apply(&mut store.event_subscriptions, event_subscriptions, |s, r| {
            s.revision = r
        });

        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
