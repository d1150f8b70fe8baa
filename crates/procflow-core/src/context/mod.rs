// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Unit of work.
//!
//! Every state change runs as a [`Command`] inside a fresh [`CommandContext`]
//! created by the [`CommandExecutor`]. The context owns the entity cache, the
//! operation agenda, transient variables and the engine events raised while
//! the command runs. When the command body returns, the executor drains the
//! agenda, flushes the cache's change set atomically and only then publishes
//! the events. Any error drops the context, which discards everything.

mod cache;

pub use self::cache::{EntityCache, EntityMap};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::agenda::Agenda;
use crate::config::{EngineConfig, RetryPolicy};
use crate::delegate::ActivityDelegate;
use crate::engine::{EngineEvent, EngineServices};
use crate::error::{EngineError, Result};
use crate::jobs::JobHandler;
use crate::model::FlowGraph;
use crate::operations::{self, Operation};
use crate::persistence::{
    Change, ChangeSet, EventSubscription, EventSubscriptionQuery, Execution, Job, JobQuery, Persistence,
    VariableInstance, VariableValue,
};

/// A unit of work run by the [`CommandExecutor`].
#[async_trait]
pub trait Command: Send + Sync {
    /// Value returned to the caller after a successful commit.
    type Output: Send;

    /// Run the command body. Operations planned here are drained before commit.
    async fn execute(&self, ctx: &mut CommandContext) -> Result<Self::Output>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

/// State of one unit of work.
pub struct CommandContext {
    services: Arc<EngineServices>,
    cache: EntityCache,
    loaded_instances: HashSet<String>,
    agenda: Agenda,
    transient: HashMap<(String, String), VariableValue>,
    events: Vec<EngineEvent>,
}

impl CommandContext {
    pub(crate) fn new(services: Arc<EngineServices>) -> Self {
        Self {
            services,
            cache: EntityCache::default(),
            loaded_instances: HashSet::new(),
            agenda: Agenda::new(),
            transient: HashMap::new(),
            events: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Shared engine services.
    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Persistence gateway, for reads outside the cache.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.services.persistence
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Current time from the engine clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    /// Resolve a flow graph.
    pub fn graph(&self, definition_id: &str) -> Result<Arc<FlowGraph>> {
        self.services.models.resolve(definition_id)
    }

    /// Registered job handler for `job_type`.
    pub fn job_handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.services.job_handlers.get(job_type)
    }

    /// Registered activity delegate named `name`.
    pub fn delegate(&self, name: &str) -> Result<Arc<dyn ActivityDelegate>> {
        self.services
            .delegates
            .get(name)
            .ok_or_else(|| EngineError::DelegateNotFound {
                name: name.to_string(),
            })
    }

    /// Fresh entity id.
    pub fn new_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load every execution, variable, job and event subscription of a
    /// process instance into the cache. Loading twice is a no-op.
    pub async fn load_process_instance(&mut self, process_instance_id: &str) -> Result<()> {
        if !self.loaded_instances.insert(process_instance_id.to_string()) {
            return Ok(());
        }

        let persistence = self.services.persistence.clone();
        for execution in persistence
            .find_executions_by_process_instance(process_instance_id)
            .await?
        {
            self.cache.executions.put_loaded(execution);
        }
        for variable in persistence
            .find_variables_by_process_instance(process_instance_id)
            .await?
        {
            self.cache.variables.put_loaded(variable);
        }
        for job in persistence
            .find_jobs(&JobQuery::for_process_instance(process_instance_id))
            .await?
        {
            self.cache.jobs.put_loaded(job);
        }
        for subscription in persistence
            .find_event_subscriptions(&EventSubscriptionQuery {
                process_instance_id: Some(process_instance_id.to_string()),
                ..Default::default()
            })
            .await?
        {
            self.cache.event_subscriptions.put_loaded(subscription);
        }

        debug!(process_instance_id, "Loaded process instance");
        Ok(())
    }

    /// Load an execution together with its whole process instance.
    pub async fn load_execution(&mut self, execution_id: &str) -> Result<Execution> {
        let process_instance_id = if self.cache.executions.contains(execution_id) {
            self.execution(execution_id)?.process_instance_id.clone()
        } else {
            self.services
                .persistence
                .find_execution(execution_id)
                .await?
                .ok_or_else(|| EngineError::ExecutionNotFound {
                    execution_id: execution_id.to_string(),
                })?
                .process_instance_id
        };

        self.load_process_instance(&process_instance_id).await?;
        self.execution(execution_id).cloned()
    }

    /// Load a job into the cache.
    pub async fn load_job(&mut self, job_id: &str) -> Result<Option<Job>> {
        if !self.cache.jobs.contains(job_id)
            && let Some(job) = self.services.persistence.find_job(job_id).await?
        {
            self.cache.jobs.put_loaded(job);
        }
        Ok(self.cache.jobs.get(job_id).cloned())
    }

    /// Query event subscriptions, merging in the ones cached by this unit of work.
    pub async fn find_event_subscriptions(
        &mut self,
        query: &EventSubscriptionQuery,
    ) -> Result<Vec<EventSubscription>> {
        for subscription in self
            .services
            .persistence
            .find_event_subscriptions(query)
            .await?
        {
            self.cache.event_subscriptions.put_loaded(subscription);
        }

        let mut found: Vec<EventSubscription> = self
            .cache
            .event_subscriptions
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Executions
    // ------------------------------------------------------------------

    /// Cached execution, if any.
    pub fn find_execution(&self, execution_id: &str) -> Option<&Execution> {
        self.cache.executions.get(execution_id)
    }

    /// Cached execution.
    pub fn execution(&self, execution_id: &str) -> Result<&Execution> {
        self.cache
            .executions
            .get(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    /// Cached execution, for modification.
    pub fn execution_mut(&mut self, execution_id: &str) -> Result<&mut Execution> {
        self.cache
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })
    }

    pub(crate) fn insert_execution(&mut self, execution: Execution) {
        self.loaded_instances
            .insert(execution.process_instance_id.clone());
        self.cache.executions.insert(execution);
    }

    pub(crate) fn delete_execution(&mut self, execution_id: &str) -> Option<Execution> {
        self.cache.executions.delete(execution_id)
    }

    /// Bump the revision of an execution on commit.
    pub fn force_update_execution(&mut self, execution_id: &str) {
        self.cache.executions.force_update(execution_id);
    }

    /// Ids of the cached children of an execution, ascending.
    pub fn children_of(&self, execution_id: &str) -> Vec<String> {
        self.cache
            .executions
            .values()
            .filter(|e| e.parent_id.as_deref() == Some(execution_id))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Cached executions of a process instance, in id order.
    pub fn executions_of(&self, process_instance_id: &str) -> Vec<&Execution> {
        self.cache
            .executions
            .values()
            .filter(|e| e.process_instance_id == process_instance_id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    pub(crate) fn variable_instance(&self, scope_id: &str, name: &str) -> Option<&VariableInstance> {
        self.cache
            .variables
            .values()
            .find(|v| v.scope_id == scope_id && v.name == name)
    }

    pub(crate) fn variable_instances_of(&self, scope_id: &str) -> Vec<&VariableInstance> {
        self.cache
            .variables
            .values()
            .filter(|v| v.scope_id == scope_id)
            .collect()
    }

    pub(crate) fn variable_mut(&mut self, variable_id: &str) -> Option<&mut VariableInstance> {
        self.cache.variables.get_mut(variable_id)
    }

    pub(crate) fn insert_variable(&mut self, variable: VariableInstance) {
        self.cache.variables.insert(variable);
    }

    pub(crate) fn delete_variable(&mut self, variable_id: &str) -> Option<VariableInstance> {
        self.cache.variables.delete(variable_id)
    }

    pub(crate) fn transient(&self, scope_id: &str, name: &str) -> Option<&VariableValue> {
        self.transient.get(&(scope_id.to_string(), name.to_string()))
    }

    pub(crate) fn set_transient(&mut self, scope_id: &str, name: &str, value: VariableValue) {
        self.transient
            .insert((scope_id.to_string(), name.to_string()), value);
    }

    pub(crate) fn remove_transient(&mut self, scope_id: &str, name: &str) -> Option<VariableValue> {
        self.transient
            .remove(&(scope_id.to_string(), name.to_string()))
    }

    pub(crate) fn transients_of(&self, scope_id: &str) -> Vec<(&str, &VariableValue)> {
        self.transient
            .iter()
            .filter(|((scope, _), _)| scope == scope_id)
            .map(|((_, name), value)| (name.as_str(), value))
            .collect()
    }

    pub(crate) fn clear_transients_of(&mut self, scope_id: &str) {
        self.transient.retain(|(scope, _), _| scope != scope_id);
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Cached job.
    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.cache.jobs.get(job_id)
    }

    /// Cached job, for modification.
    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.cache.jobs.get_mut(job_id)
    }

    /// Add a new job; [`EngineEvent::JobCreated`] is published if the job is
    /// still part of the change set at commit.
    pub fn insert_job(&mut self, job: Job) {
        self.cache.jobs.insert(job);
    }

    /// Delete a job.
    pub fn delete_job(&mut self, job_id: &str) -> Option<Job> {
        self.cache.jobs.delete(job_id)
    }

    /// Ids of cached jobs continuing `execution_id`.
    pub fn jobs_of_execution(&self, execution_id: &str) -> Vec<String> {
        self.cache
            .jobs
            .values()
            .filter(|j| j.execution_id.as_deref() == Some(execution_id))
            .map(|j| j.id.clone())
            .collect()
    }

    /// Ids of cached jobs of a process instance.
    pub fn jobs_of_process_instance(&self, process_instance_id: &str) -> Vec<String> {
        self.cache
            .jobs
            .values()
            .filter(|j| j.process_instance_id.as_deref() == Some(process_instance_id))
            .map(|j| j.id.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Event subscriptions
    // ------------------------------------------------------------------

    pub(crate) fn insert_event_subscription(&mut self, subscription: EventSubscription) {
        self.cache.event_subscriptions.insert(subscription);
    }

    pub(crate) fn delete_event_subscription(&mut self, id: &str) -> Option<EventSubscription> {
        self.cache.event_subscriptions.delete(id)
    }

    /// Ids of cached event subscriptions of `execution_id`.
    pub fn event_subscriptions_of(&self, execution_id: &str) -> Vec<String> {
        self.cache
            .event_subscriptions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .map(|s| s.id.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Agenda and events
    // ------------------------------------------------------------------

    /// The operation agenda.
    pub fn agenda(&mut self) -> &mut Agenda {
        &mut self.agenda
    }

    /// Plan an operation on an execution.
    pub fn plan(&mut self, operation: Operation, execution_id: impl Into<String>) {
        self.agenda.plan_operation(operation, execution_id);
    }

    /// Queue an event for publication after a successful commit.
    pub fn publish(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Run another command inside this unit of work.
    ///
    /// The nested command shares the cache and agenda and commits with the
    /// outermost command.
    pub async fn execute_nested<C: Command>(&mut self, command: &C) -> Result<C::Output> {
        debug!(command = command.name(), "Executing nested command");
        command.execute(self).await
    }

    /// Run planned operations until the agenda is empty.
    pub fn drain_agenda(&mut self) -> Result<()> {
        while let Some(item) = self.agenda.next_operation() {
            operations::execute(self, item.operation, &item.execution_id)?;
        }
        Ok(())
    }

    /// The change set and the events to publish once it is committed, with
    /// one `JobCreated` per inserted job ahead of the command's own events.
    fn into_parts(self) -> (ChangeSet, Vec<EngineEvent>) {
        let changes = self.cache.change_set();
        let mut events: Vec<EngineEvent> = changes
            .jobs
            .iter()
            .filter_map(|change| match change {
                Change::Insert(job) => Some(EngineEvent::JobCreated {
                    job_id: job.id.clone(),
                    job_type: job.job_type.clone(),
                    kind: job.kind,
                }),
                _ => None,
            })
            .collect();
        events.extend(self.events);
        (changes, events)
    }
}

/// Runs commands, each in its own unit of work.
#[derive(Clone, Debug)]
pub struct CommandExecutor {
    services: Arc<EngineServices>,
}

impl CommandExecutor {
    /// Create an executor over the given services.
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    /// Shared engine services.
    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// Run a command, drain its agenda, commit and publish its events.
    #[instrument(skip_all, fields(command = command.name()))]
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output> {
        let mut ctx = CommandContext::new(self.services.clone());

        let output = command.execute(&mut ctx).await?;
        ctx.drain_agenda()?;

        let (changes, events) = ctx.into_parts();
        let jobs_ready = changes.makes_jobs_acquirable();
        if changes.is_empty() {
            debug!("Command produced no changes");
        } else {
            debug!(writes = changes.len(), "Flushing unit of work");
            self.services.persistence.flush(changes).await?;
        }

        self.services.dispatch(events, jobs_ready);
        Ok(output)
    }

    /// Run a command, re-running it in a fresh unit of work when it fails on
    /// an optimistic-lock conflict.
    pub async fn execute_with_retry<C: Command>(
        &self,
        command: &C,
        policy: &RetryPolicy,
    ) -> Result<C::Output> {
        let mut attempt: u32 = 1;
        loop {
            match self.execute(command).await {
                Err(e) if e.is_optimistic_lock() && attempt < policy.max_attempts => {
                    let delay = policy.backoff.delay_for_attempt(attempt);
                    warn!(
                        command = command.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Concurrent modification, retrying command"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
