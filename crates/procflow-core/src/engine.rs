// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine services and the [`ProcessEngine`] facade.
//!
//! [`EngineServices`] bundles everything a unit of work needs: persistence,
//! the model resolver, the clock, the handler and delegate registries and the
//! configuration. [`ProcessEngine`] wraps a [`CommandExecutor`] over those
//! services and exposes every operation as a method.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::commands::{
    CorrelateMessageCommand, DeleteProcessInstanceCommand, GetVariableCommand,
    GetVariablesCommand, RemoveVariableCommand, SetProcessInstanceSuspensionCommand,
    SetVariablesCommand, SignalEventReceivedCommand, StartProcessInstanceCommand, TriggerCommand,
};
use crate::config::{EngineConfig, JobExecutorConfig, RetryPolicy};
use crate::context::{Command, CommandExecutor};
use crate::delegate::{ActivityDelegate, DelegateRegistry};
use crate::error::{EngineError, Result};
use crate::jobs::external::ReadTaskVariablesCommand;
use crate::jobs::{
    ActivateJobCommand, CompleteExternalTaskCommand, DeleteJobCommand,
    ExtendExternalTaskLockCommand, ExternalTaskFailureCommand, JobAcquisition, JobExecutor,
    JobHandler, JobHandlerRegistry, LockedExternalTask, NewJob, RetryDeadLetterJobCommand,
    ScheduleJobCommand, SetJobRetriesCommand, SuspendJobCommand, UnlockExternalTaskCommand,
};
use crate::model::{InMemoryModelResolver, ModelResolver};
use crate::persistence::{
    EventSubscription, EventSubscriptionQuery, Execution, Job, JobKind, JobQuery, Persistence,
    VariableValue,
};

/// Capacity of the engine event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notification published after a unit of work commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A process instance was started.
    ProcessInstanceStarted {
        /// Process instance id.
        process_instance_id: String,
        /// Flow graph id.
        process_definition_id: String,
        /// Business key.
        business_key: Option<String>,
    },
    /// A process instance reached its end.
    ProcessInstanceCompleted {
        /// Process instance id.
        process_instance_id: String,
        /// Flow graph id.
        process_definition_id: String,
        /// Business key.
        business_key: Option<String>,
    },
    /// A process instance was deleted.
    ProcessInstanceDeleted {
        /// Process instance id.
        process_instance_id: String,
        /// Reason given by the caller.
        reason: Option<String>,
    },
    /// A job was created.
    JobCreated {
        /// Job id.
        job_id: String,
        /// Handler type.
        job_type: String,
        /// Initial kind.
        kind: JobKind,
    },
    /// A job ran out of retries.
    JobDeadLettered {
        /// Job id.
        job_id: String,
        /// Handler type.
        job_type: String,
        /// Last failure.
        exception_message: Option<String>,
    },
}

/// Services shared by every unit of work.
pub struct EngineServices {
    /// Persistence gateway.
    pub persistence: Arc<dyn Persistence>,
    /// Flow graph lookup.
    pub models: Arc<dyn ModelResolver>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Job handlers by type.
    pub job_handlers: JobHandlerRegistry,
    /// Service task delegates by name.
    pub delegates: DelegateRegistry,
    /// Engine configuration.
    pub config: EngineConfig,
    /// Committed engine events.
    pub events: broadcast::Sender<EngineEvent>,
    /// Woken when a commit creates a ready job.
    pub job_available: Arc<Notify>,
}

impl EngineServices {
    /// Subscribe to committed engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Publish the events of a committed unit of work and wake idle job
    /// workers when it left jobs ready for acquisition.
    pub(crate) fn dispatch(&self, events: Vec<EngineEvent>, jobs_ready: bool) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        if jobs_ready {
            self.job_available.notify_waiters();
        }
    }
}

impl std::fmt::Debug for EngineServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineServices")
            .field("persistence", &"...")
            .field("models", &"...")
            .field("job_handlers", &self.job_handlers)
            .field("delegates", &self.delegates)
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for a [`ProcessEngine`].
pub struct ProcessEngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    models: Option<Arc<dyn ModelResolver>>,
    clock: Arc<dyn Clock>,
    job_handlers: JobHandlerRegistry,
    delegates: DelegateRegistry,
    config: EngineConfig,
}

impl std::fmt::Debug for ProcessEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEngineBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("models", &self.models.as_ref().map(|_| "..."))
            .field("job_handlers", &self.job_handlers)
            .field("delegates", &self.delegates)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            models: None,
            clock: Arc::new(SystemClock),
            job_handlers: JobHandlerRegistry::with_builtin_handlers(),
            delegates: DelegateRegistry::new(),
            config: EngineConfig::default(),
        }
    }
}

impl ProcessEngineBuilder {
    /// Create a builder with the built-in job handlers and the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the model resolver. Defaults to an empty [`InMemoryModelResolver`].
    pub fn model_resolver(mut self, models: Arc<dyn ModelResolver>) -> Self {
        self.models = Some(models);
        self
    }

    /// Set the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a job handler.
    pub fn job_handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.job_handlers.register(job_type, handler);
        self
    }

    /// Register a service task delegate.
    pub fn delegate(mut self, name: impl Into<String>, delegate: Arc<dyn ActivityDelegate>) -> Self {
        self.delegates.register(name, delegate);
        self
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<ProcessEngine> {
        let persistence = self
            .persistence
            .ok_or_else(|| EngineError::validation("persistence", "is required"))?;
        if self.config.default_retries < 1 {
            return Err(EngineError::validation("default_retries", "must be positive"));
        }
        let models = self
            .models
            .unwrap_or_else(|| Arc::new(InMemoryModelResolver::new()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let services = Arc::new(EngineServices {
            persistence,
            models,
            clock: self.clock,
            job_handlers: self.job_handlers,
            delegates: self.delegates,
            config: self.config,
            events,
            job_available: Arc::new(Notify::new()),
        });
        Ok(ProcessEngine::new(services))
    }
}

/// Entry point for embedding the engine.
#[derive(Clone, Debug)]
pub struct ProcessEngine {
    services: Arc<EngineServices>,
    executor: CommandExecutor,
}

impl ProcessEngine {
    /// Create a builder.
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::new()
    }

    /// Create an engine over existing services.
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self {
            executor: CommandExecutor::new(services.clone()),
            services,
        }
    }

    /// Shared services.
    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    /// The command executor.
    pub fn command_executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Subscribe to committed engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.services.subscribe()
    }

    /// Create a job executor for this engine.
    pub fn job_executor(&self, config: JobExecutorConfig) -> JobExecutor {
        JobExecutor::new(self.services.clone(), config)
    }

    /// Run a command in its own unit of work.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output> {
        self.executor.execute(command).await
    }

    /// Run a command, retrying optimistic-lock conflicts.
    pub async fn execute_with_retry<C: Command>(
        &self,
        command: &C,
        policy: &RetryPolicy,
    ) -> Result<C::Output> {
        self.executor.execute_with_retry(command, policy).await
    }

    /// Check that persistence is reachable.
    pub async fn health_check(&self) -> Result<bool> {
        self.services.persistence.health_check().await
    }

    // ------------------------------------------------------------------
    // Process instances
    // ------------------------------------------------------------------

    /// Start a process instance. Returns its id.
    pub async fn start_process_instance(
        &self,
        definition_id: &str,
        business_key: Option<&str>,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<String> {
        self.execute(&StartProcessInstanceCommand {
            definition_id: definition_id.to_string(),
            business_key: business_key.map(str::to_string),
            tenant_id: None,
            variables,
        })
        .await
    }

    /// Complete the user task `execution_id` waits in.
    pub async fn trigger(
        &self,
        execution_id: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<()> {
        self.execute(&TriggerCommand {
            execution_id: execution_id.to_string(),
            variables,
        })
        .await
    }

    /// Broadcast a signal. Returns the number of executions resumed.
    pub async fn signal(
        &self,
        signal_name: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<usize> {
        self.execute(&SignalEventReceivedCommand {
            signal_name: signal_name.to_string(),
            process_instance_id: None,
            variables,
        })
        .await
    }

    /// Deliver a message to the one execution waiting for it.
    pub async fn correlate_message(
        &self,
        message_name: &str,
        business_key: Option<&str>,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<String> {
        self.execute(&CorrelateMessageCommand {
            message_name: message_name.to_string(),
            process_instance_id: None,
            business_key: business_key.map(str::to_string),
            variables,
        })
        .await
    }

    /// Delete a process instance.
    pub async fn delete_process_instance(
        &self,
        process_instance_id: &str,
        reason: Option<&str>,
    ) -> Result<()> {
        self.execute(&DeleteProcessInstanceCommand {
            process_instance_id: process_instance_id.to_string(),
            reason: reason.map(str::to_string),
        })
        .await
    }

    /// Suspend a process instance with its jobs.
    pub async fn suspend_process_instance(&self, process_instance_id: &str) -> Result<()> {
        self.execute(&SetProcessInstanceSuspensionCommand {
            process_instance_id: process_instance_id.to_string(),
            suspended: true,
        })
        .await
    }

    /// Activate a suspended process instance with its jobs.
    pub async fn activate_process_instance(&self, process_instance_id: &str) -> Result<()> {
        self.execute(&SetProcessInstanceSuspensionCommand {
            process_instance_id: process_instance_id.to_string(),
            suspended: false,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Variable visible from an execution.
    pub async fn variable(&self, execution_id: &str, name: &str) -> Result<Option<VariableValue>> {
        self.execute(&GetVariableCommand {
            execution_id: execution_id.to_string(),
            name: name.to_string(),
            local: false,
        })
        .await
    }

    /// Variable of an execution's own namespace.
    pub async fn variable_local(
        &self,
        execution_id: &str,
        name: &str,
    ) -> Result<Option<VariableValue>> {
        self.execute(&GetVariableCommand {
            execution_id: execution_id.to_string(),
            name: name.to_string(),
            local: true,
        })
        .await
    }

    /// Every variable visible from an execution.
    pub async fn variables(&self, execution_id: &str) -> Result<BTreeMap<String, VariableValue>> {
        self.execute(&GetVariablesCommand {
            execution_id: execution_id.to_string(),
            local: false,
        })
        .await
    }

    /// Non-local write of one variable.
    pub async fn set_variable(
        &self,
        execution_id: &str,
        name: &str,
        value: impl Into<VariableValue>,
    ) -> Result<()> {
        self.set_variables(execution_id, single(name, value.into()), false)
            .await
    }

    /// Local write of one variable.
    pub async fn set_variable_local(
        &self,
        execution_id: &str,
        name: &str,
        value: impl Into<VariableValue>,
    ) -> Result<()> {
        self.set_variables(execution_id, single(name, value.into()), true)
            .await
    }

    /// Write several variables, locally or non-locally.
    pub async fn set_variables(
        &self,
        execution_id: &str,
        variables: BTreeMap<String, VariableValue>,
        local: bool,
    ) -> Result<()> {
        self.execute(&SetVariablesCommand {
            execution_id: execution_id.to_string(),
            variables,
            local,
        })
        .await
    }

    /// Remove a variable from an execution's own namespace.
    pub async fn remove_variable(&self, execution_id: &str, name: &str) -> Result<bool> {
        self.execute(&RemoveVariableCommand {
            execution_id: execution_id.to_string(),
            name: name.to_string(),
        })
        .await
    }

    // ------------------------------------------------------------------
    // External tasks
    // ------------------------------------------------------------------

    /// Lock up to `max_tasks` external tasks on `topics` for `worker_id`.
    pub async fn fetch_and_lock(
        &self,
        worker_id: &str,
        topics: &[String],
        max_tasks: usize,
        lock_duration: Duration,
    ) -> Result<Vec<LockedExternalTask>> {
        let acquisition = JobAcquisition::new(&self.services);
        let jobs = acquisition
            .acquire_external(worker_id, topics, max_tasks, lock_duration)
            .await?;

        let mut tasks = Vec::with_capacity(jobs.len());
        for job in jobs {
            let variables = match job.execution_id.as_deref() {
                Some(execution_id) => {
                    self.execute(&ReadTaskVariablesCommand {
                        execution_id: execution_id.to_string(),
                    })
                    .await?
                }
                None => BTreeMap::new(),
            };
            tasks.push(LockedExternalTask::from_job(&job, variables)?);
        }
        debug!(worker_id, fetched = tasks.len(), "Fetched external tasks");
        Ok(tasks)
    }

    /// Complete an external task.
    pub async fn complete_external_task(
        &self,
        task_id: &str,
        worker_id: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<()> {
        self.execute(&CompleteExternalTaskCommand {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            variables,
        })
        .await
    }

    /// Report an external task failure. Returns the task's new kind.
    pub async fn handle_external_task_failure(
        &self,
        task_id: &str,
        worker_id: &str,
        error_message: &str,
        retries: i32,
        retry_timeout: Duration,
    ) -> Result<JobKind> {
        self.execute(&ExternalTaskFailureCommand {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            error_message: error_message.to_string(),
            error_details: None,
            retries,
            retry_timeout,
        })
        .await
    }

    /// Extend an external task lock. Returns the new expiration.
    pub async fn extend_external_task_lock(
        &self,
        task_id: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<DateTime<Utc>> {
        self.execute(&ExtendExternalTaskLockCommand {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            lock_duration,
        })
        .await
    }

    /// Release an external task lock.
    pub async fn unlock_external_task(&self, task_id: &str) -> Result<()> {
        self.execute(&UnlockExternalTaskCommand {
            task_id: task_id.to_string(),
        })
        .await
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Schedule a job. Returns its id.
    pub async fn schedule_job(&self, job: NewJob) -> Result<String> {
        self.execute(&ScheduleJobCommand { job }).await
    }

    /// Set a job's retries.
    pub async fn set_job_retries(&self, job_id: &str, retries: i32) -> Result<()> {
        self.execute(&SetJobRetriesCommand {
            job_id: job_id.to_string(),
            retries,
        })
        .await
    }

    /// Return a dead-lettered job to its queue.
    pub async fn retry_dead_letter_job(&self, job_id: &str, retries: Option<i32>) -> Result<JobKind> {
        self.execute(&RetryDeadLetterJobCommand {
            job_id: job_id.to_string(),
            retries,
        })
        .await
    }

    /// Suspend a job.
    pub async fn suspend_job(&self, job_id: &str) -> Result<()> {
        self.execute(&SuspendJobCommand {
            job_id: job_id.to_string(),
        })
        .await
    }

    /// Activate a suspended job.
    pub async fn activate_job(&self, job_id: &str) -> Result<JobKind> {
        self.execute(&ActivateJobCommand {
            job_id: job_id.to_string(),
        })
        .await
    }

    /// Delete a job.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.execute(&DeleteJobCommand {
            job_id: job_id.to_string(),
        })
        .await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// One execution.
    pub async fn execution(&self, execution_id: &str) -> Result<Option<Execution>> {
        self.services.persistence.find_execution(execution_id).await
    }

    /// All executions of a process instance.
    pub async fn executions(&self, process_instance_id: &str) -> Result<Vec<Execution>> {
        self.services
            .persistence
            .find_executions_by_process_instance(process_instance_id)
            .await
    }

    /// Running process instances, optionally of one definition.
    pub async fn process_instances(
        &self,
        definition_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Execution>> {
        self.services
            .persistence
            .find_process_instances(definition_id, limit)
            .await
    }

    /// One job.
    pub async fn job(&self, job_id: &str) -> Result<Option<Job>> {
        self.services.persistence.find_job(job_id).await
    }

    /// Jobs matching a filter.
    pub async fn jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        self.services.persistence.find_jobs(query).await
    }

    /// Event subscriptions matching a filter.
    pub async fn event_subscriptions(
        &self,
        query: &EventSubscriptionQuery,
    ) -> Result<Vec<EventSubscription>> {
        self.services.persistence.find_event_subscriptions(query).await
    }
}

fn single(name: &str, value: VariableValue) -> BTreeMap<String, VariableValue> {
    BTreeMap::from([(name.to_string(), value)])
}
