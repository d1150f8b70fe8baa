// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for procflow-core.
//!
//! This module defines the runtime entities, the change set a unit of work
//! flushes on commit, and the [`Persistence`] gateway with its backends.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Common surface of every persisted runtime entity.
pub trait Entity: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Entity kind, used in optimistic-lock errors.
    const KIND: &'static str;

    /// Primary key.
    fn id(&self) -> &str;

    /// Revision as loaded from storage.
    fn revision(&self) -> i32;
}

// ============================================================================
// Executions
// ============================================================================

/// A node in the process-instance tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Execution {
    /// Unique identifier.
    pub id: String,
    /// Parent execution, `None` for process instances.
    pub parent_id: Option<String>,
    /// Root of the tree this execution belongs to.
    pub process_instance_id: String,
    /// Flow graph being interpreted.
    pub process_definition_id: String,
    /// Activity the execution currently sits at.
    pub activity_id: Option<String>,
    /// Caller-supplied key, only set on process instances.
    pub business_key: Option<String>,
    /// Started and not ended; inactive executions wait for children or a join.
    pub is_active: bool,
    /// Owns its own variable namespace and is the unit of cascade deletion.
    pub is_scope: bool,
    /// One of several parallel siblings under a scope execution.
    pub is_concurrent: bool,
    /// Suspended executions cannot be triggered.
    pub is_suspended: bool,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: Option<String>,
    /// Optimistic-lock revision.
    pub revision: i32,
}

impl Execution {
    /// True for the root of a process-instance tree.
    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

impl Entity for Execution {
    const KIND: &'static str = "execution";

    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> i32 {
        self.revision
    }
}

// ============================================================================
// Variables
// ============================================================================

/// Kind of scope a variable is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ScopeType {
    /// Bound to an execution.
    Execution,
}

impl ScopeType {
    /// Returns the string representation of the scope type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "execution",
        }
    }
}

impl TryFrom<String> for ScopeType {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "execution" => Ok(Self::Execution),
            other => Err(EngineError::Serialization(format!(
                "unknown scope type '{}'",
                other
            ))),
        }
    }
}

/// A typed variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VariableValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Boolean(bool),
    /// 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Double(f64),
    /// Text.
    Text(String),
    /// Arbitrary serialized object.
    Serialized {
        /// Type hint supplied by the writer.
        type_name: String,
        /// JSON representation.
        data: serde_json::Value,
    },
}

impl VariableValue {
    /// Serialize a value into a [`VariableValue::Serialized`].
    pub fn serialized<T: Serialize>(type_name: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::Serialized {
            type_name: type_name.into(),
            data: serde_json::to_value(value)?,
        })
    }

    /// Deserialize the payload of a [`VariableValue::Serialized`].
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Serialized { data, .. } => Ok(serde_json::from_value(data.clone())?),
            other => Err(EngineError::Serialization(format!(
                "variable value {:?} is not a serialized object",
                other
            ))),
        }
    }

    /// Boolean payload, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer payload, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Text payload, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// True for [`VariableValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for VariableValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A named value bound to a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VariableInstance {
    /// Unique identifier.
    pub id: String,
    /// Owning scope (an execution id).
    pub scope_id: String,
    /// Kind of the owning scope.
    #[sqlx(try_from = "String")]
    pub scope_type: ScopeType,
    /// Process instance the scope belongs to, for bulk loading.
    pub process_instance_id: String,
    /// Variable name, unique per scope.
    pub name: String,
    /// Typed value.
    #[sqlx(json)]
    pub value: VariableValue,
    /// Optimistic-lock revision.
    pub revision: i32,
}

impl Entity for VariableInstance {
    const KIND: &'static str = "variable";

    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> i32 {
        self.revision
    }
}

// ============================================================================
// Jobs
// ============================================================================

/// Queue a job currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Waiting for its due date.
    Timer,
    /// Due and eligible for acquisition.
    Ready,
    /// Parked by an operator or a suspended process instance.
    Suspended,
    /// Fetched and completed by an external worker.
    ExternalWorker,
    /// Retries exhausted; needs manual intervention.
    DeadLetter,
}

impl JobKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Ready => "ready",
            Self::Suspended => "suspended",
            Self::ExternalWorker => "external_worker",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Parse a kind from its string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timer" => Some(Self::Timer),
            "ready" => Some(Self::Ready),
            "suspended" => Some(Self::Suspended),
            "external_worker" => Some(Self::ExternalWorker),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Whether a job may move from this kind to `next`.
    ///
    /// Kinds advance `timer -> ready -> (suspended | dead_letter)`; the only
    /// backward moves are retry backoff (`ready -> timer`) and operator
    /// actions out of `suspended` and `dead_letter`.
    pub fn can_transition_to(self, next: JobKind) -> bool {
        use JobKind::*;
        matches!(
            (self, next),
            (Timer, Ready | Suspended | DeadLetter)
                | (Ready, Timer | Suspended | DeadLetter)
                | (ExternalWorker, Suspended | DeadLetter)
                | (Suspended, Ready | Timer | ExternalWorker)
                | (DeadLetter, Ready | Timer | ExternalWorker)
        )
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for JobKind {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
            .ok_or_else(|| EngineError::Serialization(format!("unknown job kind '{}'", value)))
    }
}

/// A persisted, schedulable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Unique identifier.
    pub id: String,
    /// Caller-supplied id used to correlate the job with outside records.
    pub correlation_id: Option<String>,
    /// Queue the job sits in.
    #[sqlx(try_from = "String")]
    pub kind: JobKind,
    /// Handler key looked up in the job handler registry.
    pub job_type: String,
    /// Opaque handler payload.
    pub handler_configuration: Option<String>,
    /// Execution the job continues, if any.
    pub execution_id: Option<String>,
    /// Process instance the job belongs to, if any.
    pub process_instance_id: Option<String>,
    /// Flow graph of the owning process instance.
    pub process_definition_id: Option<String>,
    /// Topic for external-worker jobs.
    pub topic: Option<String>,
    /// Higher priorities are acquired first.
    pub priority: i64,
    /// When a timer becomes due (or an external task fetchable again).
    pub due_date: Option<DateTime<Utc>>,
    /// Worker currently holding the lock.
    pub lock_owner: Option<String>,
    /// When the current lock stops being valid.
    pub lock_expiration_time: Option<DateTime<Utc>>,
    /// Remaining automatic attempts.
    pub retries: i32,
    /// Number of failed attempts so far, drives the retry backoff.
    pub failed_attempts: i32,
    /// Message of the last failure.
    pub exception_message: Option<String>,
    /// Details of the last failure.
    pub exception_stacktrace: Option<String>,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// Optimistic-lock revision.
    pub revision: i32,
}

impl Job {
    /// True when a worker holds a lock that has not expired at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some()
            && self
                .lock_expiration_time
                .map(|expires| expires > now)
                .unwrap_or(false)
    }

    /// Move the job to another queue, enforcing the allowed transitions.
    pub fn transition_to(&mut self, next: JobKind) -> Result<()> {
        if !self.kind.can_transition_to(next) {
            return Err(EngineError::illegal_state(
                &self.id,
                format!("job cannot move from '{}' to '{}'", self.kind, next),
            ));
        }
        self.kind = next;
        Ok(())
    }

    /// Drop the current lock.
    pub fn release_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    /// The queue a job returns to when reactivated or retried.
    ///
    /// External tasks go back to their workers, timers whose due date is still
    /// ahead wait again, everything else is ready.
    pub fn resume_kind(&self, now: DateTime<Utc>) -> JobKind {
        if self.topic.is_some() {
            JobKind::ExternalWorker
        } else if self.due_date.map(|due| due > now).unwrap_or(false) {
            JobKind::Timer
        } else {
            JobKind::Ready
        }
    }
}

impl Entity for Job {
    const KIND: &'static str = "job";

    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> i32 {
        self.revision
    }
}

// ============================================================================
// Event subscriptions
// ============================================================================

/// Kind of event a subscription waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Broadcast signal.
    Signal,
    /// Point-to-point message.
    Message,
}

impl EventType {
    /// Returns the string representation of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Message => "message",
        }
    }
}

impl TryFrom<String> for EventType {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "signal" => Ok(Self::Signal),
            "message" => Ok(Self::Message),
            other => Err(EngineError::Serialization(format!(
                "unknown event type '{}'",
                other
            ))),
        }
    }
}

/// Registration that an event should resume a waiting execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventSubscription {
    /// Unique identifier.
    pub id: String,
    /// Signal or message.
    #[sqlx(try_from = "String")]
    pub event_type: EventType,
    /// Signal or message name.
    pub event_name: String,
    /// Execution to resume.
    pub execution_id: String,
    /// Process instance of the execution.
    pub process_instance_id: String,
    /// Activity the execution waits at.
    pub activity_id: String,
    /// Tenant identifier for multi-tenancy isolation.
    pub tenant_id: Option<String>,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
    /// Optimistic-lock revision.
    pub revision: i32,
}

impl Entity for EventSubscription {
    const KIND: &'static str = "event_subscription";

    fn id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> i32 {
        self.revision
    }
}

// ============================================================================
// Change sets
// ============================================================================

/// One pending write produced by a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    /// New entity, stored with revision 1.
    Insert(T),
    /// Changed entity; applied only if the stored revision still equals
    /// `entity.revision`, which is then incremented.
    Update(T),
    /// Removed entity, conditioned on the loaded revision.
    Delete {
        /// Entity id.
        id: String,
        /// Revision the unit of work loaded.
        revision: i32,
    },
}

/// All writes of one unit of work, applied atomically by [`Persistence::flush`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Execution writes.
    pub executions: Vec<Change<Execution>>,
    /// Variable writes.
    pub variables: Vec<Change<VariableInstance>>,
    /// Job writes.
    pub jobs: Vec<Change<Job>>,
    /// Event subscription writes.
    pub event_subscriptions: Vec<Change<EventSubscription>>,
}

impl ChangeSet {
    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of individual writes.
    pub fn len(&self) -> usize {
        self.executions.len()
            + self.variables.len()
            + self.jobs.len()
            + self.event_subscriptions.len()
    }

    /// Whether committing leaves an unlocked `ready` job behind.
    pub fn makes_jobs_acquirable(&self) -> bool {
        self.jobs.iter().any(|change| match change {
            Change::Insert(job) | Change::Update(job) => {
                job.kind == JobKind::Ready && job.lock_owner.is_none()
            }
            Change::Delete { .. } => false,
        })
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Only jobs in this queue.
    pub kind: Option<JobKind>,
    /// Only jobs of this handler type.
    pub job_type: Option<String>,
    /// Only jobs of this process instance.
    pub process_instance_id: Option<String>,
    /// Only jobs continuing this execution.
    pub execution_id: Option<String>,
    /// Only external-worker jobs on this topic.
    pub topic: Option<String>,
    /// Only jobs due at or before this time.
    pub due_before: Option<DateTime<Utc>>,
    /// Only locked jobs whose lock expired at or before this time.
    pub lock_expired_before: Option<DateTime<Utc>>,
    /// Maximum number of results.
    pub limit: Option<i64>,
}

impl JobQuery {
    /// Jobs of one process instance.
    pub fn for_process_instance(process_instance_id: impl Into<String>) -> Self {
        Self {
            process_instance_id: Some(process_instance_id.into()),
            ..Default::default()
        }
    }

    /// Jobs in one queue.
    pub fn of_kind(kind: JobKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    /// Whether `job` passes this filter (ignores `limit`).
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(kind) = self.kind
            && job.kind != kind
        {
            return false;
        }
        if let Some(ref job_type) = self.job_type
            && &job.job_type != job_type
        {
            return false;
        }
        if let Some(ref pid) = self.process_instance_id
            && job.process_instance_id.as_ref() != Some(pid)
        {
            return false;
        }
        if let Some(ref eid) = self.execution_id
            && job.execution_id.as_ref() != Some(eid)
        {
            return false;
        }
        if let Some(ref topic) = self.topic
            && job.topic.as_ref() != Some(topic)
        {
            return false;
        }
        if let Some(due_before) = self.due_before {
            match job.due_date {
                Some(due) if due <= due_before => {}
                _ => return false,
            }
        }
        if let Some(expired_before) = self.lock_expired_before {
            if job.lock_owner.is_none() {
                return false;
            }
            match job.lock_expiration_time {
                Some(expires) if expires <= expired_before => {}
                _ => return false,
            }
        }
        true
    }
}

/// Filter for listing event subscriptions.
#[derive(Debug, Clone, Default)]
pub struct EventSubscriptionQuery {
    /// Only subscriptions of this type.
    pub event_type: Option<EventType>,
    /// Only subscriptions for this event name.
    pub event_name: Option<String>,
    /// Only subscriptions of this process instance.
    pub process_instance_id: Option<String>,
    /// Only subscriptions of this execution.
    pub execution_id: Option<String>,
}

impl EventSubscriptionQuery {
    /// Whether `subscription` passes this filter.
    pub fn matches(&self, subscription: &EventSubscription) -> bool {
        self.event_type
            .map(|t| t == subscription.event_type)
            .unwrap_or(true)
            && self
                .event_name
                .as_ref()
                .map(|n| n == &subscription.event_name)
                .unwrap_or(true)
            && self
                .process_instance_id
                .as_ref()
                .map(|p| p == &subscription.process_instance_id)
                .unwrap_or(true)
            && self
                .execution_id
                .as_ref()
                .map(|e| e == &subscription.execution_id)
                .unwrap_or(true)
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Persistence gateway consumed by the runtime.
///
/// Reads return owned snapshots; writes only happen through [`flush`], which
/// applies a whole unit of work atomically, and through the compare-and-swap
/// [`lock_job`] used by job acquisition.
///
/// [`flush`]: Persistence::flush
/// [`lock_job`]: Persistence::lock_job
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load one execution.
    async fn find_execution(&self, id: &str) -> Result<Option<Execution>>;

    /// All executions of a process instance, the root included.
    async fn find_executions_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Result<Vec<Execution>>;

    /// Process instances (root executions), optionally of one definition.
    async fn find_process_instances(
        &self,
        process_definition_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Execution>>;

    /// All variables bound to executions of a process instance.
    async fn find_variables_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Result<Vec<VariableInstance>>;

    /// Load one job.
    async fn find_job(&self, id: &str) -> Result<Option<Job>>;

    /// List jobs matching a filter, oldest first.
    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;

    /// Candidates for acquisition: jobs of `kind` that are unlocked or whose
    /// lock expired, that are due at `now`, and that have retries left.
    ///
    /// Ordered by priority (highest first), then due date or creation time.
    async fn find_acquirable_jobs(
        &self,
        kind: JobKind,
        topics: Option<&[String]>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>>;

    /// List event subscriptions matching a filter, oldest first.
    async fn find_event_subscriptions(
        &self,
        query: &EventSubscriptionQuery,
    ) -> Result<Vec<EventSubscription>>;

    /// Compare-and-swap lock of a job.
    ///
    /// Sets the lock owner and expiration and bumps the revision, but only if
    /// the stored revision still equals `expected_revision`. Returns false
    /// when another writer got there first.
    async fn lock_job(
        &self,
        job_id: &str,
        expected_revision: i32,
        lock_owner: &str,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool>;

    /// Apply all writes of a unit of work atomically.
    ///
    /// Fails with [`EngineError::OptimisticLock`] (and applies nothing) if any
    /// update or delete finds a different stored revision, or if an insert
    /// collides with an existing id.
    async fn flush(&self, changes: ChangeSet) -> Result<()>;

    /// Check that the backing store is reachable.
    async fn health_check(&self) -> Result<bool>;
}
