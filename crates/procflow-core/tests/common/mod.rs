// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for procflow-core integration tests.
//!
//! Provides TestEngine: a process engine over a chosen backend, driven by a
//! manual clock so that timers, backoff delays and lock expiry are
//! deterministic.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use procflow_core::clock::ManualClock;
use procflow_core::config::{EngineConfig, JobExecutorConfig};
use procflow_core::context::CommandContext;
use procflow_core::delegate::{ActivityDelegate, DelegateExecution};
use procflow_core::engine::ProcessEngine;
use procflow_core::error::{EngineError, Result};
use procflow_core::jobs::{JobExecutor, JobHandler};
use procflow_core::model::{FlowGraph, InMemoryModelResolver};
use procflow_core::persistence::{
    EventSubscriptionQuery, Execution, InMemoryPersistence, Job, JobQuery, Persistence,
    SqlitePersistence, VariableValue,
};

/// Builds a [`TestEngine`].
pub struct TestEngineBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    graphs: Vec<FlowGraph>,
    delegates: Vec<(String, Arc<dyn ActivityDelegate>)>,
    handlers: Vec<(String, Arc<dyn JobHandler>)>,
    config: EngineConfig,
}

impl TestEngineBuilder {
    /// Deploy a flow graph.
    pub fn graph(mut self, graph: FlowGraph) -> Self {
        self.graphs.push(graph);
        self
    }

    /// Register a service task delegate.
    pub fn delegate(mut self, name: &str, delegate: Arc<dyn ActivityDelegate>) -> Self {
        self.delegates.push((name.to_string(), delegate));
        self
    }

    /// Register a job handler.
    pub fn job_handler(mut self, job_type: &str, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push((job_type.to_string(), handler));
        self
    }

    /// Engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a persistence backend other than the in-memory one.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn build(self) -> TestEngine {
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryPersistence::new()) as Arc<dyn Persistence>);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ));
        let models = Arc::new(InMemoryModelResolver::new());
        for graph in self.graphs {
            models.deploy(graph);
        }

        let mut builder = ProcessEngine::builder()
            .persistence(persistence.clone())
            .model_resolver(models)
            .clock(clock.clone())
            .config(self.config);
        for (name, delegate) in self.delegates {
            builder = builder.delegate(name, delegate);
        }
        for (job_type, handler) in self.handlers {
            builder = builder.job_handler(job_type, handler);
        }

        TestEngine {
            engine: builder.build().expect("Failed to build engine"),
            clock,
            persistence,
        }
    }
}

/// A process engine with a manual clock.
pub struct TestEngine {
    pub engine: ProcessEngine,
    pub clock: Arc<ManualClock>,
    pub persistence: Arc<dyn Persistence>,
}

impl TestEngine {
    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder {
            persistence: None,
            graphs: Vec::new(),
            delegates: Vec::new(),
            handlers: Vec::new(),
            config: EngineConfig::default(),
        }
    }

    /// In-memory engine with `graphs` deployed.
    pub fn with_graphs(graphs: Vec<FlowGraph>) -> Self {
        graphs
            .into_iter()
            .fold(Self::builder(), |builder, graph| builder.graph(graph))
            .build()
    }

    /// A job executor for `worker_id`, never spawned.
    pub fn executor(&self, worker_id: &str) -> JobExecutor {
        self.engine.job_executor(JobExecutorConfig {
            worker_id: worker_id.to_string(),
            worker_count: 1,
            acquire_batch_size: 10,
            ..Default::default()
        })
    }

    /// Advance the clock.
    pub fn advance(&self, by: Duration) {
        self.clock
            .advance(chrono::Duration::from_std(by).expect("duration out of range"));
    }

    /// Promote due timers and execute ready jobs until none are left.
    /// Returns the number of jobs executed.
    pub async fn run_jobs(&self) -> usize {
        let executor = self.executor("test-worker");
        let mut executed = 0;
        // Bounded so that a job that keeps re-creating itself fails the test
        // instead of hanging it.
        for _ in 0..50 {
            executor
                .promote_due_timers()
                .await
                .expect("Failed to promote timers");
            let acquired = executor
                .acquire_and_execute()
                .await
                .expect("Failed to acquire jobs");
            if acquired == 0 {
                return executed;
            }
            executed += acquired;
        }
        panic!("jobs did not settle after 50 rounds");
    }

    pub async fn start(&self, definition_id: &str) -> String {
        self.engine
            .start_process_instance(definition_id, None, BTreeMap::new())
            .await
            .expect("Failed to start process instance")
    }

    pub async fn executions(&self, process_instance_id: &str) -> Vec<Execution> {
        self.engine
            .executions(process_instance_id)
            .await
            .expect("Failed to query executions")
    }

    /// Active executions of a process instance waiting at `activity_id`.
    pub async fn executions_at(&self, process_instance_id: &str, activity_id: &str) -> Vec<Execution> {
        self.executions(process_instance_id)
            .await
            .into_iter()
            .filter(|e| e.is_active && e.activity_id.as_deref() == Some(activity_id))
            .collect()
    }

    /// The single execution waiting at `activity_id`.
    pub async fn execution_at(&self, process_instance_id: &str, activity_id: &str) -> Execution {
        let mut found = self.executions_at(process_instance_id, activity_id).await;
        assert_eq!(
            found.len(),
            1,
            "expected one execution at '{}', found {}",
            activity_id,
            found.len()
        );
        found.remove(0)
    }

    pub async fn is_ended(&self, process_instance_id: &str) -> bool {
        self.executions(process_instance_id).await.is_empty()
    }

    pub async fn jobs(&self, query: JobQuery) -> Vec<Job> {
        self.engine.jobs(&query).await.expect("Failed to query jobs")
    }

    pub async fn jobs_of(&self, process_instance_id: &str) -> Vec<Job> {
        self.jobs(JobQuery::for_process_instance(process_instance_id))
            .await
    }

    pub async fn subscription_count(&self, process_instance_id: &str) -> usize {
        self.engine
            .event_subscriptions(&EventSubscriptionQuery {
                process_instance_id: Some(process_instance_id.to_string()),
                ..Default::default()
            })
            .await
            .expect("Failed to query subscriptions")
            .len()
    }
}

/// Fresh SQLite database in a temporary directory. Keep the directory alive
/// for the duration of the test.
pub async fn sqlite() -> (Arc<SqlitePersistence>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let persistence = SqlitePersistence::from_path(dir.path().join("procflow.db"))
        .await
        .expect("Failed to open SQLite database");
    (Arc::new(persistence), dir)
}

/// Build a variable map from name/value pairs.
pub fn vars<const N: usize>(pairs: [(&str, VariableValue); N]) -> BTreeMap<String, VariableValue> {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Service task delegate that counts its calls, optionally writes a variable
/// and fails while told to.
#[derive(Default)]
pub struct CountingDelegate {
    calls: AtomicUsize,
    failing: AtomicBool,
    writes: Option<(String, VariableValue)>,
}

impl CountingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A delegate that fails until [`set_failing`](Self::set_failing) is
    /// called with false.
    pub fn failing() -> Arc<Self> {
        let delegate = Self::default();
        delegate.failing.store(true, Ordering::SeqCst);
        Arc::new(delegate)
    }

    /// A delegate that writes `name` (non-local) before finishing or failing.
    pub fn writing(name: &str, value: impl Into<VariableValue>) -> Arc<Self> {
        Arc::new(Self {
            writes: Some((name.to_string(), value.into())),
            ..Default::default()
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ActivityDelegate for CountingDelegate {
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((name, value)) = &self.writes {
            execution.set_variable(name, value.clone())?;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::JobExecutionFailure {
                job_id: execution.execution_id().to_string(),
                message: "delegate failed".to_string(),
            });
        }
        Ok(())
    }
}

/// Job handler that only counts its calls.
#[derive(Default)]
pub struct CountingHandler {
    calls: AtomicUsize,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn execute(&self, _job: &Job, _ctx: &mut CommandContext) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
