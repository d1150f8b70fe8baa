// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime.
//!
//! [`EngineRuntime`] runs a [`JobExecutor`] for a [`ProcessEngine`] inside an
//! existing tokio application instead of the standalone worker binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use procflow_core::engine::ProcessEngine;
//! use procflow_core::persistence::SqlitePersistence;
//! use procflow_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::connect("sqlite://procflow.db").await?);
//!     let engine = ProcessEngine::builder().persistence(persistence).build()?;
//!
//!     let runtime = EngineRuntime::builder()
//!         .engine(engine)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... start process instances through runtime.engine() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::JobExecutorConfig;
use crate::engine::ProcessEngine;

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    engine: Option<ProcessEngine>,
    executor: JobExecutorConfig,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("engine", &self.engine.as_ref().map(|_| "..."))
            .field("executor", &self.executor)
            .finish()
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default executor settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine whose jobs are executed (required).
    pub fn engine(mut self, engine: ProcessEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the job executor configuration.
    pub fn executor_config(mut self, config: JobExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine is required"))?;
        if self.executor.worker_count == 0 {
            anyhow::bail!("worker_count must be at least 1");
        }
        if self.executor.acquire_batch_size == 0 {
            anyhow::bail!("acquire_batch_size must be at least 1");
        }

        Ok(EngineRuntimeConfig {
            engine,
            executor: self.executor,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    engine: ProcessEngine,
    executor: JobExecutorConfig,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("engine", &"...")
            .field("executor", &self.executor)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the job executor loops.
    pub async fn start(self) -> Result<EngineRuntime> {
        if !self.engine.health_check().await? {
            anyhow::bail!("persistence health check failed");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_id = self.executor.worker_id.clone();
        let executor = Arc::new(self.engine.job_executor(self.executor));
        let handles = executor.spawn(shutdown_rx);

        info!(worker_id = %worker_id, "EngineRuntime started");

        Ok(EngineRuntime {
            handles,
            shutdown_tx,
            engine: self.engine,
            worker_id,
        })
    }
}

/// A running job executor embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    engine: ProcessEngine,
    worker_id: String,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The engine served by this runtime.
    pub fn engine(&self) -> &ProcessEngine {
        &self.engine
    }

    /// Lock owner written on jobs acquired by this runtime.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Gracefully shut down the runtime.
    ///
    /// Workers finish the job they are executing, then every loop exits.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        let mut panicked = 0;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("EngineRuntime task panicked: {}", e);
                panicked += 1;
            }
        }
        if panicked > 0 {
            anyhow::bail!("{} executor task(s) panicked", panicked);
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if every executor loop is still running.
    pub fn is_running(&self) -> bool {
        self.handles.iter().all(|handle| !handle.is_finished())
    }
}
