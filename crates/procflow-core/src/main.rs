// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! procflow worker
//!
//! Standalone job executor:
//! - deploys the JSON flow graphs found in the definitions directory
//! - opens (and migrates) the SQLite database
//! - acquires and executes jobs until interrupted
//!
//! Service task delegates are application code, so only flow graphs without
//! service tasks (or with delegates registered by an embedding application)
//! can progress here.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use procflow_core::config::Config;
use procflow_core::engine::ProcessEngine;
use procflow_core::model::InMemoryModelResolver;
use procflow_core::persistence::SqlitePersistence;
use procflow_core::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("procflow_core=info".parse()?),
        )
        .init();

    info!("Starting procflow worker");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database_url = %config.database_url,
        definitions_dir = %config.definitions_dir.display(),
        worker_id = %config.executor.worker_id,
        workers = config.executor.worker_count,
        "Configuration loaded"
    );

    // Deploy flow graphs
    let models = Arc::new(InMemoryModelResolver::new());
    if config.definitions_dir.is_dir() {
        let deployed = models.load_dir(&config.definitions_dir)?;
        info!(deployed, "Flow graphs deployed");
    } else {
        warn!(
            definitions_dir = %config.definitions_dir.display(),
            "Definitions directory not found, no flow graphs deployed"
        );
    }

    // Connect to database (runs migrations)
    info!("Connecting to database...");
    let persistence = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    info!("Database connection established");

    let engine = ProcessEngine::builder()
        .persistence(persistence.clone())
        .model_resolver(models)
        .config(config.engine.clone())
        .build()?;

    let runtime = EngineRuntime::builder()
        .engine(engine)
        .executor_config(config.executor.clone())
        .build()?
        .start()
        .await?;

    info!("procflow worker initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    persistence.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
