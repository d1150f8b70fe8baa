// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixtures shared by the unit tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::context::CommandContext;
use crate::delegate::DelegateRegistry;
use crate::engine::EngineServices;
use crate::jobs::JobHandlerRegistry;
use crate::model::{FlowGraph, InMemoryModelResolver};
use crate::persistence::{Job, JobKind, Persistence};

pub(crate) fn services_with(
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
) -> Arc<EngineServices> {
    services_with_handlers(persistence, clock, JobHandlerRegistry::with_builtin_handlers())
}

pub(crate) fn services_with_handlers(
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    job_handlers: JobHandlerRegistry,
) -> Arc<EngineServices> {
    build_services(
        persistence,
        Arc::new(InMemoryModelResolver::new()),
        clock,
        job_handlers,
    )
}

/// Services with `graphs` deployed.
pub(crate) fn services_with_graphs(
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    graphs: Vec<FlowGraph>,
) -> Arc<EngineServices> {
    let models = Arc::new(InMemoryModelResolver::new());
    for graph in graphs {
        models.deploy(graph);
    }
    build_services(
        persistence,
        models,
        clock,
        JobHandlerRegistry::with_builtin_handlers(),
    )
}

fn build_services(
    persistence: Arc<dyn Persistence>,
    models: Arc<InMemoryModelResolver>,
    clock: Arc<dyn Clock>,
    job_handlers: JobHandlerRegistry,
) -> Arc<EngineServices> {
    let (events, _) = broadcast::channel(64);
    Arc::new(EngineServices {
        persistence,
        models,
        clock,
        job_handlers,
        delegates: DelegateRegistry::new(),
        config: EngineConfig::default(),
        events,
        job_available: Arc::new(Notify::new()),
    })
}

/// A fresh unit of work over `services`.
pub(crate) fn context(services: Arc<EngineServices>) -> CommandContext {
    CommandContext::new(services)
}

pub(crate) fn sample_job(id: &str, kind: JobKind, now: DateTime<Utc>) -> Job {
    Job {
        id: id.to_string(),
        correlation_id: None,
        kind,
        job_type: "test-job".to_string(),
        handler_configuration: None,
        execution_id: None,
        process_instance_id: None,
        process_definition_id: None,
        topic: None,
        priority: 0,
        due_date: None,
        lock_owner: None,
        lock_expiration_time: None,
        retries: 3,
        failed_attempts: 0,
        exception_message: None,
        exception_stacktrace: None,
        tenant_id: None,
        created_at: now,
        revision: 1,
    }
}
