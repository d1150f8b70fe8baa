// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! procflow core - process execution runtime
//!
//! This crate executes process definitions (flow graphs of activities and
//! sequence flows) as trees of executions, persisting all state so that
//! work survives crashes and runs across several worker processes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 ProcessEngine / EngineRuntime (callers)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ Command
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           CommandExecutor                               │
//! │   CommandContext: entity cache │ agenda │ transient vars │ events       │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │ drain agenda                                 │ flush
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │ operations / tree /   │                    │   Persistence (SQLite or    │
//! │ variables             │                    │   in-memory)                │
//! └───────────────────────┘                    └─────────────────────────────┘
//!                                                          ▲
//!                                                          │ acquire (CAS)
//!                                              ┌─────────────────────────────┐
//!                                              │  JobExecutor (workers,      │
//!                                              │  timers, lock reclamation)  │
//!                                              └─────────────────────────────┘
//! ```
//!
//! # Units of work
//!
//! Every state change is a [`context::Command`] executed by a
//! [`context::CommandExecutor`]:
//!
//! 1. The command body loads entities into the context cache and plans
//!    operations on the agenda.
//! 2. The executor drains the agenda; operations may plan more operations.
//! 3. The change set is flushed atomically. Updates and deletes are
//!    conditioned on the revision the unit of work loaded, so a concurrent
//!    writer makes the flush fail with an optimistic-lock error and nothing
//!    is written.
//! 4. Engine events are published only after the flush succeeded.
//!
//! # Job State Machine
//!
//! ```text
//!        due date passed
//!   ┌───────┐ ───────────► ┌───────┐  acquired + executed  ┌──────────┐
//!   │ TIMER │              │ READY │ ────────────────────► │ (delete) │
//!   └───────┘ ◄─────────── └───────┘                       └──────────┘
//!       failed, retries left    │
//!                               │ failed, no retries left
//!                               ▼
//!                        ┌─────────────┐
//!                        │ DEAD_LETTER │
//!                        └─────────────┘
//! ```
//!
//! Jobs of a suspended process instance move to `SUSPENDED` and are never
//! acquired; external tasks live in `EXTERNAL_WORKER` until a worker
//! completes them.
//!
//! # Configuration
//!
//! The standalone worker is configured from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PROCFLOW_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `PROCFLOW_DEFINITIONS_DIR` | No | `definitions` | JSON flow graphs deployed at startup |
//! | `PROCFLOW_WORKER_ID` | No | `worker-<uuid>` | Lock owner name |
//! | `PROCFLOW_WORKER_COUNT` | No | `4` | Concurrent worker tasks |
//! | `PROCFLOW_ACQUIRE_BATCH_SIZE` | No | `3` | Jobs locked per acquisition |
//! | `PROCFLOW_POLL_INTERVAL_MS` | No | `1000` | Idle poll interval |
//! | `PROCFLOW_LOCK_DURATION_SECS` | No | `300` | Job lock duration |
//! | `PROCFLOW_DEFAULT_RETRIES` | No | `3` | Retries of new jobs |
//! | `PROCFLOW_RETRY_DELAY_MS` | No | `10000` | Base retry delay |
//! | `PROCFLOW_RETRY_STRATEGY` | No | `fixed` | `fixed` or `exponential` |
//!
//! # Modules
//!
//! - [`context`]: units of work and the command executor
//! - [`agenda`]: FIFO of planned operations
//! - [`operations`]: the execution state machine
//! - [`tree`]: execution tree edits (fork, join, scope completion, cascades)
//! - [`variables`]: hierarchical variable scopes
//! - [`jobs`]: durable jobs, acquisition and the job executor
//! - [`persistence`]: entities and the SQLite / in-memory gateways

#![deny(missing_docs)]

/// Operation agenda.
pub mod agenda;

/// Time source.
pub mod clock;

/// Process instance and variable commands.
pub mod commands;

/// Engine and job executor configuration.
pub mod config;

/// Units of work and the command executor.
pub mod context;

/// Service task delegates.
pub mod delegate;

/// Engine services, events and the process engine facade.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Durable jobs, acquisition and the job executor.
pub mod jobs;

/// Flow graphs and model resolution.
pub mod model;

/// Execution state machine operations.
pub mod operations;

/// Persistence layer for executions, variables, jobs and event subscriptions.
pub mod persistence;

/// Embeddable job executor runtime.
pub mod runtime;

/// Execution tree edits.
pub mod tree;

/// Hierarchical variable scopes.
pub mod variables;

#[cfg(test)]
mod test_support;

pub use engine::{EngineEvent, ProcessEngine};
pub use error::{EngineError, Result};
