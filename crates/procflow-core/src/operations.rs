// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations planned on the agenda and their dispatch.
//!
//! Each operation moves one execution a single step through the flow graph.
//! Wait states simply plan nothing; the execution is resumed later by a
//! command (trigger, signal, message, external task) or a job.

use tracing::debug;

use crate::context::CommandContext;
use crate::delegate::DelegateExecution;
use crate::error::{EngineError, Result};
use crate::jobs::{self, NewJob};
use crate::model::{Activity, ActivityKind, FlowGraph};
use crate::persistence::{EventSubscription, EventType, Execution, JobKind};
use crate::tree;
use crate::variables;

/// One step of the execution state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Move the execution onto an activity. Honors `async_before`.
    StartActivity {
        /// Activity to enter.
        activity_id: String,
    },
    /// Run the behaviour of the execution's current activity.
    ExecuteActivity,
    /// Leave the current activity along its outgoing flows. Honors
    /// `async_after` unless `skip_async_after` is set.
    TakeOutgoingFlows {
        /// The async-after continuation already happened.
        skip_async_after: bool,
    },
    /// End the execution at its current activity.
    EndExecution,
}

/// Run one operation.
pub fn execute(ctx: &mut CommandContext, operation: Operation, execution_id: &str) -> Result<()> {
    let execution = ctx.execution(execution_id)?.clone();
    if execution.is_suspended {
        return Err(EngineError::illegal_state(
            execution_id,
            "execution is suspended",
        ));
    }
    let graph = ctx.graph(&execution.process_definition_id)?;

    debug!(execution_id, operation = ?operation, "Executing operation");

    match operation {
        Operation::StartActivity { activity_id } => {
            start_activity(ctx, &graph, &execution, &activity_id)
        }
        Operation::ExecuteActivity => execute_activity(ctx, &graph, &execution),
        Operation::TakeOutgoingFlows { skip_async_after } => {
            take_outgoing_flows(ctx, &graph, &execution, skip_async_after)
        }
        Operation::EndExecution => tree::end_execution(ctx, execution_id),
    }
}

fn current_activity<'g>(graph: &'g FlowGraph, execution: &Execution) -> Result<&'g Activity> {
    let activity_id = execution.activity_id.as_deref().ok_or_else(|| {
        EngineError::illegal_state(&execution.id, "execution is not at an activity")
    })?;
    graph.activity(activity_id)
}

fn start_activity(
    ctx: &mut CommandContext,
    graph: &FlowGraph,
    execution: &Execution,
    activity_id: &str,
) -> Result<()> {
    let activity = graph.activity(activity_id)?;
    {
        let current = ctx.execution_mut(&execution.id)?;
        current.activity_id = Some(activity_id.to_string());
        current.is_active = true;
    }

    if activity.async_before {
        jobs::create_async_continuation(ctx, execution, jobs::ASYNC_BEFORE)?;
        return Ok(());
    }

    ctx.plan(Operation::ExecuteActivity, execution.id.clone());
    Ok(())
}

fn execute_activity(
    ctx: &mut CommandContext,
    graph: &FlowGraph,
    execution: &Execution,
) -> Result<()> {
    let activity = current_activity(graph, execution)?;
    let id = execution.id.clone();
    let leave = Operation::TakeOutgoingFlows {
        skip_async_after: false,
    };

    match &activity.kind {
        ActivityKind::StartEvent | ActivityKind::Task | ActivityKind::ExclusiveGateway { .. } => {
            ctx.plan(leave, id);
        }
        ActivityKind::EndEvent => ctx.plan(Operation::EndExecution, id),
        ActivityKind::ServiceTask { delegate } => {
            let delegate = ctx.delegate(delegate)?;
            let mut delegate_execution = DelegateExecution::new(ctx, &id, &activity.id);
            delegate.execute(&mut delegate_execution)?;
            ctx.plan(leave, id);
        }
        ActivityKind::UserTask => {
            debug!(execution_id = %id, activity_id = %activity.id, "Waiting in user task");
        }
        ActivityKind::ParallelGateway => {
            let incoming = graph.incoming_count(&activity.id);
            if incoming > 1 {
                if let Some(continuing) = tree::join(ctx, &id, &activity.id, incoming)? {
                    ctx.plan(leave, continuing);
                }
            } else {
                ctx.plan(leave, id);
            }
        }
        ActivityKind::TimerCatch { duration_ms } => {
            let due = jobs::add_duration(
                ctx.now(),
                std::time::Duration::from_millis(*duration_ms),
                "duration_ms",
            )?;
            let job = NewJob::for_execution(jobs::TIMER_TRANSITION, execution)
                .kind(JobKind::Timer)
                .due_date(due)
                .configuration(activity.id.clone());
            jobs::create_job(ctx, job);
        }
        ActivityKind::ExternalTask { topic, priority } => {
            let job = NewJob::for_execution(jobs::EXTERNAL_TASK, execution)
                .kind(JobKind::ExternalWorker)
                .topic(topic.clone())
                .priority(*priority)
                .configuration(activity.id.clone());
            jobs::create_job(ctx, job);
        }
        ActivityKind::SignalCatch { signal } => {
            subscribe(ctx, execution, &activity.id, EventType::Signal, signal);
        }
        ActivityKind::MessageCatch { message } => {
            subscribe(ctx, execution, &activity.id, EventType::Message, message);
        }
        ActivityKind::SubProcess { start } => {
            let child_id = tree::create_scope_child(ctx, &id)?;
            ctx.plan(
                Operation::StartActivity {
                    activity_id: start.clone(),
                },
                child_id,
            );
        }
    }
    Ok(())
}

fn subscribe(
    ctx: &mut CommandContext,
    execution: &Execution,
    activity_id: &str,
    event_type: EventType,
    event_name: &str,
) {
    let subscription = EventSubscription {
        id: ctx.new_id(),
        event_type,
        event_name: event_name.to_string(),
        execution_id: execution.id.clone(),
        process_instance_id: execution.process_instance_id.clone(),
        activity_id: activity_id.to_string(),
        tenant_id: execution.tenant_id.clone(),
        created_at: ctx.now(),
        revision: 1,
    };
    debug!(
        execution_id = %execution.id,
        event_type = event_type.as_str(),
        event_name,
        "Subscribed to event"
    );
    ctx.insert_event_subscription(subscription);
}

fn take_outgoing_flows(
    ctx: &mut CommandContext,
    graph: &FlowGraph,
    execution: &Execution,
    skip_async_after: bool,
) -> Result<()> {
    let activity = current_activity(graph, execution)?;

    if activity.async_after && !skip_async_after {
        jobs::create_async_continuation(ctx, execution, jobs::ASYNC_AFTER)?;
        return Ok(());
    }

    let targets: Vec<String> = match &activity.kind {
        ActivityKind::ExclusiveGateway { default_flow } => {
            let mut selected = None;
            for flow in graph.outgoing(&activity.id) {
                if Some(&flow.id) == default_flow.as_ref() {
                    continue;
                }
                let taken = match &flow.condition {
                    None => true,
                    Some(condition) => {
                        let mut lookup_error = None;
                        let result = condition.evaluate(|name| {
                            variables::get(ctx, &execution.id, name).unwrap_or_else(|e| {
                                lookup_error = Some(e);
                                None
                            })
                        });
                        if let Some(e) = lookup_error {
                            return Err(e);
                        }
                        result
                    }
                };
                if taken {
                    selected = Some(flow.target.clone());
                    break;
                }
            }
            let selected = selected.or_else(|| {
                default_flow
                    .as_deref()
                    .and_then(|id| graph.flow(id))
                    .map(|flow| flow.target.clone())
            });
            match selected {
                Some(target) => vec![target],
                None => {
                    return Err(EngineError::illegal_state(
                        &execution.id,
                        format!(
                            "no outgoing flow of gateway '{}' can be taken",
                            activity.id
                        ),
                    ));
                }
            }
        }
        _ => graph
            .outgoing(&activity.id)
            .into_iter()
            .map(|flow| flow.target.clone())
            .collect(),
    };

    let id = execution.id.clone();
    match targets.len() {
        0 => ctx.plan(Operation::EndExecution, id),
        1 => {
            let activity_id = targets.into_iter().next().unwrap_or_default();
            ctx.plan(Operation::StartActivity { activity_id }, id);
        }
        _ => {
            tree::fork(ctx, &id, &targets)?;
        }
    }
    Ok(())
}
