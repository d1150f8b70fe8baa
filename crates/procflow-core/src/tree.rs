// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution tree structure.
//!
//! A process instance is a tree of executions rooted at the process-instance
//! execution. Non-concurrent executions are scopes: they own a variable
//! namespace and are the unit of cascade deletion. A scope that forks
//! becomes inactive and parents one concurrent child per branch; joining
//! merges the children back into the scope.
//!
//! All functions work on the cache of the given unit of work, so a fork, a
//! join or a cascade is committed as a whole or not at all.

use tracing::debug;

use crate::context::CommandContext;
use crate::engine::EngineEvent;
use crate::error::{EngineError, Result};
use crate::model::FlowGraph;
use crate::operations::Operation;
use crate::persistence::Execution;

/// Create the root execution of a new process instance. Returns its id.
pub fn create_process_instance(
    ctx: &mut CommandContext,
    graph: &FlowGraph,
    business_key: Option<String>,
    tenant_id: Option<String>,
) -> String {
    let id = ctx.new_id();
    ctx.insert_execution(Execution {
        id: id.clone(),
        parent_id: None,
        process_instance_id: id.clone(),
        process_definition_id: graph.id().to_string(),
        activity_id: None,
        business_key,
        is_active: true,
        is_scope: true,
        is_concurrent: false,
        is_suspended: false,
        tenant_id,
        revision: 1,
    });
    debug!(process_instance_id = %id, definition_id = %graph.id(), "Created process instance");
    id
}

fn new_child(ctx: &CommandContext, parent: &Execution, concurrent: bool) -> Execution {
    Execution {
        id: ctx.new_id(),
        parent_id: Some(parent.id.clone()),
        process_instance_id: parent.process_instance_id.clone(),
        process_definition_id: parent.process_definition_id.clone(),
        activity_id: None,
        business_key: None,
        is_active: true,
        is_scope: !concurrent,
        is_concurrent: concurrent,
        is_suspended: parent.is_suspended,
        tenant_id: parent.tenant_id.clone(),
        revision: 1,
    }
}

/// Create a non-concurrent scope child, used to enter a sub-process. The
/// parent waits inactive until the child completes. Returns the child id.
pub fn create_scope_child(ctx: &mut CommandContext, parent_id: &str) -> Result<String> {
    let parent = ctx.execution(parent_id)?.clone();
    let child = new_child(ctx, &parent, false);
    let child_id = child.id.clone();
    ctx.insert_execution(child);
    ctx.execution_mut(parent_id)?.is_active = false;
    Ok(child_id)
}

/// Ids of the children of an execution, ascending.
pub fn children_of(ctx: &CommandContext, execution_id: &str) -> Vec<String> {
    ctx.children_of(execution_id)
}

/// The scope execution an execution belongs to: itself when it is a scope,
/// its parent when it is concurrent.
pub fn scope_of(ctx: &CommandContext, execution_id: &str) -> Result<String> {
    let execution = ctx.execution(execution_id)?;
    if !execution.is_concurrent {
        return Ok(execution.id.clone());
    }
    let parent_id = execution.parent_id.clone().ok_or_else(|| {
        EngineError::illegal_state(execution_id, "concurrent execution has no parent")
    })?;
    let parent = ctx.execution(&parent_id)?;
    if !parent.is_scope {
        return Err(EngineError::illegal_state(
            execution_id,
            format!("parent '{}' of concurrent execution is not a scope", parent_id),
        ));
    }
    Ok(parent_id)
}

/// Split an execution into one concurrent child per target activity.
///
/// A scope execution becomes the parent of the branches and waits inactive;
/// a concurrent execution is replaced by the new siblings under its scope.
/// One `StartActivity` is planned per child. Returns the child ids.
pub fn fork(
    ctx: &mut CommandContext,
    execution_id: &str,
    target_activities: &[String],
) -> Result<Vec<String>> {
    let execution = ctx.execution(execution_id)?.clone();
    let scope_id = scope_of(ctx, execution_id)?;

    if execution.is_concurrent {
        remove_execution(ctx, execution_id)?;
    } else {
        if !execution.is_scope {
            return Err(EngineError::illegal_state(
                execution_id,
                "cannot fork from an execution that is neither scope nor concurrent",
            ));
        }
        ctx.execution_mut(execution_id)?.is_active = false;
    }

    let scope = ctx.execution(&scope_id)?.clone();
    let mut children = Vec::with_capacity(target_activities.len());
    for activity_id in target_activities {
        let child = new_child(ctx, &scope, true);
        let child_id = child.id.clone();
        ctx.insert_execution(child);
        ctx.plan(
            Operation::StartActivity {
                activity_id: activity_id.clone(),
            },
            child_id.clone(),
        );
        children.push(child_id);
    }
    ctx.force_update_execution(&scope_id);

    debug!(
        execution_id,
        scope_id = %scope_id,
        branches = children.len(),
        "Forked execution"
    );
    Ok(children)
}

/// Arrive at a joining gateway with `incoming` incoming flows.
///
/// Returns the execution that continues past the gateway, or `None` while
/// branches are still missing. The scope is force-updated on every arrival so
/// that two units of work joining the same scope conflict on commit.
pub fn join(
    ctx: &mut CommandContext,
    execution_id: &str,
    gateway_id: &str,
    incoming: usize,
) -> Result<Option<String>> {
    let execution = ctx.execution(execution_id)?.clone();
    if !execution.is_concurrent {
        return Ok(Some(execution_id.to_string()));
    }

    let scope_id = scope_of(ctx, execution_id)?;
    {
        let arriving = ctx.execution_mut(execution_id)?;
        arriving.is_active = false;
        arriving.activity_id = Some(gateway_id.to_string());
    }
    ctx.force_update_execution(&scope_id);

    let siblings = children_of(ctx, &scope_id);
    let mut waiting = Vec::new();
    for id in &siblings {
        let child = ctx.execution(id)?;
        if child.is_concurrent
            && !child.is_active
            && child.activity_id.as_deref() == Some(gateway_id)
        {
            waiting.push(id.clone());
        }
    }

    if waiting.len() < incoming {
        debug!(
            execution_id,
            gateway_id,
            arrived = waiting.len(),
            expected = incoming,
            "Join waiting for branches"
        );
        return Ok(None);
    }

    // The arriving execution plus the oldest-id waiters complete the join.
    let mut joined: Vec<String> = waiting
        .into_iter()
        .filter(|id| id != execution_id)
        .take(incoming.saturating_sub(1))
        .collect();
    joined.push(execution_id.to_string());
    joined.sort();

    let others_remain = siblings.iter().any(|id| !joined.contains(id));
    if others_remain {
        for id in joined.iter().filter(|id| id.as_str() != execution_id) {
            remove_execution(ctx, id)?;
        }
        ctx.execution_mut(execution_id)?.is_active = true;
        debug!(execution_id, gateway_id, "Join fired, branch continues");
        Ok(Some(execution_id.to_string()))
    } else {
        for id in &joined {
            remove_execution(ctx, id)?;
        }
        let scope = ctx.execution_mut(&scope_id)?;
        scope.is_active = true;
        scope.activity_id = Some(gateway_id.to_string());
        debug!(execution_id, gateway_id, scope_id = %scope_id, "Join fired, scope continues");
        Ok(Some(scope_id))
    }
}

/// End an execution at its current activity.
///
/// A concurrent execution is removed and its scope completes once no
/// children are left; any other execution completes as a scope.
pub fn end_execution(ctx: &mut CommandContext, execution_id: &str) -> Result<()> {
    let execution = ctx.execution(execution_id)?.clone();
    if execution.is_concurrent {
        let scope_id = scope_of(ctx, execution_id)?;
        remove_execution(ctx, execution_id)?;
        ctx.force_update_execution(&scope_id);
        if children_of(ctx, &scope_id).is_empty() {
            complete_scope(ctx, &scope_id)?;
        }
        Ok(())
    } else {
        complete_scope(ctx, execution_id)
    }
}

/// Complete a scope execution.
///
/// Completing a process instance removes the whole tree and publishes
/// [`EngineEvent::ProcessInstanceCompleted`]. Completing a sub-process scope
/// removes it and resumes its parent past the sub-process activity.
pub fn complete_scope(ctx: &mut CommandContext, scope_id: &str) -> Result<()> {
    let scope = ctx.execution(scope_id)?.clone();
    if !scope.is_scope {
        return Err(EngineError::illegal_state(
            scope_id,
            "only scope executions can complete",
        ));
    }

    remove_execution_tree(ctx, scope_id)?;

    match scope.parent_id {
        None => {
            debug!(process_instance_id = %scope.id, "Process instance completed");
            ctx.publish(EngineEvent::ProcessInstanceCompleted {
                process_instance_id: scope.id,
                process_definition_id: scope.process_definition_id,
                business_key: scope.business_key,
            });
        }
        Some(parent_id) => {
            let parent = ctx.execution_mut(&parent_id)?;
            parent.is_active = true;
            ctx.plan(
                Operation::TakeOutgoingFlows {
                    skip_async_after: false,
                },
                parent_id,
            );
        }
    }
    Ok(())
}

/// Remove a leaf execution with its variables, transient variables, jobs,
/// event subscriptions and planned operations.
pub fn remove_execution(ctx: &mut CommandContext, execution_id: &str) -> Result<()> {
    ctx.execution(execution_id)?;
    if !children_of(ctx, execution_id).is_empty() {
        return Err(EngineError::illegal_state(
            execution_id,
            "cannot remove an execution that still has children",
        ));
    }

    let variable_ids: Vec<String> = ctx
        .variable_instances_of(execution_id)
        .into_iter()
        .map(|v| v.id.clone())
        .collect();
    for id in variable_ids {
        ctx.delete_variable(&id);
    }
    ctx.clear_transients_of(execution_id);

    for id in ctx.jobs_of_execution(execution_id) {
        ctx.delete_job(&id);
    }
    for id in ctx.event_subscriptions_of(execution_id) {
        ctx.delete_event_subscription(&id);
    }
    ctx.agenda().remove_operations_for(execution_id);
    ctx.delete_execution(execution_id);
    Ok(())
}

/// Remove an execution and all its descendants, deepest first.
pub fn remove_execution_tree(ctx: &mut CommandContext, execution_id: &str) -> Result<()> {
    for child in children_of(ctx, execution_id) {
        remove_execution_tree(ctx, &child)?;
    }
    remove_execution(ctx, execution_id)
}
