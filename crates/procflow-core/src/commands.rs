// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Commands over process instances and their variables.
//!
//! Each command is one unit of work: it loads what it needs, edits the cached
//! entities and plans operations, and the [`CommandExecutor`] drains the
//! agenda and commits.
//!
//! [`CommandExecutor`]: crate::context::CommandExecutor

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::context::{Command, CommandContext};
use crate::engine::EngineEvent;
use crate::error::{EngineError, Result};
use crate::model::ActivityKind;
use crate::operations::Operation;
use crate::persistence::{
    EventSubscription, EventSubscriptionQuery, EventType, JobKind, VariableValue,
};
use crate::tree;
use crate::variables;

type Variables = BTreeMap<String, VariableValue>;

/// Resume an execution waiting at `activity_id`: write the variables and
/// leave the activity along its outgoing flows.
fn leave_wait_state(
    ctx: &mut CommandContext,
    execution_id: &str,
    activity_id: &str,
    variables: &Variables,
) -> Result<()> {
    let execution = ctx.execution(execution_id)?;
    if execution.is_suspended {
        return Err(EngineError::illegal_state(
            execution_id,
            "execution is suspended",
        ));
    }
    if execution.activity_id.as_deref() != Some(activity_id) {
        return Err(EngineError::illegal_state(
            execution_id,
            format!("execution is not waiting at '{}'", activity_id),
        ));
    }
    variables::set_all(ctx, execution_id, variables)?;
    ctx.plan(
        Operation::TakeOutgoingFlows {
            skip_async_after: false,
        },
        execution_id,
    );
    Ok(())
}

/// Consume an event subscription and resume its execution.
async fn deliver(
    ctx: &mut CommandContext,
    subscription: &EventSubscription,
    variables: &Variables,
) -> Result<()> {
    ctx.load_process_instance(&subscription.process_instance_id)
        .await?;
    ctx.delete_event_subscription(&subscription.id);
    leave_wait_state(
        ctx,
        &subscription.execution_id,
        &subscription.activity_id,
        variables,
    )
}

// ============================================================================
// Process instances
// ============================================================================

/// Start a process instance. Returns its id.
#[derive(Debug, Clone)]
pub struct StartProcessInstanceCommand {
    /// Flow graph to instantiate.
    pub definition_id: String,
    /// Optional business key.
    pub business_key: Option<String>,
    /// Optional tenant.
    pub tenant_id: Option<String>,
    /// Variables created on the process instance.
    pub variables: Variables,
}

impl StartProcessInstanceCommand {
    /// Start `definition_id` without key or variables.
    pub fn new(definition_id: impl Into<String>) -> Self {
        Self {
            definition_id: definition_id.into(),
            business_key: None,
            tenant_id: None,
            variables: Variables::new(),
        }
    }
}

#[async_trait]
impl Command for StartProcessInstanceCommand {
    type Output = String;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<String> {
        let graph = ctx.graph(&self.definition_id)?;
        let process_instance_id = tree::create_process_instance(
            ctx,
            &graph,
            self.business_key.clone(),
            self.tenant_id.clone(),
        );
        variables::set_all_local(ctx, &process_instance_id, &self.variables)?;

        ctx.publish(EngineEvent::ProcessInstanceStarted {
            process_instance_id: process_instance_id.clone(),
            process_definition_id: self.definition_id.clone(),
            business_key: self.business_key.clone(),
        });
        ctx.plan(
            Operation::StartActivity {
                activity_id: graph.start_activity().to_string(),
            },
            process_instance_id.clone(),
        );
        info!(
            process_instance_id = %process_instance_id,
            definition_id = %self.definition_id,
            "Starting process instance"
        );
        Ok(process_instance_id)
    }
}

/// Delete a process instance with its whole execution tree, variables, jobs
/// and event subscriptions.
#[derive(Debug, Clone)]
pub struct DeleteProcessInstanceCommand {
    /// Process instance id.
    pub process_instance_id: String,
    /// Reason recorded on the deletion event.
    pub reason: Option<String>,
}

#[async_trait]
impl Command for DeleteProcessInstanceCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let root = ctx.load_execution(&self.process_instance_id).await?;
        if !root.is_process_instance() {
            return Err(EngineError::validation(
                "process_instance_id",
                format!("'{}' is not a process instance", self.process_instance_id),
            ));
        }

        tree::remove_execution_tree(ctx, &root.id)?;
        ctx.publish(EngineEvent::ProcessInstanceDeleted {
            process_instance_id: root.id.clone(),
            reason: self.reason.clone(),
        });
        info!(process_instance_id = %root.id, reason = ?self.reason, "Deleted process instance");
        Ok(())
    }
}

/// Suspend or activate every execution and job of a process instance.
///
/// Suspended executions reject operations and suspended jobs are never
/// acquired.
#[derive(Debug, Clone)]
pub struct SetProcessInstanceSuspensionCommand {
    /// Process instance id.
    pub process_instance_id: String,
    /// True to suspend, false to activate.
    pub suspended: bool,
}

#[async_trait]
impl Command for SetProcessInstanceSuspensionCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let root = ctx.load_execution(&self.process_instance_id).await?;
        if !root.is_process_instance() {
            return Err(EngineError::validation(
                "process_instance_id",
                format!("'{}' is not a process instance", self.process_instance_id),
            ));
        }

        let execution_ids: Vec<String> = ctx
            .executions_of(&root.id)
            .into_iter()
            .map(|e| e.id.clone())
            .collect();
        for id in &execution_ids {
            ctx.execution_mut(id)?.is_suspended = self.suspended;
        }

        let now = ctx.now();
        for job_id in ctx.jobs_of_process_instance(&root.id) {
            let Some(job) = ctx.job_mut(&job_id) else {
                continue;
            };
            if self.suspended {
                if matches!(
                    job.kind,
                    JobKind::Timer | JobKind::Ready | JobKind::ExternalWorker
                ) {
                    job.transition_to(JobKind::Suspended)?;
                    job.release_lock();
                }
            } else if job.kind == JobKind::Suspended {
                let next = job.resume_kind(now);
                job.transition_to(next)?;
            }
        }

        info!(
            process_instance_id = %root.id,
            suspended = self.suspended,
            "Changed process instance suspension"
        );
        Ok(())
    }
}

// ============================================================================
// Wait states
// ============================================================================

/// Complete the user task an execution is waiting in.
#[derive(Debug, Clone)]
pub struct TriggerCommand {
    /// Waiting execution.
    pub execution_id: String,
    /// Variables to write before leaving (non-local).
    pub variables: Variables,
}

#[async_trait]
impl Command for TriggerCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let execution = ctx.load_execution(&self.execution_id).await?;
        let activity_id = execution.activity_id.clone().ok_or_else(|| {
            EngineError::illegal_state(&execution.id, "execution is not at an activity")
        })?;
        let graph = ctx.graph(&execution.process_definition_id)?;
        let activity = graph.activity(&activity_id)?;
        if !matches!(activity.kind, ActivityKind::UserTask) || !execution.is_active {
            return Err(EngineError::illegal_state(
                &execution.id,
                format!(
                    "execution is not waiting in a user task (at {} '{}')",
                    activity.kind.name(),
                    activity_id
                ),
            ));
        }
        leave_wait_state(ctx, &execution.id, &activity_id, &self.variables)
    }
}

/// Broadcast a signal to every execution subscribed to it.
///
/// Returns the number of executions resumed. Suspended executions keep their
/// subscription and are skipped.
#[derive(Debug, Clone)]
pub struct SignalEventReceivedCommand {
    /// Signal name.
    pub signal_name: String,
    /// Restrict delivery to one process instance.
    pub process_instance_id: Option<String>,
    /// Variables written on each resumed execution.
    pub variables: Variables,
}

#[async_trait]
impl Command for SignalEventReceivedCommand {
    type Output = usize;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<usize> {
        let subscriptions = ctx
            .find_event_subscriptions(&EventSubscriptionQuery {
                event_type: Some(EventType::Signal),
                event_name: Some(self.signal_name.clone()),
                process_instance_id: self.process_instance_id.clone(),
                ..Default::default()
            })
            .await?;

        let mut delivered = 0;
        for subscription in &subscriptions {
            ctx.load_process_instance(&subscription.process_instance_id)
                .await?;
            if ctx.execution(&subscription.execution_id)?.is_suspended {
                debug!(execution_id = %subscription.execution_id, "Skipping suspended execution");
                continue;
            }
            deliver(ctx, subscription, &self.variables).await?;
            delivered += 1;
        }
        debug!(signal = %self.signal_name, delivered, "Signal delivered");
        Ok(delivered)
    }
}

/// Deliver a message to the single execution waiting for it.
///
/// Fails with [`EngineError::MessageCorrelation`] unless exactly one
/// subscription matches. Returns the resumed execution id.
#[derive(Debug, Clone)]
pub struct CorrelateMessageCommand {
    /// Message name.
    pub message_name: String,
    /// Only subscriptions of this process instance.
    pub process_instance_id: Option<String>,
    /// Only process instances with this business key.
    pub business_key: Option<String>,
    /// Variables written on the resumed execution.
    pub variables: Variables,
}

#[async_trait]
impl Command for CorrelateMessageCommand {
    type Output = String;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<String> {
        let candidates = ctx
            .find_event_subscriptions(&EventSubscriptionQuery {
                event_type: Some(EventType::Message),
                event_name: Some(self.message_name.clone()),
                process_instance_id: self.process_instance_id.clone(),
                ..Default::default()
            })
            .await?;

        let mut matching = Vec::new();
        for subscription in candidates {
            if let Some(ref business_key) = self.business_key {
                ctx.load_process_instance(&subscription.process_instance_id)
                    .await?;
                let root = ctx.execution(&subscription.process_instance_id)?;
                if root.business_key.as_ref() != Some(business_key) {
                    continue;
                }
            }
            matching.push(subscription);
        }

        let [subscription] = matching.as_slice() else {
            return Err(EngineError::MessageCorrelation {
                message_name: self.message_name.clone(),
                matches: matching.len(),
            });
        };
        deliver(ctx, subscription, &self.variables).await?;
        Ok(subscription.execution_id.clone())
    }
}

// ============================================================================
// Variables
// ============================================================================

/// Read one variable visible from an execution.
#[derive(Debug, Clone)]
pub struct GetVariableCommand {
    /// Execution to read from.
    pub execution_id: String,
    /// Variable name.
    pub name: String,
    /// Only the execution's own namespace.
    pub local: bool,
}

#[async_trait]
impl Command for GetVariableCommand {
    type Output = Option<VariableValue>;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Option<VariableValue>> {
        ctx.load_execution(&self.execution_id).await?;
        if self.local {
            Ok(variables::get_local(ctx, &self.execution_id, &self.name))
        } else {
            variables::get(ctx, &self.execution_id, &self.name)
        }
    }
}

/// Read every variable visible from an execution.
#[derive(Debug, Clone)]
pub struct GetVariablesCommand {
    /// Execution to read from.
    pub execution_id: String,
    /// Only the execution's own namespace.
    pub local: bool,
}

#[async_trait]
impl Command for GetVariablesCommand {
    type Output = Variables;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Variables> {
        ctx.load_execution(&self.execution_id).await?;
        if self.local {
            variables::local(ctx, &self.execution_id)
        } else {
            variables::all(ctx, &self.execution_id)
        }
    }
}

/// Write variables on an execution.
#[derive(Debug, Clone)]
pub struct SetVariablesCommand {
    /// Execution to write to.
    pub execution_id: String,
    /// Variables to write.
    pub variables: Variables,
    /// Write into the execution's own namespace instead of the nearest definer.
    pub local: bool,
}

#[async_trait]
impl Command for SetVariablesCommand {
    type Output = ();

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        ctx.load_execution(&self.execution_id).await?;
        if self.local {
            variables::set_all_local(ctx, &self.execution_id, &self.variables)
        } else {
            variables::set_all(ctx, &self.execution_id, &self.variables)
        }
    }
}

/// Remove a variable from an execution's own namespace. Returns whether it existed.
#[derive(Debug, Clone)]
pub struct RemoveVariableCommand {
    /// Execution owning the variable.
    pub execution_id: String,
    /// Variable name.
    pub name: String,
}

#[async_trait]
impl Command for RemoveVariableCommand {
    type Output = bool;

    async fn execute(&self, ctx: &mut CommandContext) -> Result<bool> {
        ctx.load_execution(&self.execution_id).await?;
        variables::remove_local(ctx, &self.execution_id, &self.name)
    }
}
