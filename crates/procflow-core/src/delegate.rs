// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User code invoked by service tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::context::CommandContext;
use crate::error::Result;
use crate::persistence::VariableValue;
use crate::variables;

/// Behaviour of a service task.
///
/// Delegates run synchronously inside the unit of work of the operation that
/// reached the service task. An error aborts that unit of work; when it runs
/// in a job the job is retried.
pub trait ActivityDelegate: Send + Sync {
    /// Run the task.
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<()>;
}

impl<F> ActivityDelegate for F
where
    F: Fn(&mut DelegateExecution<'_>) -> Result<()> + Send + Sync,
{
    fn execute(&self, execution: &mut DelegateExecution<'_>) -> Result<()> {
        self(execution)
    }
}

/// View of the execution a delegate runs for.
pub struct DelegateExecution<'a> {
    ctx: &'a mut CommandContext,
    execution_id: String,
    activity_id: String,
}

impl<'a> DelegateExecution<'a> {
    pub(crate) fn new(ctx: &'a mut CommandContext, execution_id: &str, activity_id: &str) -> Self {
        Self {
            ctx,
            execution_id: execution_id.to_string(),
            activity_id: activity_id.to_string(),
        }
    }

    /// Execution id.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Activity being executed.
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Process instance id.
    pub fn process_instance_id(&self) -> Result<String> {
        Ok(self
            .ctx
            .execution(&self.execution_id)?
            .process_instance_id
            .clone())
    }

    /// Business key of the process instance.
    pub fn business_key(&self) -> Result<Option<String>> {
        let process_instance_id = self.process_instance_id()?;
        Ok(self.ctx.execution(&process_instance_id)?.business_key.clone())
    }

    /// Visible variable.
    pub fn variable(&self, name: &str) -> Result<Option<VariableValue>> {
        variables::get(&*self.ctx, &self.execution_id, name)
    }

    /// All visible variables.
    pub fn variables(&self) -> Result<BTreeMap<String, VariableValue>> {
        variables::all(&*self.ctx, &self.execution_id)
    }

    /// Non-local write.
    pub fn set_variable(&mut self, name: &str, value: impl Into<VariableValue>) -> Result<()> {
        variables::set(&mut *self.ctx, &self.execution_id, name, value.into())
    }

    /// Local write.
    pub fn set_variable_local(&mut self, name: &str, value: impl Into<VariableValue>) -> Result<()> {
        variables::set_local(&mut *self.ctx, &self.execution_id, name, value.into())
    }

    /// Transient write, discarded at commit.
    pub fn set_transient(&mut self, name: &str, value: impl Into<VariableValue>) -> Result<()> {
        variables::set_transient(&mut *self.ctx, &self.execution_id, name, value.into())
    }
}

/// Delegates by name.
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    delegates: HashMap<String, Arc<dyn ActivityDelegate>>,
}

impl DelegateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a delegate, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, delegate: Arc<dyn ActivityDelegate>) {
        self.delegates.insert(name.into(), delegate);
    }

    /// Look up a delegate.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityDelegate>> {
        self.delegates.get(name).cloned()
    }

    /// Number of registered delegates.
    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }
}

impl std::fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.delegates.keys().collect();
        names.sort();
        f.debug_struct("DelegateRegistry")
            .field("delegates", &names)
            .finish()
    }
}
