// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Variable scopes.
//!
//! Every execution is a variable scope. Reads walk from the execution up to
//! the process instance; a scope's transient variables shadow its persistent
//! ones. Non-local writes update the nearest ancestor that already defines
//! the variable, or else create it on the nearest scope execution.

use std::collections::BTreeMap;

use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::persistence::{ScopeType, VariableInstance, VariableValue};

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(EngineError::validation(
            "name",
            "variable name must not be empty",
        ));
    }
    Ok(())
}

/// The execution itself followed by its ancestors up to the process instance.
fn ancestry(ctx: &CommandContext, execution_id: &str) -> Result<Vec<String>> {
    let mut chain = Vec::new();
    let mut current = Some(execution_id.to_string());
    while let Some(id) = current {
        let execution = ctx.execution(&id)?;
        current = execution.parent_id.clone();
        chain.push(id);
    }
    Ok(chain)
}

/// Nearest execution owning a variable namespace. Concurrent executions
/// delegate to their parent.
fn nearest_scope(ctx: &CommandContext, execution_id: &str) -> Result<String> {
    let mut id = execution_id.to_string();
    loop {
        let execution = ctx.execution(&id)?;
        if execution.is_scope && !execution.is_concurrent {
            return Ok(id);
        }
        match &execution.parent_id {
            Some(parent) => id = parent.clone(),
            None => return Ok(id),
        }
    }
}

/// Value visible in `execution_id`'s own namespace.
pub fn get_local(ctx: &CommandContext, execution_id: &str, name: &str) -> Option<VariableValue> {
    ctx.transient(execution_id, name)
        .cloned()
        .or_else(|| {
            ctx.variable_instance(execution_id, name)
                .map(|v| v.value.clone())
        })
}

/// Value visible from `execution_id`, searching up to the process instance.
pub fn get(ctx: &CommandContext, execution_id: &str, name: &str) -> Result<Option<VariableValue>> {
    for scope in ancestry(ctx, execution_id)? {
        if let Some(value) = get_local(ctx, &scope, name) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Whether `name` is defined in `execution_id`'s own namespace.
pub fn has_local(ctx: &CommandContext, execution_id: &str, name: &str) -> bool {
    get_local(ctx, execution_id, name).is_some()
}

/// Whether `name` is visible from `execution_id`.
pub fn has(ctx: &CommandContext, execution_id: &str, name: &str) -> Result<bool> {
    Ok(get(ctx, execution_id, name)?.is_some())
}

/// Create or update a persistent variable in `execution_id`'s own namespace.
pub fn set_local(
    ctx: &mut CommandContext,
    execution_id: &str,
    name: &str,
    value: VariableValue,
) -> Result<()> {
    validate_name(name)?;
    let process_instance_id = ctx.execution(execution_id)?.process_instance_id.clone();

    // A persistent write replaces any transient shadow.
    ctx.remove_transient(execution_id, name);

    let existing = ctx
        .variable_instance(execution_id, name)
        .map(|v| v.id.clone());
    match existing {
        Some(id) => {
            if let Some(variable) = ctx.variable_mut(&id) {
                variable.value = value;
            }
        }
        None => {
            let id = ctx.new_id();
            ctx.insert_variable(VariableInstance {
                id,
                scope_id: execution_id.to_string(),
                scope_type: ScopeType::Execution,
                process_instance_id,
                name: name.to_string(),
                value,
                revision: 1,
            });
        }
    }
    Ok(())
}

/// Target of a non-local write: nearest definer, else nearest scope.
fn write_target(ctx: &CommandContext, execution_id: &str, name: &str) -> Result<String> {
    for scope in ancestry(ctx, execution_id)? {
        if has_local(ctx, &scope, name) {
            return Ok(scope);
        }
    }
    nearest_scope(ctx, execution_id)
}

/// Non-local write.
pub fn set(
    ctx: &mut CommandContext,
    execution_id: &str,
    name: &str,
    value: VariableValue,
) -> Result<()> {
    validate_name(name)?;
    let target = write_target(ctx, execution_id, name)?;
    set_local(ctx, &target, name, value)
}

/// Set a transient variable in `execution_id`'s own namespace. Transient
/// variables are never persisted.
pub fn set_transient_local(
    ctx: &mut CommandContext,
    execution_id: &str,
    name: &str,
    value: VariableValue,
) -> Result<()> {
    validate_name(name)?;
    ctx.execution(execution_id)?;
    ctx.set_transient(execution_id, name, value);
    Ok(())
}

/// Non-local transient write, targeted like [`set`].
pub fn set_transient(
    ctx: &mut CommandContext,
    execution_id: &str,
    name: &str,
    value: VariableValue,
) -> Result<()> {
    validate_name(name)?;
    let target = write_target(ctx, execution_id, name)?;
    ctx.set_transient(&target, name, value);
    Ok(())
}

/// Remove a variable from `execution_id`'s own namespace. Returns whether it existed.
pub fn remove_local(ctx: &mut CommandContext, execution_id: &str, name: &str) -> Result<bool> {
    ctx.execution(execution_id)?;
    let transient = ctx.remove_transient(execution_id, name).is_some();
    let persistent = ctx
        .variable_instance(execution_id, name)
        .map(|v| v.id.clone())
        .and_then(|id| ctx.delete_variable(&id))
        .is_some();
    Ok(transient || persistent)
}

/// Variables of `execution_id`'s own namespace.
pub fn local(ctx: &CommandContext, execution_id: &str) -> Result<BTreeMap<String, VariableValue>> {
    ctx.execution(execution_id)?;
    let mut vars: BTreeMap<String, VariableValue> = ctx
        .variable_instances_of(execution_id)
        .into_iter()
        .map(|v| (v.name.clone(), v.value.clone()))
        .collect();
    for (name, value) in ctx.transients_of(execution_id) {
        vars.insert(name.to_string(), value.clone());
    }
    Ok(vars)
}

/// Every variable visible from `execution_id`; nearer scopes shadow outer ones.
pub fn all(ctx: &CommandContext, execution_id: &str) -> Result<BTreeMap<String, VariableValue>> {
    let mut vars = BTreeMap::new();
    for scope in ancestry(ctx, execution_id)? {
        for (name, value) in local(ctx, &scope)? {
            vars.entry(name).or_insert(value);
        }
    }
    Ok(vars)
}

/// Names of every variable visible from `execution_id`, sorted.
pub fn names(ctx: &CommandContext, execution_id: &str) -> Result<Vec<String>> {
    Ok(all(ctx, execution_id)?.into_keys().collect())
}

/// Non-local write of several variables.
pub fn set_all(
    ctx: &mut CommandContext,
    execution_id: &str,
    variables: &BTreeMap<String, VariableValue>,
) -> Result<()> {
    for (name, value) in variables {
        set(ctx, execution_id, name, value.clone())?;
    }
    Ok(())
}

/// Local write of several variables.
pub fn set_all_local(
    ctx: &mut CommandContext,
    execution_id: &str,
    variables: &BTreeMap<String, VariableValue>,
) -> Result<()> {
    for (name, value) in variables {
        set_local(ctx, execution_id, name, value.clone())?;
    }
    Ok(())
}
