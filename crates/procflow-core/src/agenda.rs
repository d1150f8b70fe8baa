// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation agenda of a unit of work.
//!
//! Operations are planned against an execution and drained in FIFO order by
//! the command executor until the agenda is empty.

use std::collections::VecDeque;

use crate::operations::Operation;

/// One planned operation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgendaItem {
    /// What to do.
    pub operation: Operation,
    /// Execution to do it on.
    pub execution_id: String,
}

/// FIFO queue of pending operations.
#[derive(Debug, Default)]
pub struct Agenda {
    items: VecDeque<AgendaItem>,
}

impl Agenda {
    /// Create an empty agenda.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation.
    pub fn plan_operation(&mut self, operation: Operation, execution_id: impl Into<String>) {
        self.items.push_back(AgendaItem {
            operation,
            execution_id: execution_id.into(),
        });
    }

    /// Take the oldest planned operation.
    pub fn next_operation(&mut self) -> Option<AgendaItem> {
        self.items.pop_front()
    }

    /// Drop every operation planned for `execution_id`. Returns how many were dropped.
    pub fn remove_operations_for(&mut self, execution_id: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|item| item.execution_id != execution_id);
        before - self.items.len()
    }

    /// True when nothing is planned.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of planned operations.
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agenda_is_fifo() {
        let mut agenda = Agenda::new();
        agenda.plan_operation(
            Operation::StartActivity {
                activity_id: "a".to_string(),
            },
            "exec-1",
        );
        agenda.plan_operation(Operation::ExecuteActivity, "exec-2");
        assert_eq!(agenda.len(), 2);

        let first = agenda.next_operation().unwrap();
        assert_eq!(first.execution_id, "exec-1");
        let second = agenda.next_operation().unwrap();
        assert_eq!(second.operation, Operation::ExecuteActivity);
        assert!(agenda.next_operation().is_none());
        assert!(agenda.is_empty());
    }

    #[test]
    fn test_remove_operations_for_execution() {
        let mut agenda = Agenda::new();
        agenda.plan_operation(Operation::ExecuteActivity, "exec-1");
        agenda.plan_operation(Operation::EndExecution, "exec-2");
        agenda.plan_operation(
            Operation::TakeOutgoingFlows {
                skip_async_after: false,
            },
            "exec-1",
        );

        assert_eq!(agenda.remove_operations_for("exec-1"), 2);
        assert_eq!(agenda.len(), 1);
        assert_eq!(agenda.next_operation().unwrap().execution_id, "exec-2");
        assert_eq!(agenda.remove_operations_for("exec-1"), 0);
    }
}
