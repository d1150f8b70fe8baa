// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for process execution: wait states, gateways, the execution tree,
//! variable scoping and process instance lifecycle.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::*;
use procflow_core::engine::EngineEvent;
use procflow_core::error::EngineError;
use procflow_core::model::{FlowCondition, FlowGraph, FlowGraphBuilder};
use procflow_core::persistence::{JobKind, VariableValue};
use tokio::sync::broadcast::error::TryRecvError;

fn approval() -> FlowGraph {
    FlowGraphBuilder::new("approval")
        .start_event("start")
        .user_task("review")
        .end_event("end")
        .flow("start", "review")
        .flow("review", "end")
        .build()
        .unwrap()
}

fn fork_join() -> FlowGraph {
    FlowGraphBuilder::new("fork-join")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .parallel_gateway("join")
        .user_task("after")
        .end_event("end")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("a", "join")
        .flow("b", "join")
        .flow("join", "after")
        .flow("after", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_straight_through_process_completes() {
    let graph = FlowGraphBuilder::new("straight")
        .start_event("start")
        .task("step")
        .end_event("end")
        .flow("start", "step")
        .flow("step", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let mut events = t.engine.subscribe();

    let pid = t
        .engine
        .start_process_instance("straight", Some("order-1"), BTreeMap::new())
        .await
        .unwrap();

    assert!(t.is_ended(&pid).await);
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::ProcessInstanceStarted {
            process_instance_id: pid.clone(),
            process_definition_id: "straight".into(),
            business_key: Some("order-1".into()),
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::ProcessInstanceCompleted {
            process_instance_id: pid,
            process_definition_id: "straight".into(),
            business_key: Some("order-1".into()),
        }
    );
}

#[tokio::test]
async fn test_unknown_definition_is_rejected() {
    let t = TestEngine::with_graphs(vec![]);
    let err = t
        .engine
        .start_process_instance("missing", None, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProcessDefinitionNotFound { .. }));
}

#[tokio::test]
async fn test_user_task_waits_until_triggered() {
    let t = TestEngine::with_graphs(vec![approval()]);
    let pid = t.start("approval").await;

    let waiting = t.execution_at(&pid, "review").await;
    assert_eq!(waiting.id, pid);

    t.engine
        .trigger(&pid, vars([("approved", VariableValue::from(true))]))
        .await
        .unwrap();

    assert!(t.is_ended(&pid).await);
}

#[tokio::test]
async fn test_trigger_outside_user_task_is_rejected() {
    let graph = FlowGraphBuilder::new("signal-wait")
        .start_event("start")
        .signal_catch("wait", "go")
        .end_event("end")
        .flow("start", "wait")
        .flow("wait", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let pid = t.start("signal-wait").await;

    let err = t.engine.trigger(&pid, BTreeMap::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::IllegalStateTransition { .. }));
    assert_eq!(t.subscription_count(&pid).await, 1);
}

#[tokio::test]
async fn test_exclusive_gateway_follows_matching_flow() {
    let graph = FlowGraphBuilder::new("decision")
        .start_event("start")
        .exclusive_gateway("check", Some("check->rejected"))
        .user_task("approved")
        .user_task("rejected")
        .end_event("end")
        .flow("start", "check")
        .conditional_flow(
            "check",
            "approved",
            FlowCondition::IsTrue {
                variable: "ok".into(),
            },
        )
        .flow("check", "rejected")
        .flow("approved", "end")
        .flow("rejected", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);

    let yes = t
        .engine
        .start_process_instance("decision", None, vars([("ok", VariableValue::from(true))]))
        .await
        .unwrap();
    let no = t
        .engine
        .start_process_instance("decision", None, vars([("ok", VariableValue::from(false))]))
        .await
        .unwrap();

    t.execution_at(&yes, "approved").await;
    t.execution_at(&no, "rejected").await;
}

#[tokio::test]
async fn test_parallel_branches_join_into_scope() {
    let t = TestEngine::with_graphs(vec![fork_join()]);
    let pid = t.start("fork-join").await;

    let a = t.execution_at(&pid, "a").await;
    let b = t.execution_at(&pid, "b").await;
    assert!(a.is_concurrent && b.is_concurrent);
    assert_eq!(a.parent_id.as_deref(), Some(pid.as_str()));
    let root = t.engine.execution(&pid).await.unwrap().unwrap();
    assert!(!root.is_active);

    t.engine.trigger(&a.id, BTreeMap::new()).await.unwrap();
    assert!(t.executions_at(&pid, "after").await.is_empty());
    assert_eq!(t.executions(&pid).await.len(), 3);

    t.engine.trigger(&b.id, BTreeMap::new()).await.unwrap();
    let after = t.execution_at(&pid, "after").await;
    assert_eq!(after.id, pid);
    assert_eq!(t.executions(&pid).await.len(), 1);

    t.engine.trigger(&pid, BTreeMap::new()).await.unwrap();
    assert!(t.is_ended(&pid).await);
}

#[tokio::test]
async fn test_join_fires_when_branches_arrive_in_reverse_order() {
    let t = TestEngine::with_graphs(vec![fork_join()]);
    let pid = t.start("fork-join").await;
    let a = t.execution_at(&pid, "a").await;
    let b = t.execution_at(&pid, "b").await;

    t.engine.trigger(&b.id, BTreeMap::new()).await.unwrap();
    assert!(t.executions_at(&pid, "after").await.is_empty());

    t.engine.trigger(&a.id, BTreeMap::new()).await.unwrap();
    let after = t.execution_at(&pid, "after").await;
    assert_eq!(after.id, pid);
    assert_eq!(t.executions(&pid).await.len(), 1);
}

fn three_way_join() -> FlowGraph {
    FlowGraphBuilder::new("three-way")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .user_task("c")
        .parallel_gateway("join")
        .user_task("after")
        .end_event("end")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("fork", "c")
        .flow("a", "join")
        .flow("b", "join")
        .flow("c", "join")
        .flow("join", "after")
        .flow("after", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_join_is_independent_of_arrival_order() {
    let orders = [
        ["a", "b", "c"],
        ["a", "c", "b"],
        ["b", "a", "c"],
        ["b", "c", "a"],
        ["c", "a", "b"],
        ["c", "b", "a"],
    ];
    let t = TestEngine::with_graphs(vec![three_way_join()]);

    for order in orders {
        let pid = t.start("three-way").await;
        let mut branches = Vec::new();
        for activity in order {
            branches.push(t.execution_at(&pid, activity).await.id);
        }

        let (last, waiting) = branches.split_last().unwrap();
        for id in waiting {
            t.engine.trigger(id, BTreeMap::new()).await.unwrap();
            assert!(
                t.executions_at(&pid, "after").await.is_empty(),
                "join fired early for order {:?}",
                order
            );
            assert_eq!(t.executions(&pid).await.len(), 4);
        }

        t.engine.trigger(last, BTreeMap::new()).await.unwrap();
        let after = t.execution_at(&pid, "after").await;
        assert_eq!(after.id, pid, "order {:?}", order);
        assert!(!after.is_concurrent);
        assert_eq!(t.executions(&pid).await.len(), 1);

        t.engine.trigger(&pid, BTreeMap::new()).await.unwrap();
        assert!(t.is_ended(&pid).await);
    }
}

#[tokio::test]
async fn test_partial_join_continues_arriving_branch() {
    let graph = FlowGraphBuilder::new("partial-join")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .user_task("c")
        .parallel_gateway("join")
        .user_task("after")
        .end_event("end")
        .end_event("c_end")
        .flow("start", "fork")
        .flow("fork", "a")
        .flow("fork", "b")
        .flow("fork", "c")
        .flow("a", "join")
        .flow("b", "join")
        .flow("join", "after")
        .flow("after", "end")
        .flow("c", "c_end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let pid = t.start("partial-join").await;

    let a = t.execution_at(&pid, "a").await;
    let b = t.execution_at(&pid, "b").await;
    let c = t.execution_at(&pid, "c").await;

    t.engine.trigger(&a.id, BTreeMap::new()).await.unwrap();
    t.engine.trigger(&b.id, BTreeMap::new()).await.unwrap();

    // Branch c is still running, so the join continues as a branch.
    let after = t.execution_at(&pid, "after").await;
    assert_eq!(after.id, b.id);
    assert!(after.is_concurrent);

    t.engine.trigger(&c.id, BTreeMap::new()).await.unwrap();
    assert!(!t.is_ended(&pid).await);

    t.engine.trigger(&after.id, BTreeMap::new()).await.unwrap();
    assert!(t.is_ended(&pid).await);
}

#[tokio::test]
async fn test_variables_are_scoped_to_the_execution_tree() {
    let t = TestEngine::with_graphs(vec![fork_join()]);
    let pid = t
        .engine
        .start_process_instance("fork-join", None, vars([("order", VariableValue::from(42))]))
        .await
        .unwrap();
    let a = t.execution_at(&pid, "a").await;
    let b = t.execution_at(&pid, "b").await;

    // Inherited from the process instance.
    assert_eq!(
        t.engine.variable(&a.id, "order").await.unwrap(),
        Some(VariableValue::from(42))
    );
    assert_eq!(t.engine.variable_local(&a.id, "order").await.unwrap(), None);

    // Local to one branch.
    t.engine.set_variable_local(&a.id, "note", "from a").await.unwrap();
    assert_eq!(
        t.engine.variable(&a.id, "note").await.unwrap(),
        Some(VariableValue::from("from a"))
    );
    assert_eq!(t.engine.variable(&b.id, "note").await.unwrap(), None);

    // Non-local writes update the defining scope.
    t.engine.set_variable(&b.id, "order", 43).await.unwrap();
    assert_eq!(
        t.engine.variable_local(&pid, "order").await.unwrap(),
        Some(VariableValue::from(43))
    );

    // Without a definer they land on the nearest scope.
    t.engine.set_variable(&b.id, "fresh", true).await.unwrap();
    assert_eq!(
        t.engine.variable_local(&pid, "fresh").await.unwrap(),
        Some(VariableValue::from(true))
    );

    let all = t.engine.variables(&a.id).await.unwrap();
    assert_eq!(all.len(), 3);

    assert!(t.engine.remove_variable(&a.id, "note").await.unwrap());
    assert!(!t.engine.remove_variable(&a.id, "note").await.unwrap());
}

#[tokio::test]
async fn test_invalid_variable_name_is_rejected() {
    let t = TestEngine::with_graphs(vec![approval()]);
    let pid = t.start("approval").await;

    let err = t.engine.set_variable(&pid, "", 1).await.unwrap_err();

    assert!(matches!(err, EngineError::Validation { .. }));
}

#[tokio::test]
async fn test_service_task_writes_variables() {
    let graph = FlowGraphBuilder::new("service")
        .start_event("start")
        .service_task("compute", "compute")
        .user_task("review")
        .end_event("end")
        .flow("start", "compute")
        .flow("compute", "review")
        .flow("review", "end")
        .build()
        .unwrap();
    let delegate = CountingDelegate::writing("total", 99);
    let t = TestEngine::builder()
        .graph(graph)
        .delegate("compute", delegate.clone())
        .build();

    let pid = t.start("service").await;

    assert_eq!(delegate.calls(), 1);
    t.execution_at(&pid, "review").await;
    assert_eq!(
        t.engine.variable(&pid, "total").await.unwrap(),
        Some(VariableValue::from(99))
    );
}

#[tokio::test]
async fn test_failing_service_task_rolls_back_whole_unit_of_work() {
    let graph = FlowGraphBuilder::new("failing")
        .start_event("start")
        .service_task("compute", "compute")
        .end_event("end")
        .flow("start", "compute")
        .flow("compute", "end")
        .build()
        .unwrap();
    let delegate = CountingDelegate::failing();
    let t = TestEngine::builder()
        .graph(graph)
        .delegate("compute", delegate.clone())
        .build();
    let mut events = t.engine.subscribe();

    let result = t
        .engine
        .start_process_instance("failing", None, vars([("input", VariableValue::from(1))]))
        .await;

    assert!(matches!(
        result,
        Err(EngineError::JobExecutionFailure { .. })
    ));
    assert_eq!(delegate.calls(), 1);
    assert!(t.engine.process_instances(None, 10).await.unwrap().is_empty());
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn test_missing_delegate_fails_start() {
    let graph = FlowGraphBuilder::new("no-delegate")
        .start_event("start")
        .service_task("compute", "nobody")
        .end_event("end")
        .flow("start", "compute")
        .flow("compute", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);

    let err = t
        .engine
        .start_process_instance("no-delegate", None, BTreeMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::DelegateNotFound { .. }));
}

#[tokio::test]
async fn test_sub_process_completes_into_parent() {
    let graph = FlowGraphBuilder::new("with-sub")
        .start_event("start")
        .enter_sub_process("sub", "inner_start")
        .start_event("inner_start")
        .user_task("inner_task")
        .end_event("inner_end")
        .exit_sub_process()
        .user_task("after")
        .end_event("end")
        .flow("start", "sub")
        .flow("inner_start", "inner_task")
        .flow("inner_task", "inner_end")
        .flow("sub", "after")
        .flow("after", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let pid = t.start("with-sub").await;

    let inner = t.execution_at(&pid, "inner_task").await;
    assert_ne!(inner.id, pid);
    assert!(inner.is_scope && !inner.is_concurrent);
    assert_eq!(inner.parent_id.as_deref(), Some(pid.as_str()));
    t.engine
        .set_variable_local(&inner.id, "scratch", "tmp")
        .await
        .unwrap();

    t.engine.trigger(&inner.id, BTreeMap::new()).await.unwrap();

    let after = t.execution_at(&pid, "after").await;
    assert_eq!(after.id, pid);
    assert!(t.engine.execution(&inner.id).await.unwrap().is_none());
    assert_eq!(t.engine.variable(&pid, "scratch").await.unwrap(), None);
}

#[tokio::test]
async fn test_delete_process_instance_cascades() {
    let graph = FlowGraphBuilder::new("waiting")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("review")
        .timer_catch("wait", Duration::from_secs(3600))
        .signal_catch("signal", "go")
        .end_event("end")
        .flow("start", "fork")
        .flow("fork", "review")
        .flow("fork", "wait")
        .flow("fork", "signal")
        .flow("review", "end")
        .flow("wait", "end")
        .flow("signal", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let pid = t
        .engine
        .start_process_instance("waiting", None, vars([("x", VariableValue::from(1))]))
        .await
        .unwrap();
    assert_eq!(t.executions(&pid).await.len(), 4);
    assert_eq!(t.jobs_of(&pid).await.len(), 1);
    assert_eq!(t.subscription_count(&pid).await, 1);
    let mut events = t.engine.subscribe();

    t.engine
        .delete_process_instance(&pid, Some("cancelled by test"))
        .await
        .unwrap();

    assert!(t.is_ended(&pid).await);
    assert!(t.jobs_of(&pid).await.is_empty());
    assert_eq!(t.subscription_count(&pid).await, 0);
    assert!(
        t.persistence
            .find_variables_by_process_instance(&pid)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        events.try_recv().unwrap(),
        EngineEvent::ProcessInstanceDeleted {
            process_instance_id: pid,
            reason: Some("cancelled by test".into()),
        }
    );
}

#[tokio::test]
async fn test_delete_requires_process_instance_id() {
    let t = TestEngine::with_graphs(vec![fork_join()]);
    let pid = t.start("fork-join").await;
    let branch = t.execution_at(&pid, "a").await;

    let err = t
        .engine
        .delete_process_instance(&branch.id, None)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation { .. }));
    assert_eq!(t.executions(&pid).await.len(), 3);
}

#[tokio::test]
async fn test_suspended_instance_rejects_trigger_and_parks_jobs() {
    let graph = FlowGraphBuilder::new("suspendable")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("review")
        .timer_catch("wait", Duration::from_secs(60))
        .parallel_gateway("join")
        .end_event("end")
        .flow("start", "fork")
        .flow("fork", "review")
        .flow("fork", "wait")
        .flow("review", "join")
        .flow("wait", "join")
        .flow("join", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let pid = t.start("suspendable").await;
    let review = t.execution_at(&pid, "review").await;

    t.engine.suspend_process_instance(&pid).await.unwrap();

    assert!(t.executions(&pid).await.iter().all(|e| e.is_suspended));
    assert!(
        t.jobs_of(&pid)
            .await
            .iter()
            .all(|j| j.kind == JobKind::Suspended)
    );
    let err = t.engine.trigger(&review.id, BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalStateTransition { .. }));

    t.advance(Duration::from_secs(120));
    assert_eq!(t.run_jobs().await, 0);

    t.engine.activate_process_instance(&pid).await.unwrap();
    assert_eq!(t.jobs_of(&pid).await[0].kind, JobKind::Ready);
    assert_eq!(t.run_jobs().await, 1);

    t.engine.trigger(&review.id, BTreeMap::new()).await.unwrap();
    assert!(t.is_ended(&pid).await);
}

#[tokio::test]
async fn test_signal_resumes_every_subscribed_execution() {
    let graph = FlowGraphBuilder::new("signal-wait")
        .start_event("start")
        .signal_catch("wait", "go")
        .end_event("end")
        .flow("start", "wait")
        .flow("wait", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let first = t.start("signal-wait").await;
    let second = t.start("signal-wait").await;

    assert_eq!(t.engine.signal("other", BTreeMap::new()).await.unwrap(), 0);
    let delivered = t
        .engine
        .signal("go", vars([("reason", VariableValue::from("released"))]))
        .await
        .unwrap();

    assert_eq!(delivered, 2);
    assert!(t.is_ended(&first).await);
    assert!(t.is_ended(&second).await);
}

#[tokio::test]
async fn test_signal_skips_suspended_execution() {
    let graph = FlowGraphBuilder::new("signal-wait")
        .start_event("start")
        .signal_catch("wait", "go")
        .user_task("after")
        .end_event("end")
        .flow("start", "wait")
        .flow("wait", "after")
        .flow("after", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let running = t.start("signal-wait").await;
    let suspended = t.start("signal-wait").await;
    t.engine.suspend_process_instance(&suspended).await.unwrap();

    assert_eq!(t.engine.signal("go", BTreeMap::new()).await.unwrap(), 1);
    t.execution_at(&running, "after").await;
    assert_eq!(t.subscription_count(&suspended).await, 1);

    t.engine.activate_process_instance(&suspended).await.unwrap();
    assert_eq!(t.engine.signal("go", BTreeMap::new()).await.unwrap(), 1);
    t.execution_at(&suspended, "after").await;
}

#[tokio::test]
async fn test_message_correlates_to_exactly_one_execution() {
    let graph = FlowGraphBuilder::new("payment")
        .start_event("start")
        .message_catch("wait", "paid")
        .user_task("ship")
        .end_event("end")
        .flow("start", "wait")
        .flow("wait", "ship")
        .flow("ship", "end")
        .build()
        .unwrap();
    let t = TestEngine::with_graphs(vec![graph]);
    let order_a = t
        .engine
        .start_process_instance("payment", Some("order-a"), BTreeMap::new())
        .await
        .unwrap();
    let order_b = t
        .engine
        .start_process_instance("payment", Some("order-b"), BTreeMap::new())
        .await
        .unwrap();

    let err = t
        .engine
        .correlate_message("paid", None, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MessageCorrelation { matches: 2, .. }));

    let err = t
        .engine
        .correlate_message("refunded", None, BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MessageCorrelation { matches: 0, .. }));

    let resumed = t
        .engine
        .correlate_message("paid", Some("order-a"), vars([("amount", VariableValue::from(10))]))
        .await
        .unwrap();

    assert_eq!(resumed, order_a);
    t.execution_at(&order_a, "ship").await;
    assert_eq!(
        t.engine.variable(&order_a, "amount").await.unwrap(),
        Some(VariableValue::from(10))
    );
    assert_eq!(t.subscription_count(&order_b).await, 1);
}

#[tokio::test]
async fn test_process_instances_lists_running_roots() {
    let t = TestEngine::with_graphs(vec![approval(), fork_join()]);
    t.start("approval").await;
    t.start("approval").await;
    t.start("fork-join").await;

    let all = t.engine.process_instances(None, 10).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|e| e.is_process_instance()));

    let approvals = t
        .engine
        .process_instances(Some("approval"), 10)
        .await
        .unwrap();
    assert_eq!(approvals.len(), 2);
}
