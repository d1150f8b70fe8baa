// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow graphs interpreted by the runtime.
//!
//! A [`FlowDefinition`] is the serialized form (JSON documents, or built in
//! code with [`FlowGraphBuilder`]). [`FlowGraph::compile`] validates it and
//! indexes incoming and outgoing flows per activity. Graphs are handed to the
//! runtime through a [`ModelResolver`].

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::persistence::VariableValue;

// ============================================================================
// Definition types
// ============================================================================

/// Behaviour attached to an activity, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ActivityKind {
    /// Entry point of a process or sub-process.
    StartEvent,
    /// Ends the execution that reaches it.
    EndEvent,
    /// Pass-through activity.
    Task,
    /// Invokes a registered activity delegate.
    ServiceTask {
        /// Delegate registry key.
        delegate: String,
    },
    /// Waits until the execution is triggered.
    UserTask,
    /// Takes the first outgoing flow whose condition holds.
    ExclusiveGateway {
        /// Flow taken when no condition holds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    /// Forks on all outgoing flows and joins all incoming ones.
    ParallelGateway,
    /// Waits for a timer job.
    TimerCatch {
        /// Delay from activity start until the timer fires.
        duration_ms: u64,
    },
    /// Waits for an external worker to complete a task on `topic`.
    ExternalTask {
        /// Topic external workers fetch from.
        topic: String,
        /// Fetch priority.
        #[serde(default)]
        priority: i64,
    },
    /// Waits for a broadcast signal.
    SignalCatch {
        /// Signal name.
        signal: String,
    },
    /// Waits for a correlated message.
    MessageCatch {
        /// Message name.
        message: String,
    },
    /// Embedded scope with its own start activity.
    SubProcess {
        /// Start activity inside the sub-process.
        start: String,
    },
}

impl ActivityKind {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartEvent => "startEvent",
            Self::EndEvent => "endEvent",
            Self::Task => "task",
            Self::ServiceTask { .. } => "serviceTask",
            Self::UserTask => "userTask",
            Self::ExclusiveGateway { .. } => "exclusiveGateway",
            Self::ParallelGateway => "parallelGateway",
            Self::TimerCatch { .. } => "timerCatch",
            Self::ExternalTask { .. } => "externalTask",
            Self::SignalCatch { .. } => "signalCatch",
            Self::MessageCatch { .. } => "messageCatch",
            Self::SubProcess { .. } => "subProcess",
        }
    }
}

/// A node of the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    /// Unique activity identifier
    pub id: String,

    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Behaviour
    pub kind: ActivityKind,

    /// Persist an async-continuation job before starting the activity.
    #[serde(default)]
    pub async_before: bool,

    /// Persist an async-continuation job before leaving the activity.
    #[serde(default)]
    pub async_after: bool,

    /// Containing sub-process, `None` at the top level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Activity {
    /// Top-level activity without async flags.
    pub fn new(id: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            async_before: false,
            async_after: false,
            parent: None,
        }
    }
}

/// Guard on a sequence flow, evaluated against variables visible from the
/// execution leaving the source activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FlowCondition {
    /// Variable exists and equals `value`.
    Equals {
        /// Variable name.
        variable: String,
        /// Expected value.
        value: VariableValue,
    },
    /// Variable is absent or differs from `value`.
    NotEquals {
        /// Variable name.
        variable: String,
        /// Rejected value.
        value: VariableValue,
    },
    /// Variable is the boolean `true`.
    IsTrue {
        /// Variable name.
        variable: String,
    },
    /// Variable is defined (possibly null).
    Exists {
        /// Variable name.
        variable: String,
    },
}

impl FlowCondition {
    /// Evaluate using `lookup` to resolve variables.
    pub fn evaluate<F>(&self, mut lookup: F) -> bool
    where
        F: FnMut(&str) -> Option<VariableValue>,
    {
        match self {
            Self::Equals { variable, value } => lookup(variable).as_ref() == Some(value),
            Self::NotEquals { variable, value } => lookup(variable).as_ref() != Some(value),
            Self::IsTrue { variable } => lookup(variable).and_then(|v| v.as_bool()) == Some(true),
            Self::Exists { variable } => lookup(variable).is_some(),
        }
    }
}

/// A directed edge between two activities of the same scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceFlow {
    /// Unique flow identifier
    pub id: String,
    /// Source activity
    pub source: String,
    /// Target activity
    pub target: String,
    /// Guard, only honoured on exclusive gateway outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<FlowCondition>,
}

/// Serialized flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Definition identifier referenced by process instances.
    pub id: String,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Top-level start activity.
    pub start: String,
    /// All activities, nested ones included.
    pub activities: Vec<Activity>,
    /// All sequence flows.
    pub flows: Vec<SequenceFlow>,
}

// ============================================================================
// Compiled graph
// ============================================================================

/// A validated, indexed flow graph.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    definition: FlowDefinition,
    activities: HashMap<String, usize>,
    flows: HashMap<String, usize>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
}

/// Longest timer a definition may declare (about 10,000 years).
pub const MAX_TIMER_DURATION_MS: u64 = 10_000 * 365 * 24 * 60 * 60 * 1000;

fn invalid(definition_id: &str, message: impl Into<String>) -> EngineError {
    EngineError::validation(format!("definition '{}'", definition_id), message)
}

impl FlowGraph {
    /// Validate and index a definition.
    pub fn compile(definition: FlowDefinition) -> Result<Self> {
        let def_id = definition.id.clone();
        if def_id.is_empty() {
            return Err(EngineError::validation("id", "definition id must not be empty"));
        }

        let mut activities = HashMap::new();
        for (idx, activity) in definition.activities.iter().enumerate() {
            if activities.insert(activity.id.clone(), idx).is_some() {
                return Err(invalid(
                    &def_id,
                    format!("duplicate activity id '{}'", activity.id),
                ));
            }
        }

        let mut flows = HashMap::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, flow) in definition.flows.iter().enumerate() {
            if flows.insert(flow.id.clone(), idx).is_some() {
                return Err(invalid(&def_id, format!("duplicate flow id '{}'", flow.id)));
            }
            let source = activities
                .get(&flow.source)
                .map(|&i| &definition.activities[i])
                .ok_or_else(|| {
                    invalid(
                        &def_id,
                        format!("flow '{}' has unknown source '{}'", flow.id, flow.source),
                    )
                })?;
            let target = activities
                .get(&flow.target)
                .map(|&i| &definition.activities[i])
                .ok_or_else(|| {
                    invalid(
                        &def_id,
                        format!("flow '{}' has unknown target '{}'", flow.id, flow.target),
                    )
                })?;
            if source.parent != target.parent {
                return Err(invalid(
                    &def_id,
                    format!("flow '{}' crosses a sub-process boundary", flow.id),
                ));
            }
            outgoing.entry(flow.source.clone()).or_default().push(idx);
            incoming.entry(flow.target.clone()).or_default().push(idx);
        }

        match activities.get(&definition.start).map(|&i| &definition.activities[i]) {
            Some(start) if start.parent.is_none() => {}
            Some(_) => {
                return Err(invalid(
                    &def_id,
                    format!("start activity '{}' is nested", definition.start),
                ));
            }
            None => {
                return Err(invalid(
                    &def_id,
                    format!("start activity '{}' does not exist", definition.start),
                ));
            }
        }

        let sub_processes: HashSet<&str> = definition
            .activities
            .iter()
            .filter(|a| matches!(a.kind, ActivityKind::SubProcess { .. }))
            .map(|a| a.id.as_str())
            .collect();

        for activity in &definition.activities {
            if let Some(ref parent) = activity.parent
                && !sub_processes.contains(parent.as_str())
            {
                return Err(invalid(
                    &def_id,
                    format!(
                        "activity '{}' is contained in '{}', which is not a sub-process",
                        activity.id, parent
                    ),
                ));
            }

            match &activity.kind {
                ActivityKind::SubProcess { start } => {
                    let inner = activities.get(start).map(|&i| &definition.activities[i]);
                    if inner.and_then(|a| a.parent.as_deref()) != Some(activity.id.as_str()) {
                        return Err(invalid(
                            &def_id,
                            format!(
                                "sub-process '{}' start '{}' must be an activity inside it",
                                activity.id, start
                            ),
                        ));
                    }
                }
                ActivityKind::ExclusiveGateway {
                    default_flow: Some(default_flow),
                } => {
                    let leaves_gateway = flows
                        .get(default_flow)
                        .map(|&i| definition.flows[i].source == activity.id)
                        .unwrap_or(false);
                    if !leaves_gateway {
                        return Err(invalid(
                            &def_id,
                            format!(
                                "default flow '{}' of gateway '{}' does not leave it",
                                default_flow, activity.id
                            ),
                        ));
                    }
                }
                ActivityKind::TimerCatch { duration_ms }
                    if *duration_ms > MAX_TIMER_DURATION_MS =>
                {
                    return Err(invalid(
                        &def_id,
                        format!(
                            "timer '{}' duration {}ms exceeds the maximum of {}ms",
                            activity.id, duration_ms, MAX_TIMER_DURATION_MS
                        ),
                    ));
                }
                _ => {}
            }
        }

        debug!(
            definition_id = %def_id,
            activities = definition.activities.len(),
            flows = definition.flows.len(),
            "Compiled flow graph"
        );

        Ok(Self {
            definition,
            activities,
            flows,
            outgoing,
            incoming,
        })
    }

    /// Definition identifier.
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// The source definition.
    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    /// Top-level start activity.
    pub fn start_activity(&self) -> &str {
        &self.definition.start
    }

    /// Look up an activity.
    pub fn activity(&self, id: &str) -> Result<&Activity> {
        self.activities
            .get(id)
            .map(|&i| &self.definition.activities[i])
            .ok_or_else(|| invalid(&self.definition.id, format!("unknown activity '{}'", id)))
    }

    /// Look up a flow.
    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.get(id).map(|&i| &self.definition.flows[i])
    }

    /// Flows leaving `activity_id`, in declaration order.
    pub fn outgoing(&self, activity_id: &str) -> Vec<&SequenceFlow> {
        self.outgoing
            .get(activity_id)
            .map(|idxs| idxs.iter().map(|&i| &self.definition.flows[i]).collect())
            .unwrap_or_default()
    }

    /// Number of flows entering `activity_id`.
    pub fn incoming_count(&self, activity_id: &str) -> usize {
        self.incoming.get(activity_id).map(Vec::len).unwrap_or(0)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolves definition ids to compiled graphs.
pub trait ModelResolver: Send + Sync {
    /// Return the graph for `definition_id`.
    fn resolve(&self, definition_id: &str) -> Result<Arc<FlowGraph>>;
}

/// Resolver backed by graphs deployed into memory.
#[derive(Debug, Default)]
pub struct InMemoryModelResolver {
    graphs: RwLock<HashMap<String, Arc<FlowGraph>>>,
}

impl InMemoryModelResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a compiled graph, replacing any graph with the same id.
    pub fn deploy(&self, graph: FlowGraph) -> Arc<FlowGraph> {
        let graph = Arc::new(graph);
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(graph.id().to_string(), graph.clone());
        info!(definition_id = %graph.id(), "Deployed flow graph");
        graph
    }

    /// Compile and deploy a definition.
    pub fn deploy_definition(&self, definition: FlowDefinition) -> Result<Arc<FlowGraph>> {
        Ok(self.deploy(FlowGraph::compile(definition)?))
    }

    /// Deploy every `*.json` flow definition in `dir`. Returns how many were deployed.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            EngineError::validation(dir.display().to_string(), format!("cannot read: {}", e))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        paths.sort();

        for path in &paths {
            let content = std::fs::read_to_string(path).map_err(|e| {
                EngineError::validation(path.display().to_string(), format!("cannot read: {}", e))
            })?;
            let definition: FlowDefinition = serde_json::from_str(&content).map_err(|e| {
                EngineError::Serialization(format!("{}: {}", path.display(), e))
            })?;
            self.deploy_definition(definition)?;
        }

        Ok(paths.len())
    }

    /// Ids of all deployed graphs, sorted.
    pub fn definition_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .graphs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl ModelResolver for InMemoryModelResolver {
    fn resolve(&self, definition_id: &str) -> Result<Arc<FlowGraph>> {
        self.graphs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(definition_id)
            .cloned()
            .ok_or_else(|| EngineError::ProcessDefinitionNotFound {
                definition_id: definition_id.to_string(),
            })
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builds flow graphs in code.
///
/// ```ignore
/// let graph = FlowGraphBuilder::new("order")
///     .start_event("start")
///     .user_task("approve")
///     .end_event("end")
///     .flow("start", "approve")
///     .flow("approve", "end")
///     .build()?;
/// ```
pub struct FlowGraphBuilder {
    id: String,
    start: Option<String>,
    activities: Vec<Activity>,
    flows: Vec<SequenceFlow>,
    parent: Option<String>,
}

impl FlowGraphBuilder {
    /// Start a graph with the given definition id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start: None,
            activities: Vec::new(),
            flows: Vec::new(),
            parent: None,
        }
    }

    /// Add an activity. It is placed inside the sub-process opened with
    /// [`enter_sub_process`](Self::enter_sub_process), if any.
    pub fn activity(mut self, mut activity: Activity) -> Self {
        if activity.parent.is_none() {
            activity.parent = self.parent.clone();
        }
        if self.start.is_none()
            && activity.parent.is_none()
            && activity.kind == ActivityKind::StartEvent
        {
            self.start = Some(activity.id.clone());
        }
        self.activities.push(activity);
        self
    }

    /// Start event.
    pub fn start_event(self, id: &str) -> Self {
        self.activity(Activity::new(id, ActivityKind::StartEvent))
    }

    /// End event.
    pub fn end_event(self, id: &str) -> Self {
        self.activity(Activity::new(id, ActivityKind::EndEvent))
    }

    /// Pass-through task.
    pub fn task(self, id: &str) -> Self {
        self.activity(Activity::new(id, ActivityKind::Task))
    }

    /// Service task calling the delegate registered as `delegate`.
    pub fn service_task(self, id: &str, delegate: &str) -> Self {
        self.activity(Activity::new(
            id,
            ActivityKind::ServiceTask {
                delegate: delegate.to_string(),
            },
        ))
    }

    /// User task (wait state).
    pub fn user_task(self, id: &str) -> Self {
        self.activity(Activity::new(id, ActivityKind::UserTask))
    }

    /// Exclusive gateway.
    pub fn exclusive_gateway(self, id: &str, default_flow: Option<&str>) -> Self {
        self.activity(Activity::new(
            id,
            ActivityKind::ExclusiveGateway {
                default_flow: default_flow.map(str::to_string),
            },
        ))
    }

    /// Parallel gateway.
    pub fn parallel_gateway(self, id: &str) -> Self {
        self.activity(Activity::new(id, ActivityKind::ParallelGateway))
    }

    /// Timer catch event.
    pub fn timer_catch(self, id: &str, duration: Duration) -> Self {
        self.activity(Activity::new(
            id,
            ActivityKind::TimerCatch {
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            },
        ))
    }

    /// External task on `topic`.
    pub fn external_task(self, id: &str, topic: &str) -> Self {
        self.activity(Activity::new(
            id,
            ActivityKind::ExternalTask {
                topic: topic.to_string(),
                priority: 0,
            },
        ))
    }

    /// Signal catch event.
    pub fn signal_catch(self, id: &str, signal: &str) -> Self {
        self.activity(Activity::new(
            id,
            ActivityKind::SignalCatch {
                signal: signal.to_string(),
            },
        ))
    }

    /// Message catch event.
    pub fn message_catch(self, id: &str, message: &str) -> Self {
        self.activity(Activity::new(
            id,
            ActivityKind::MessageCatch {
                message: message.to_string(),
            },
        ))
    }

    /// Add a sub-process and place subsequently added activities inside it
    /// until [`exit_sub_process`](Self::exit_sub_process).
    pub fn enter_sub_process(mut self, id: &str, start: &str) -> Self {
        self = self.activity(Activity::new(
            id,
            ActivityKind::SubProcess {
                start: start.to_string(),
            },
        ));
        self.parent = Some(id.to_string());
        self
    }

    /// Leave the sub-process opened last.
    pub fn exit_sub_process(mut self) -> Self {
        let parent = self.parent.take();
        self.parent = parent.and_then(|p| {
            self.activities
                .iter()
                .find(|a| a.id == p)
                .and_then(|a| a.parent.clone())
        });
        self
    }

    /// Mark the activity `id` as async-before.
    pub fn async_before(mut self, id: &str) -> Self {
        if let Some(activity) = self.activities.iter_mut().find(|a| a.id == id) {
            activity.async_before = true;
        }
        self
    }

    /// Mark the activity `id` as async-after.
    pub fn async_after(mut self, id: &str) -> Self {
        if let Some(activity) = self.activities.iter_mut().find(|a| a.id == id) {
            activity.async_after = true;
        }
        self
    }

    /// Override the start activity.
    pub fn start(mut self, id: &str) -> Self {
        self.start = Some(id.to_string());
        self
    }

    /// Unconditional flow; its id is `source->target`.
    pub fn flow(self, source: &str, target: &str) -> Self {
        let id = format!("{}->{}", source, target);
        self.flow_with_id(&id, source, target, None)
    }

    /// Guarded flow; its id is `source->target`.
    pub fn conditional_flow(self, source: &str, target: &str, condition: FlowCondition) -> Self {
        let id = format!("{}->{}", source, target);
        self.flow_with_id(&id, source, target, Some(condition))
    }

    /// Flow with an explicit id.
    pub fn flow_with_id(
        mut self,
        id: &str,
        source: &str,
        target: &str,
        condition: Option<FlowCondition>,
    ) -> Self {
        self.flows.push(SequenceFlow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition,
        });
        self
    }

    /// The uncompiled definition.
    pub fn into_definition(self) -> FlowDefinition {
        FlowDefinition {
            id: self.id,
            name: None,
            start: self.start.unwrap_or_default(),
            activities: self.activities,
            flows: self.flows,
        }
    }

    /// Compile the graph.
    pub fn build(self) -> Result<FlowGraph> {
        FlowGraph::compile(self.into_definition())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork_join() -> FlowGraphBuilder {
        FlowGraphBuilder::new("fork-join")
            .start_event("start")
            .parallel_gateway("fork")
            .user_task("a")
            .user_task("b")
            .parallel_gateway("join")
            .end_event("end")
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "end")
    }

    #[test]
    fn test_compile_indexes_flows() {
        let graph = fork_join().build().unwrap();

        assert_eq!(graph.id(), "fork-join");
        assert_eq!(graph.start_activity(), "start");
        let targets: Vec<&str> = graph
            .outgoing("fork")
            .iter()
            .map(|f| f.target.as_str())
            .collect();
        assert_eq!(targets, vec!["a", "b"]);
        assert_eq!(graph.incoming_count("join"), 2);
        assert_eq!(graph.incoming_count("start"), 0);
        assert!(graph.outgoing("end").is_empty());
        assert!(graph.activity("missing").is_err());
    }

    #[test]
    fn test_compile_rejects_unknown_flow_target() {
        let err = FlowGraphBuilder::new("broken")
            .start_event("start")
            .flow("start", "nowhere")
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_compile_rejects_unrepresentable_timer() {
        let err = FlowGraphBuilder::new("slow")
            .start_event("start")
            .timer_catch("wait", Duration::from_secs(400_000 * 365 * 24 * 3600))
            .flow("start", "wait")
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("exceeds the maximum"));

        FlowGraphBuilder::new("slow")
            .start_event("start")
            .timer_catch("wait", Duration::from_millis(MAX_TIMER_DURATION_MS))
            .flow("start", "wait")
            .build()
            .unwrap();
    }

    #[test]
    fn test_compile_rejects_duplicate_activity() {
        let err = FlowGraphBuilder::new("dup")
            .start_event("start")
            .task("start")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate activity id"));
    }

    #[test]
    fn test_compile_rejects_foreign_default_flow() {
        let err = FlowGraphBuilder::new("gw")
            .start_event("start")
            .exclusive_gateway("gw", Some("start->gw"))
            .end_event("end")
            .flow("start", "gw")
            .flow("gw", "end")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("does not leave it"));
    }

    #[test]
    fn test_sub_process_containment() {
        let graph = FlowGraphBuilder::new("nested")
            .start_event("start")
            .enter_sub_process("sub", "sub-start")
            .start_event("sub-start")
            .end_event("sub-end")
            .flow("sub-start", "sub-end")
            .exit_sub_process()
            .end_event("end")
            .flow("start", "sub")
            .flow("sub", "end")
            .build()
            .unwrap();

        assert_eq!(graph.start_activity(), "start");
        assert_eq!(
            graph.activity("sub-start").unwrap().parent.as_deref(),
            Some("sub")
        );
        assert!(graph.activity("end").unwrap().parent.is_none());

        let err = FlowGraphBuilder::new("crossing")
            .start_event("start")
            .enter_sub_process("sub", "sub-start")
            .start_event("sub-start")
            .exit_sub_process()
            .flow("start", "sub-start")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("sub-process boundary"));
    }

    #[test]
    fn test_definition_json_shape() {
        let json = serde_json::json!({
            "id": "approval",
            "start": "start",
            "activities": [
                {"id": "start", "kind": {"type": "startEvent"}},
                {"id": "check", "kind": {"type": "exclusiveGateway", "defaultFlow": "rejected"}},
                {"id": "wait", "kind": {"type": "timerCatch", "durationMs": 500}, "asyncBefore": true},
                {"id": "end", "kind": {"type": "endEvent"}}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "check"},
                {"id": "approved", "source": "check", "target": "wait",
                 "condition": {"op": "isTrue", "variable": "approved"}},
                {"id": "rejected", "source": "check", "target": "end"},
                {"id": "f2", "source": "wait", "target": "end"}
            ]
        });

        let definition: FlowDefinition = serde_json::from_value(json).unwrap();
        let graph = FlowGraph::compile(definition).unwrap();
        let wait = graph.activity("wait").unwrap();
        assert!(wait.async_before);
        assert_eq!(wait.kind, ActivityKind::TimerCatch { duration_ms: 500 });
        assert_eq!(
            graph.flow("approved").unwrap().condition,
            Some(FlowCondition::IsTrue {
                variable: "approved".to_string()
            })
        );
    }

    #[test]
    fn test_flow_condition_evaluate() {
        let lookup = |name: &str| match name {
            "amount" => Some(VariableValue::Integer(10)),
            "approved" => Some(VariableValue::Boolean(true)),
            "note" => Some(VariableValue::Null),
            _ => None,
        };

        let equals = FlowCondition::Equals {
            variable: "amount".to_string(),
            value: VariableValue::Integer(10),
        };
        assert!(equals.evaluate(lookup));

        let not_equals = FlowCondition::NotEquals {
            variable: "missing".to_string(),
            value: VariableValue::Integer(10),
        };
        assert!(not_equals.evaluate(lookup));

        assert!(FlowCondition::IsTrue {
            variable: "approved".to_string()
        }
        .evaluate(lookup));
        assert!(!FlowCondition::IsTrue {
            variable: "amount".to_string()
        }
        .evaluate(lookup));
        assert!(FlowCondition::Exists {
            variable: "note".to_string()
        }
        .evaluate(lookup));
    }

    #[test]
    fn test_resolver_deploy_and_load_dir() {
        let resolver = InMemoryModelResolver::new();
        assert_eq!(
            resolver.resolve("fork-join").unwrap_err().error_code(),
            "PROCESS_DEFINITION_NOT_FOUND"
        );

        resolver.deploy(fork_join().build().unwrap());
        assert_eq!(resolver.resolve("fork-join").unwrap().id(), "fork-join");

        let dir = tempfile::tempdir().unwrap();
        let definition = FlowGraphBuilder::new("from-disk")
            .start_event("start")
            .end_event("end")
            .flow("start", "end")
            .into_definition();
        std::fs::write(
            dir.path().join("from-disk.json"),
            serde_json::to_string_pretty(&definition).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a graph").unwrap();

        assert_eq!(resolver.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(resolver.definition_ids(), vec!["fork-join", "from-disk"]);
    }
}
