use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use crate::event::{PassMode, WorkflowEvent};
use crate::graph::{EdgeId, EdgeState, EdgeStatus, NodeId, NodeState, NodeStatus};

pub const DEFAULT_MAX_ITERATIONS: u32 = 6;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    pub max_iterations: u32,
    pub history_limit: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IterationCounter {
    pub current: u32,
    pub max: u32,
    pub total_completed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentAction {
    pub tool: String,
    pub parameters: Value,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub tools_executed: u32,
    pub results_found: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingFinish {
    pub report_length: u64,
    pub num_sources: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub event: &'static str,
    pub iteration: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowState {
    pub session_id: Option<String>,
    pub query: Option<String>,
    pub iteration: IterationCounter,
    /// Set by a rejected finish guard: `think` and the back-edge are already
    /// live, so the next `iteration_start` must not count them again.
    pub looping_from_evaluate: bool,
    pub nodes: BTreeMap<NodeId, NodeState>,
    pub edges: BTreeMap<EdgeId, EdgeState>,
    pub current_action: Option<CurrentAction>,
    pub stats: SessionStats,
    pub event_history: VecDeque<HistoryEntry>,
    pub pending_finish: Option<PendingFinish>,
    #[serde(skip)]
    config: WorkflowConfig,
}

impl WorkflowState {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            session_id: None,
            query: None,
            iteration: IterationCounter {
                current: 0,
                max: config.max_iterations,
                total_completed: 0,
            },
            looping_from_evaluate: false,
            nodes: NodeId::ALL
                .into_iter()
                .map(|id| (id, NodeState::default()))
                .collect(),
            edges: EdgeId::ALL
                .into_iter()
                .map(|id| (id, EdgeState::default()))
                .collect(),
            current_action: None,
            stats: SessionStats::default(),
            event_history: VecDeque::new(),
            pending_finish: None,
            config,
        }
    }

    pub fn node(&self, id: NodeId) -> &NodeState {
        // every id is seeded in `new`
        &self.nodes[&id]
    }

    pub fn edge(&self, id: EdgeId) -> &EdgeState {
        &self.edges[&id]
    }

    /// Edges currently showing the moving token; at most one.
    pub fn flowing_edges(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges
            .iter()
            .filter(|(_, edge)| edge.show_flow_animation)
            .map(|(id, _)| *id)
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn first_active_node(&self) -> Option<NodeId> {
        NodeId::ALL
            .into_iter()
            .find(|id| self.node(*id).status == NodeStatus::Active)
    }

    fn node_mut(&mut self, id: NodeId) -> &mut NodeState {
        self.nodes.entry(id).or_default()
    }

    fn edge_mut(&mut self, id: EdgeId) -> &mut EdgeState {
        self.edges.entry(id).or_default()
    }

    fn node_is(&self, id: NodeId, status: NodeStatus) -> bool {
        self.node(id).status == status
    }

    fn edge_is(&self, id: EdgeId, status: EdgeStatus) -> bool {
        self.edge(id).status == status
    }

    fn activate_node(&mut self, id: NodeId, count_visit: bool) {
        let iteration = self.iteration.current;
        self.node_mut(id).activate(iteration, count_visit);
    }

    fn complete_node(&mut self, id: NodeId, at: DateTime<Utc>) {
        self.node_mut(id).complete(at);
    }

    fn complete_if_active(&mut self, id: NodeId, at: DateTime<Utc>) {
        if self.node_is(id, NodeStatus::Active) {
            self.complete_node(id, at);
        }
    }

    /// Moves the single flow token onto `id`.
    fn activate_edge(&mut self, id: EdgeId, at: DateTime<Utc>) {
        for edge in self.edges.values_mut() {
            edge.show_flow_animation = false;
        }
        let edge = self.edge_mut(id);
        edge.set_status(EdgeStatus::Active);
        edge.show_flow_animation = true;
        edge.transition_count += 1;
        edge.last_transition_at = Some(at);
    }

    fn set_edge(&mut self, id: EdgeId, status: EdgeStatus) {
        self.edge_mut(id).set_status(status);
    }

    fn complete_edge_if_active(&mut self, id: EdgeId) {
        if self.edge_is(id, EdgeStatus::Active) {
            self.set_edge(id, EdgeStatus::Completed);
        }
    }

    fn clear_flow(&mut self) {
        for edge in self.edges.values_mut() {
            edge.show_flow_animation = false;
        }
    }

    fn record(&mut self, event: &'static str, at: DateTime<Utc>) {
        self.event_history.push_back(HistoryEntry {
            event,
            iteration: self.iteration.current,
            at,
        });
        while self.event_history.len() > self.config.history_limit {
            self.event_history.pop_front();
        }
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new(WorkflowConfig::default())
    }
}

/// Pure transition function of the workflow graph.
pub fn reduce(mut state: WorkflowState, event: &WorkflowEvent, at: DateTime<Utc>) -> WorkflowState {
    match event {
        WorkflowEvent::SessionStart {
            session_id,
            query,
            max_iterations,
        } => {
            state = WorkflowState::new(state.config.clone());
            if let Some(max) = max_iterations {
                state.iteration.max = *max;
            }
            state.session_id = Some(session_id.clone());
            state.query = query.clone();
            state.activate_node(NodeId::Start, true);
        }
        WorkflowEvent::IterationStart { iteration, mode } => {
            on_iteration_start(&mut state, *iteration, *mode, at)
        }
        WorkflowEvent::Thought { content } => {
            state.looping_from_evaluate = false;
            state.complete_node(NodeId::Think, at);
            if let Some(content) = content {
                state.node_mut(NodeId::Think).set_meta("thought", content.as_str());
            }
            if !state.node_is(NodeId::Operate, NodeStatus::Active) {
                state.activate_node(NodeId::Operate, true);
            }
            state.complete_edge_if_active(EdgeId::StartThink);
            state.complete_edge_if_active(EdgeId::ReflectThink);
            state.activate_edge(EdgeId::ThinkOperate, at);
        }
        WorkflowEvent::Action { tool, parameters } => {
            state.complete_if_active(NodeId::Reflect, at);
            if !state.node_is(NodeId::Operate, NodeStatus::Active) {
                state.activate_node(NodeId::Operate, true);
                state.activate_edge(EdgeId::ThinkOperate, at);
            }
            let operate = state.node_mut(NodeId::Operate);
            operate.set_meta("tool", tool.as_str());
            operate.set_meta("parameters", parameters.clone());
            state.current_action = Some(CurrentAction {
                tool: tool.clone(),
                parameters: parameters.clone(),
                started_at: at,
            });
        }
        WorkflowEvent::ToolExecution {
            tool,
            success,
            duration_ms,
            result_count,
            summary,
        } => {
            state.stats.tools_executed += 1;
            state.stats.results_found += result_count;
            state.current_action = None;
            let operate = state.node_mut(NodeId::Operate);
            operate.set_meta("tool", tool.as_str());
            operate.set_meta("result_count", *result_count);
            if let Some(duration_ms) = duration_ms {
                operate.set_meta("duration_ms", *duration_ms);
            }
            if *success {
                state.complete_node(NodeId::Operate, at);
                state.activate_node(NodeId::Reflect, true);
                state.node_mut(NodeId::Reflect).set_meta("decision", "pending");
                state.complete_edge_if_active(EdgeId::ThinkOperate);
                state.activate_edge(EdgeId::OperateReflect, at);
            } else {
                let message = summary
                    .clone()
                    .unwrap_or_else(|| format!("{tool} failed"));
                state.node_mut(NodeId::Operate).fail(message);
                state.complete_edge_if_active(EdgeId::ThinkOperate);
                state.set_edge(EdgeId::OperateReflect, EdgeStatus::Disabled);
            }
        }
        WorkflowEvent::Observation { content } => {
            state.node_mut(NodeId::Reflect).set_meta("observation", content.as_str());
        }
        WorkflowEvent::FinishGuard { approved, feedback } => {
            on_finish_guard(&mut state, *approved, feedback.as_deref(), at)
        }
        WorkflowEvent::EvaluatorStart => {
            state.complete_if_active(NodeId::Reflect, at);
            if !state.node_is(NodeId::Evaluator, NodeStatus::Active) {
                state.activate_node(NodeId::Evaluator, true);
            }
            if !state.edge_is(EdgeId::ReflectEvaluator, EdgeStatus::Active) {
                state.activate_edge(EdgeId::ReflectEvaluator, at);
            }
        }
        WorkflowEvent::EvaluatorComplete {
            scores,
            duration_seconds,
        } => {
            let evaluator = state.node_mut(NodeId::Evaluator);
            evaluator.set_meta("scores", scores.clone());
            if let Some(duration) = duration_seconds {
                evaluator.set_meta("duration_seconds", *duration);
            }
            state.complete_node(NodeId::Evaluator, at);
            state.complete_edge_if_active(EdgeId::ReflectEvaluator);
            state.activate_edge(EdgeId::EvaluatorFinish, at);
            state.set_edge(EdgeId::EvaluatorFinish, EdgeStatus::Completed);
            let finish = state.node_mut(NodeId::Finish);
            finish.visit_count += 1;
            finish.complete(at);
            if let Some(pending) = state.pending_finish.take() {
                let finish = state.node_mut(NodeId::Finish);
                finish.set_meta("report_length", pending.report_length);
                finish.set_meta("num_sources", pending.num_sources);
            }
        }
        WorkflowEvent::Finish {
            report_length,
            num_sources,
        } => {
            for id in [NodeId::Think, NodeId::Operate, NodeId::Reflect] {
                state.complete_if_active(id, at);
            }
            if state.edge_is(EdgeId::ReflectEvaluator, EdgeStatus::Idle)
                || state.edge_is(EdgeId::ReflectEvaluator, EdgeStatus::Disabled)
            {
                state.activate_edge(EdgeId::ReflectEvaluator, at);
            }
            state.pending_finish = Some(PendingFinish {
                report_length: *report_length,
                num_sources: *num_sources,
            });
        }
        WorkflowEvent::Error { message, node } => {
            let target = node
                .or_else(|| state.first_active_node())
                .unwrap_or(NodeId::Operate);
            state.node_mut(target).fail(message.clone());
        }
        WorkflowEvent::SessionComplete {
            status,
            duration_seconds,
            total_tokens,
            total_cost_usd,
        } => {
            let stats = &mut state.stats;
            stats.status = status.clone().or_else(|| Some("completed".to_string()));
            stats.duration_seconds = duration_seconds.or(stats.duration_seconds);
            stats.total_tokens = total_tokens.or(stats.total_tokens);
            stats.total_cost_usd = total_cost_usd.or(stats.total_cost_usd);
        }
        WorkflowEvent::SessionFailed { error } => {
            state.stats.status = Some("failed".to_string());
            state.stats.error = Some(error.clone());
        }
    }
    state.record(event.name(), at);
    state
}

fn on_iteration_start(state: &mut WorkflowState, iteration: Option<u32>, mode: PassMode, at: DateTime<Utc>) {
    let previous = state.iteration.current;
    let index = iteration
        .filter(|index| *index > 0)
        .unwrap_or(previous.saturating_add(1));
    state.iteration.current = previous.max(index);

    if state.node_is(NodeId::Reflect, NodeStatus::Active) {
        let reflect = state.node_mut(NodeId::Reflect);
        if reflect.metadata.get("decision").map_or(true, |d| d == "pending") {
            reflect.set_meta("decision", "iterate");
        }
        reflect.complete(at);
    }

    if state.looping_from_evaluate {
        // the rejected guard already moved the token onto the back-edge
        state.looping_from_evaluate = false;
        clear_forward_path(state);
        let current = state.iteration.current;
        state.node_mut(NodeId::Think).current_visit_iteration = Some(current);
        return;
    }

    if index > 1 && previous > 0 {
        state.iteration.total_completed = state.iteration.total_completed.saturating_add(1);
    }

    if mode == PassMode::AutoFinish {
        state.complete_if_active(NodeId::Think, at);
        state.complete_if_active(NodeId::Operate, at);
        state.activate_node(NodeId::Reflect, true);
        state.node_mut(NodeId::Reflect).set_meta("mode", "auto_finish");
        state.clear_flow();
        return;
    }

    clear_forward_path(state);
    state.activate_node(NodeId::Think, true);
    if index <= 1 || previous == 0 {
        state.complete_if_active(NodeId::Start, at);
        state.activate_edge(EdgeId::StartThink, at);
    } else {
        state.set_edge(EdgeId::StartThink, EdgeStatus::Completed);
        state.activate_edge(EdgeId::ReflectThink, at);
    }
}

/// Every node after think back to idle, forward edges included; the
/// back-edge keeps its state.
fn clear_forward_path(state: &mut WorkflowState) {
    for id in NodeId::DOWNSTREAM {
        state.node_mut(id).reset();
    }
    for id in [
        EdgeId::ThinkOperate,
        EdgeId::OperateReflect,
        EdgeId::ReflectEvaluator,
        EdgeId::EvaluatorFinish,
    ] {
        state.set_edge(id, EdgeStatus::Idle);
    }
}

fn on_finish_guard(state: &mut WorkflowState, approved: bool, feedback: Option<&str>, at: DateTime<Utc>) {
    if let Some(feedback) = feedback {
        state.node_mut(NodeId::Reflect).set_meta("feedback", feedback);
    }
    if approved {
        state.looping_from_evaluate = false;
        state.node_mut(NodeId::Reflect).set_meta("decision", "finish");
        state.complete_node(NodeId::Reflect, at);
        state.complete_if_active(NodeId::Think, at);
        state.complete_if_active(NodeId::Operate, at);
        state.complete_edge_if_active(EdgeId::OperateReflect);
        state.set_edge(EdgeId::ReflectThink, EdgeStatus::Disabled);
        state.activate_edge(EdgeId::ReflectEvaluator, at);
        return;
    }

    state.iteration.current = state.iteration.current.saturating_add(1);
    state.iteration.total_completed = state.iteration.total_completed.saturating_add(1);
    state.node_mut(NodeId::Reflect).set_meta("decision", "iterate");
    state.complete_node(NodeId::Reflect, at);
    state.node_mut(NodeId::Operate).reset();
    state.set_edge(EdgeId::ThinkOperate, EdgeStatus::Idle);
    state.set_edge(EdgeId::OperateReflect, EdgeStatus::Idle);
    state.set_edge(EdgeId::StartThink, EdgeStatus::Completed);
    state.activate_node(NodeId::Think, true);
    state.activate_edge(EdgeId::ReflectThink, at);
    state.looping_from_evaluate = true;
}

/// Convenience for callers that keep the state by reference.
pub fn apply_in_place(state: &mut WorkflowState, event: &WorkflowEvent, at: DateTime<Utc>) {
    let current = std::mem::take(state);
    *state = reduce(current, event, at);
}
