use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Start,
    Think,
    Operate,
    Reflect,
    Evaluator,
    Finish,
}

impl NodeId {
    /// Graph order; the error heuristic scans nodes in this order.
    pub const ALL: [NodeId; 6] = [
        NodeId::Start,
        NodeId::Think,
        NodeId::Operate,
        NodeId::Reflect,
        NodeId::Evaluator,
        NodeId::Finish,
    ];

    /// Nodes cleared when a new pass through the loop begins.
    pub const DOWNSTREAM: [NodeId; 4] = [
        NodeId::Operate,
        NodeId::Reflect,
        NodeId::Evaluator,
        NodeId::Finish,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "start" => Some(NodeId::Start),
            "think" | "thinking" => Some(NodeId::Think),
            "operate" | "act" | "acting" | "action" => Some(NodeId::Operate),
            "reflect" | "observe" | "observing" => Some(NodeId::Reflect),
            "evaluator" | "evaluate" | "evaluating" => Some(NodeId::Evaluator),
            "finish" => Some(NodeId::Finish),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::Start => "start",
            NodeId::Think => "think",
            NodeId::Operate => "operate",
            NodeId::Reflect => "reflect",
            NodeId::Evaluator => "evaluator",
            NodeId::Finish => "finish",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five forward edges plus the reflect -> think back-edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeId {
    StartThink,
    ThinkOperate,
    OperateReflect,
    ReflectEvaluator,
    EvaluatorFinish,
    ReflectThink,
}

impl EdgeId {
    pub const ALL: [EdgeId; 6] = [
        EdgeId::StartThink,
        EdgeId::ThinkOperate,
        EdgeId::OperateReflect,
        EdgeId::ReflectEvaluator,
        EdgeId::EvaluatorFinish,
        EdgeId::ReflectThink,
    ];

    pub fn endpoints(&self) -> (NodeId, NodeId) {
        match self {
            EdgeId::StartThink => (NodeId::Start, NodeId::Think),
            EdgeId::ThinkOperate => (NodeId::Think, NodeId::Operate),
            EdgeId::OperateReflect => (NodeId::Operate, NodeId::Reflect),
            EdgeId::ReflectEvaluator => (NodeId::Reflect, NodeId::Evaluator),
            EdgeId::EvaluatorFinish => (NodeId::Evaluator, NodeId::Finish),
            EdgeId::ReflectThink => (NodeId::Reflect, NodeId::Think),
        }
    }

    pub fn is_back_edge(&self) -> bool {
        matches!(self, EdgeId::ReflectThink)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (from, to) = self.endpoints();
        write!(f, "{from}->{to}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Active,
    Completed,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStatus {
    #[default]
    Idle,
    Active,
    Completed,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IterationBadge {
    pub show: bool,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeState {
    pub status: NodeStatus,
    pub visit_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_visit_iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<DateTime<Utc>>,
    pub show_pulse: bool,
    pub show_glow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub iteration_badge: IterationBadge,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NodeState {
    pub(crate) fn activate(&mut self, iteration: u32, count_visit: bool) {
        if count_visit {
            self.visit_count += 1;
            self.iteration_badge = IterationBadge {
                show: self.visit_count > 1,
                count: self.visit_count,
            };
        }
        self.status = NodeStatus::Active;
        self.current_visit_iteration = Some(iteration);
        self.show_pulse = true;
        self.show_glow = true;
        self.error_message = None;
    }

    pub(crate) fn complete(&mut self, at: DateTime<Utc>) {
        self.status = NodeStatus::Completed;
        self.last_completed_at = Some(at);
        self.show_pulse = false;
        self.show_glow = false;
    }

    pub(crate) fn fail(&mut self, message: String) {
        self.status = NodeStatus::Error;
        self.show_pulse = false;
        self.show_glow = true;
        self.error_message = Some(message);
    }

    /// Back to idle; visit history survives, per-visit data does not.
    pub(crate) fn reset(&mut self) {
        self.status = NodeStatus::Idle;
        self.current_visit_iteration = None;
        self.show_pulse = false;
        self.show_glow = false;
        self.error_message = None;
        self.metadata.clear();
    }

    pub(crate) fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeStyle {
    pub stroke_width: f32,
    pub opacity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dash_array: Option<String>,
}

impl EdgeStyle {
    pub fn for_status(status: EdgeStatus) -> Self {
        let (stroke_width, opacity, dash_array) = match status {
            EdgeStatus::Idle => (2.0, 0.4, Some("6 4")),
            EdgeStatus::Active => (3.0, 1.0, None),
            EdgeStatus::Completed => (2.0, 0.8, None),
            EdgeStatus::Disabled => (1.0, 0.2, Some("2 6")),
        };
        Self {
            stroke_width,
            opacity,
            dash_array: dash_array.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeState {
    pub status: EdgeStatus,
    pub show_flow_animation: bool,
    pub transition_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<DateTime<Utc>>,
    pub style: EdgeStyle,
}

impl Default for EdgeState {
    fn default() -> Self {
        Self {
            status: EdgeStatus::Idle,
            show_flow_animation: false,
            transition_count: 0,
            last_transition_at: None,
            style: EdgeStyle::for_status(EdgeStatus::Idle),
        }
    }
}

impl EdgeState {
    pub(crate) fn set_status(&mut self, status: EdgeStatus) {
        self.status = status;
        self.style = EdgeStyle::for_status(status);
        if status != EdgeStatus::Active {
            self.show_flow_animation = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacency_has_one_back_edge_into_think() {
        let into_think: Vec<_> = EdgeId::ALL
            .iter()
            .filter(|edge| edge.endpoints().1 == NodeId::Think)
            .collect();
        assert_eq!(into_think, vec![&EdgeId::StartThink, &EdgeId::ReflectThink]);
        assert_eq!(
            EdgeId::ALL.iter().filter(|edge| edge.is_back_edge()).count(),
            1
        );
        assert_eq!(EdgeId::ReflectThink.to_string(), "reflect->think");
    }

    #[test]
    fn styles_follow_status() {
        assert_eq!(EdgeStyle::for_status(EdgeStatus::Active).dash_array, None);
        assert_eq!(
            EdgeStyle::for_status(EdgeStatus::Disabled).dash_array.as_deref(),
            Some("2 6")
        );
        let mut edge = EdgeState::default();
        edge.show_flow_animation = true;
        edge.set_status(EdgeStatus::Completed);
        assert!(!edge.show_flow_animation);
        assert_eq!(edge.style.opacity, 0.8);
    }

    #[test]
    fn node_reset_keeps_visit_history() {
        let mut node = NodeState::default();
        node.activate(1, true);
        node.activate(2, true);
        node.set_meta("tool", "web_search");
        node.reset();
        assert_eq!(node.status, NodeStatus::Idle);
        assert_eq!(node.visit_count, 2);
        assert_eq!(node.iteration_badge, IterationBadge { show: true, count: 2 });
        assert!(node.metadata.is_empty());
    }
}
