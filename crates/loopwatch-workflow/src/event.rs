use loopwatch_core::{CanonicalUpdate, EventKind};
use serde_json::Value;

use crate::graph::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassMode {
    #[default]
    Normal,
    AutoFinish,
}

/// The slice of the event vocabulary that moves the workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowEvent {
    SessionStart {
        session_id: String,
        query: Option<String>,
        max_iterations: Option<u32>,
    },
    IterationStart {
        iteration: Option<u32>,
        mode: PassMode,
    },
    Thought {
        content: Option<String>,
    },
    Action {
        tool: String,
        parameters: Value,
    },
    ToolExecution {
        tool: String,
        success: bool,
        duration_ms: Option<f64>,
        result_count: u64,
        summary: Option<String>,
    },
    Observation {
        content: String,
    },
    FinishGuard {
        approved: bool,
        feedback: Option<String>,
    },
    EvaluatorStart,
    EvaluatorComplete {
        scores: Value,
        duration_seconds: Option<f64>,
    },
    Finish {
        report_length: u64,
        num_sources: u64,
    },
    Error {
        message: String,
        node: Option<NodeId>,
    },
    SessionComplete {
        status: Option<String>,
        duration_seconds: Option<f64>,
        total_tokens: Option<u64>,
        total_cost_usd: Option<f64>,
    },
    SessionFailed {
        error: String,
    },
}

impl WorkflowEvent {
    /// `None` for kinds the graph does not react to.
    pub fn from_update(update: &CanonicalUpdate) -> Option<Self> {
        let event = match &update.kind {
            EventKind::SessionStart => WorkflowEvent::SessionStart {
                session_id: update.session_id.clone(),
                query: update.data_str(&["query"]).map(str::to_string),
                max_iterations: update
                    .data_u64(&["max_iterations", "maxIterations"])
                    .map(|max| max.min(u64::from(u32::MAX)) as u32),
            },
            EventKind::IterationStart => WorkflowEvent::IterationStart {
                iteration: update.iteration,
                mode: match update.data_str(&["mode"]) {
                    Some(mode) if mode.eq_ignore_ascii_case("auto_finish") => PassMode::AutoFinish,
                    _ => PassMode::Normal,
                },
            },
            EventKind::Thought => WorkflowEvent::Thought {
                content: update
                    .data_str(&["thought", "content"])
                    .or_else(|| update.message_text())
                    .map(str::to_string),
            },
            EventKind::Action => WorkflowEvent::Action {
                tool: tool_name(update),
                parameters: update
                    .data_field("parameters")
                    .or_else(|| update.data_field("params"))
                    .cloned()
                    .unwrap_or(Value::Null),
            },
            EventKind::ToolExecution => WorkflowEvent::ToolExecution {
                tool: tool_name(update),
                success: update.data_bool("success").unwrap_or(true),
                duration_ms: update.data_f64(&["duration_ms"]),
                result_count: update
                    .data_u64(&["result_count", "results_count", "count"])
                    .unwrap_or(0),
                summary: update
                    .data_str(&["result_summary", "error"])
                    .or_else(|| update.message_text())
                    .map(str::to_string),
            },
            EventKind::Observation => WorkflowEvent::Observation {
                content: update
                    .data_str(&["observation", "content"])
                    .or_else(|| update.message_text())
                    .unwrap_or_default()
                    .to_string(),
            },
            EventKind::FinishGuard => WorkflowEvent::FinishGuard {
                approved: update.data_bool("approved").unwrap_or(false),
                feedback: update
                    .data_str(&["feedback", "hint"])
                    .map(str::to_string),
            },
            EventKind::EvaluatorStart => WorkflowEvent::EvaluatorStart,
            EventKind::EvaluatorComplete => WorkflowEvent::EvaluatorComplete {
                scores: update.data_field("scores").cloned().unwrap_or(Value::Null),
                duration_seconds: update.data_f64(&["duration_seconds"]),
            },
            EventKind::Finish => WorkflowEvent::Finish {
                report_length: update.data_u64(&["report_length"]).unwrap_or(0),
                num_sources: update.data_u64(&["num_sources"]).unwrap_or(0),
            },
            EventKind::Error => WorkflowEvent::Error {
                message: update
                    .data_str(&["error", "message"])
                    .or_else(|| update.message_text())
                    .unwrap_or("unknown error")
                    .to_string(),
                node: update.data_str(&["node"]).and_then(NodeId::parse),
            },
            EventKind::SessionComplete | EventKind::Completion => WorkflowEvent::SessionComplete {
                status: update.data_str(&["status"]).map(str::to_string),
                duration_seconds: update.data_f64(&["duration_seconds", "duration"]),
                total_tokens: update.data_u64(&["total_tokens"]),
                total_cost_usd: update.data_f64(&["total_cost_usd", "cost"]),
            },
            EventKind::SessionFailed => WorkflowEvent::SessionFailed {
                error: update
                    .data_str(&["error"])
                    .or_else(|| update.message_text())
                    .unwrap_or("session failed")
                    .to_string(),
            },
            _ => return None,
        };
        Some(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::SessionStart { .. } => "session_start",
            WorkflowEvent::IterationStart { .. } => "iteration_start",
            WorkflowEvent::Thought { .. } => "thought",
            WorkflowEvent::Action { .. } => "action",
            WorkflowEvent::ToolExecution { .. } => "tool_execution",
            WorkflowEvent::Observation { .. } => "observation",
            WorkflowEvent::FinishGuard { .. } => "finish_guard",
            WorkflowEvent::EvaluatorStart => "evaluator_start",
            WorkflowEvent::EvaluatorComplete { .. } => "evaluator_complete",
            WorkflowEvent::Finish { .. } => "finish",
            WorkflowEvent::Error { .. } => "error",
            WorkflowEvent::SessionComplete { .. } => "session_complete",
            WorkflowEvent::SessionFailed { .. } => "session_failed",
        }
    }
}

fn tool_name(update: &CanonicalUpdate) -> String {
    update
        .data_str(&["tool", "tool_name", "action"])
        .unwrap_or("unknown")
        .to_string()
}
