use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event vocabulary pushed by the agent backend.
///
/// Several wire names collapse onto one kind (`thought_generated` is a
/// `Thought`, `action_complete` is a `ToolExecution`, ...). Names outside the
/// vocabulary survive as [`EventKind::Other`] so consumers can log them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    SessionStart,
    IterationStart,
    Thought,
    Action,
    ToolExecution,
    ToolBlocked,
    Observation,
    EvaluationComplete,
    IterationComplete,
    ReportChunk,
    FinishGuard,
    Finish,
    EvaluatorStart,
    EvaluatorComplete,
    ReportComplete,
    Completion,
    SessionComplete,
    ProgressUpdate,
    SessionFailed,
    Error,
    Other(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "session_start" => EventKind::SessionStart,
            "iteration_start" => EventKind::IterationStart,
            "thought" | "thought_generated" => EventKind::Thought,
            "action" | "action_executing" => EventKind::Action,
            "tool_execution" | "action_complete" => EventKind::ToolExecution,
            "tool_blocked" => EventKind::ToolBlocked,
            "observation" | "observation_generated" => EventKind::Observation,
            "evaluation_complete" => EventKind::EvaluationComplete,
            "iteration_complete" => EventKind::IterationComplete,
            "report_chunk" => EventKind::ReportChunk,
            "finish_guard" => EventKind::FinishGuard,
            "finish" => EventKind::Finish,
            "evaluator_start" => EventKind::EvaluatorStart,
            "evaluator_complete" => EventKind::EvaluatorComplete,
            "report_complete" => EventKind::ReportComplete,
            "completion" => EventKind::Completion,
            "session_complete" => EventKind::SessionComplete,
            "progress_update" => EventKind::ProgressUpdate,
            "session_failed" => EventKind::SessionFailed,
            "error" => EventKind::Error,
            _ => EventKind::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::IterationStart => "iteration_start",
            EventKind::Thought => "thought",
            EventKind::Action => "action",
            EventKind::ToolExecution => "tool_execution",
            EventKind::ToolBlocked => "tool_blocked",
            EventKind::Observation => "observation",
            EventKind::EvaluationComplete => "evaluation_complete",
            EventKind::IterationComplete => "iteration_complete",
            EventKind::ReportChunk => "report_chunk",
            EventKind::FinishGuard => "finish_guard",
            EventKind::Finish => "finish",
            EventKind::EvaluatorStart => "evaluator_start",
            EventKind::EvaluatorComplete => "evaluator_complete",
            EventKind::ReportComplete => "report_complete",
            EventKind::Completion => "completion",
            EventKind::SessionComplete => "session_complete",
            EventKind::ProgressUpdate => "progress_update",
            EventKind::SessionFailed => "session_failed",
            EventKind::Error => "error",
            EventKind::Other(name) => name.as_str(),
        }
    }

    /// Completion-family kinds that carry the final report and run totals.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ReportComplete | EventKind::Completion | EventKind::SessionComplete
        )
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        EventKind::parse(&value)
    }
}

impl From<EventKind> for String {
    fn from(value: EventKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-agnostic form of one server-pushed frame. Built once by
/// [`crate::normalize`] and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalUpdate {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalUpdate {
    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|value| !value.is_null())
    }

    /// First non-blank string among `keys`, in order.
    pub fn data_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| {
            self.data_field(key)
                .and_then(Value::as_str)
                .filter(|text| !text.trim().is_empty())
        })
    }

    pub fn data_f64(&self, keys: &[&str]) -> Option<f64> {
        keys.iter()
            .find_map(|key| self.data_field(key).and_then(value_as_f64))
    }

    pub fn data_u64(&self, keys: &[&str]) -> Option<u64> {
        keys.iter()
            .find_map(|key| self.data_field(key).and_then(value_as_u64))
    }

    pub fn data_bool(&self, key: &str) -> Option<bool> {
        match self.data_field(key)? {
            Value::Bool(flag) => Some(*flag),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            Value::Number(number) => number.as_i64().map(|n| n != 0),
            _ => None,
        }
    }

    /// Message carried by the envelope, trimmed, if it says anything.
    pub fn message_text(&self) -> Option<&str> {
        self.message
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}
