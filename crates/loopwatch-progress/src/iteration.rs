use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IterationMode {
    #[default]
    Normal,
    /// Forced final pass once the loop ran out of iterations.
    AutoFinish,
}

impl IterationMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "auto_finish" | "autofinish" => IterationMode::AutoFinish,
            _ => IterationMode::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    #[default]
    Pending,
    Thinking,
    Acting,
    Observing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtRecord {
    pub content: String,
    pub token_count: u64,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub summary: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub tool_name: String,
    pub params: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ActionRecord {
    pub fn new(tool_name: impl Into<String>, params: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            tool_name: tool_name.into(),
            params,
            success: true,
            duration_ms: None,
            result: None,
            error: None,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One pass of the reasoning loop, keyed by its 1-based index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub index: u32,
    pub mode: IterationMode,
    pub status: IterationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<ThoughtRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<ObservationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl Iteration {
    pub fn new(index: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: format!("iteration-{index}"),
            index,
            mode: IterationMode::Normal,
            status: IterationStatus::Pending,
            thought: None,
            action: None,
            observation: None,
            evaluation: None,
            duration_ms: None,
            timestamp,
        }
    }

    /// Action record to finalize, created on the spot when the `action`
    /// event never arrived.
    pub fn action_mut(&mut self, tool_name: &str, timestamp: DateTime<Utc>) -> &mut ActionRecord {
        self.action
            .get_or_insert_with(|| ActionRecord::new(tool_name, Value::Null, timestamp))
    }
}

/// Result count in priority order across the shapes tools report with.
pub fn result_count(data: &Value) -> u64 {
    const COUNT_KEYS: [&str; 4] = ["result_count", "results_count", "resultsCount", "count"];
    const LIST_KEYS: [&str; 4] = ["results", "items", "sources", "papers"];

    let nested = data.get("result").filter(|value| value.is_object());
    for scope in std::iter::once(data).chain(nested) {
        for key in COUNT_KEYS {
            if let Some(count) = scope.get(key).and_then(loopwatch_core::event::value_as_u64) {
                return count;
            }
        }
        for key in LIST_KEYS {
            if let Some(list) = scope.get(key).and_then(Value::as_array) {
                return list.len() as u64;
            }
        }
    }
    0
}
