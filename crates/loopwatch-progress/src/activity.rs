use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sub-step of an iteration, each worth a fixed share of that iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Thinking,
    Acting,
    Observing,
    Evaluating,
    Complete,
    Failed,
}

impl Phase {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "starting" | "start" => Some(Phase::Starting),
            "thinking" | "think" => Some(Phase::Thinking),
            "acting" | "act" | "operate" => Some(Phase::Acting),
            "observing" | "observe" | "reflect" => Some(Phase::Observing),
            "evaluating" | "evaluate" | "evaluator" => Some(Phase::Evaluating),
            "complete" | "completed" | "finish" => Some(Phase::Complete),
            "failed" | "error" => Some(Phase::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Thinking => "thinking",
            Phase::Acting => "acting",
            Phase::Observing => "observing",
            Phase::Evaluating => "evaluating",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Phase::Starting => 0.0,
            Phase::Thinking => 0.15,
            Phase::Acting => 0.55,
            Phase::Observing => 0.85,
            Phase::Evaluating => 0.95,
            Phase::Complete => 1.0,
            Phase::Failed => 0.0,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percentage credit for reaching `phase` in 1-based `iteration`.
///
/// Always within `[0, 100]`; a zero `max_iterations` yields 0.
pub fn compute_progress(iteration: u32, phase: Phase, max_iterations: u32) -> f64 {
    if max_iterations == 0 {
        return 0.0;
    }
    let completed = f64::from(iteration.saturating_sub(1));
    let raw = (completed + phase.weight()) / f64::from(max_iterations) * 100.0;
    clamp_progress(raw)
}

pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestUpdate {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityState {
    pub current_phase: Phase,
    pub current_iteration: u32,
    pub current_activity: String,
    pub progress: f64,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining: Option<f64>,
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_update: Option<LatestUpdate>,
}

impl ActivityState {
    /// Starting point before any phase-bearing event has arrived.
    pub fn baseline(max_iterations: u32) -> Self {
        Self {
            current_phase: Phase::Starting,
            current_iteration: 0,
            current_activity: "Waiting for agent".to_string(),
            progress: 0.0,
            elapsed_seconds: 0.0,
            estimated_remaining: None,
            max_iterations,
            latest_update: None,
        }
    }
}

/// Linear extrapolation of the time left from time spent so far.
pub fn estimate_remaining(elapsed_seconds: f64, progress: f64) -> Option<f64> {
    if progress <= 0.0 || progress >= 100.0 || elapsed_seconds <= 0.0 {
        return None;
    }
    Some(elapsed_seconds * (100.0 - progress) / progress)
}
