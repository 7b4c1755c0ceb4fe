use chrono::{DateTime, Utc};
use loopwatch_core::event::value_as_f64;
use loopwatch_core::{CanonicalUpdate, EventKind};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

use crate::activity::{
    clamp_progress, compute_progress, estimate_remaining, ActivityState, LatestUpdate, Phase,
};
use crate::iteration::{
    result_count, ActionRecord, ActionResult, Iteration, IterationMode, IterationStatus,
    ObservationRecord, ThoughtRecord,
};
use crate::metrics::{compute_run_metrics, ReportedTotals, RunHistoryEntry, RunMetrics, ToolStats};
use crate::report::{normalize_report, ReportAssembler, ResearchReport};

pub const DEFAULT_MAX_ITERATIONS: u32 = 6;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
const ACTIVITY_PREVIEW_CHARS: usize = 160;

#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Settings value used until a session announces its own limit.
    pub max_iterations: u32,
    pub history_limit: usize,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SessionFailed,
    Error,
}

/// A failure the agent itself reported; transport trouble never ends up here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainFailure {
    pub session_id: String,
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResultSummary {
    pub title: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutputSummary {
    pub id: String,
    pub tool: String,
    pub results_count: u64,
    pub summaries: Vec<ToolResultSummary>,
    pub timestamp: DateTime<Utc>,
}

pub type ErrorHook = Box<dyn FnMut(&DomainFailure) + Send>;

/// Everything derived from one session. Replaced wholesale when the session
/// changes so nothing leaks from the previous run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// `max_iterations` announced by `session_start`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_iterations_hint: Option<u32>,
    pub researching: bool,
    pub current_iteration: u32,
    pub iterations: BTreeMap<u32, Iteration>,
    pub activity: ActivityState,
    pub tool_outputs: Vec<ToolOutputSummary>,
    pub tool_stats: BTreeMap<String, ToolStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ResearchReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RunMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<DomainFailure>,
    #[serde(skip)]
    iteration_started: BTreeMap<u32, DateTime<Utc>>,
    #[serde(skip)]
    assembler: ReportAssembler,
    #[serde(skip)]
    history_recorded: bool,
}

impl SessionContext {
    fn new(session_id: Option<String>, max_iterations: u32) -> Self {
        Self {
            session_id,
            query: None,
            started_at: None,
            max_iterations_hint: None,
            researching: false,
            current_iteration: 0,
            iterations: BTreeMap::new(),
            activity: ActivityState::baseline(max_iterations),
            tool_outputs: Vec::new(),
            tool_stats: BTreeMap::new(),
            report: None,
            evaluation: None,
            metrics: None,
            failure: None,
            iteration_started: BTreeMap::new(),
            assembler: ReportAssembler::default(),
            history_recorded: false,
        }
    }
}

/// Folds canonical updates into iteration records, activity and report state.
pub struct ProgressProjector {
    config: ProjectorConfig,
    session: SessionContext,
    history: VecDeque<RunHistoryEntry>,
    error_hook: Option<ErrorHook>,
}

impl ProgressProjector {
    pub fn new(config: ProjectorConfig) -> Self {
        let baseline = config.max_iterations.max(1);
        Self {
            config,
            session: SessionContext::new(None, baseline),
            history: VecDeque::new(),
            error_hook: None,
        }
    }

    /// Called with every domain failure in addition to the `apply` return value.
    pub fn with_error_hook(mut self, hook: impl FnMut(&DomainFailure) + Send + 'static) -> Self {
        self.error_hook = Some(Box::new(hook));
        self
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn activity(&self) -> &ActivityState {
        &self.session.activity
    }

    pub fn iterations(&self) -> impl Iterator<Item = &Iteration> {
        self.session.iterations.values()
    }

    pub fn iteration(&self, index: u32) -> Option<&Iteration> {
        self.session.iterations.get(&index)
    }

    pub fn tool_outputs(&self) -> &[ToolOutputSummary] {
        &self.session.tool_outputs
    }

    pub fn report(&self) -> Option<&ResearchReport> {
        self.session.report.as_ref()
    }

    pub fn metrics(&self) -> Option<&RunMetrics> {
        self.session.metrics.as_ref()
    }

    pub fn is_researching(&self) -> bool {
        self.session.researching
    }

    pub fn failure(&self) -> Option<&DomainFailure> {
        self.session.failure.as_ref()
    }

    /// Finished runs, oldest first. Survives session switches.
    pub fn history(&self) -> impl Iterator<Item = &RunHistoryEntry> {
        self.history.iter()
    }

    /// Drops all per-session state, e.g. when the active session changes.
    pub fn reset_session(&mut self, session_id: Option<&str>) {
        self.session = SessionContext::new(session_id.map(str::to_string), self.fallback_max());
    }

    pub fn apply(&mut self, update: &CanonicalUpdate) -> Option<DomainFailure> {
        self.adopt_session(update);
        match &update.kind {
            EventKind::SessionStart => self.on_session_start(update),
            EventKind::IterationStart => self.on_iteration_start(update),
            EventKind::Thought => self.on_thought(update),
            EventKind::Action => self.on_action(update),
            EventKind::ToolExecution => self.on_tool_execution(update),
            EventKind::ToolBlocked => self.on_tool_blocked(update),
            EventKind::Observation => self.on_observation(update),
            EventKind::IterationComplete => self.on_iteration_complete(update),
            EventKind::EvaluationComplete => self.on_evaluation_complete(update),
            EventKind::EvaluatorStart => {
                let iteration = self.session.current_iteration;
                let activity = update
                    .message_text()
                    .unwrap_or("Evaluating report")
                    .to_string();
                self.publish(update, Phase::Evaluating, iteration, activity);
            }
            EventKind::EvaluatorComplete => {
                let scores = update
                    .data_field("scores")
                    .cloned()
                    .unwrap_or_else(|| update.data.clone());
                self.session.evaluation = Some(scores);
                let iteration = self.session.current_iteration;
                self.publish(update, Phase::Evaluating, iteration, "Evaluation complete".to_string());
            }
            EventKind::Finish => self.on_finish(update),
            EventKind::ReportChunk => self.on_report_chunk(update),
            EventKind::ReportComplete | EventKind::Completion | EventKind::SessionComplete => {
                self.on_session_complete(update)
            }
            EventKind::ProgressUpdate => self.on_progress_update(update),
            EventKind::SessionFailed => return Some(self.on_failure(update, FailureKind::SessionFailed)),
            EventKind::Error => return Some(self.on_failure(update, FailureKind::Error)),
            EventKind::FinishGuard => {}
            EventKind::Other(name) => debug!("projector_ignored_event: {name}"),
        }
        None
    }

    fn adopt_session(&mut self, update: &CanonicalUpdate) {
        match self.session.session_id.as_deref() {
            Some(current) if current == update.session_id => {}
            Some(current) => {
                debug!(
                    "projector_session_switch: {current} -> {}",
                    update.session_id
                );
                self.reset_session(Some(&update.session_id));
            }
            None => self.session.session_id = Some(update.session_id.clone()),
        }
        if self.session.started_at.is_none() {
            self.session.started_at = Some(update.timestamp);
        }
    }

    fn on_session_start(&mut self, update: &CanonicalUpdate) {
        self.reset_session(Some(&update.session_id));
        let session = &mut self.session;
        session.started_at = Some(update.timestamp);
        session.query = update.data_str(&["query"]).map(str::to_string);
        session.max_iterations_hint = update
            .data_u64(&["max_iterations", "maxIterations"])
            .map(|max| max.min(u64::from(u32::MAX)) as u32);
        session.researching = true;
        info!("session_started: {}", update.session_id);
        let activity = update
            .message_text()
            .unwrap_or("Research session started")
            .to_string();
        self.publish(update, Phase::Starting, 0, activity);
    }

    fn on_iteration_start(&mut self, update: &CanonicalUpdate) {
        let index = update
            .iteration
            .filter(|index| *index > 0)
            .unwrap_or(self.session.current_iteration.saturating_add(1));
        let mode = update
            .data_str(&["mode"])
            .map(IterationMode::parse)
            .unwrap_or_default();
        self.session.iteration_started.insert(index, update.timestamp);
        self.session.researching = true;
        let iteration = self.iteration_mut(index, update.timestamp);
        iteration.mode = mode;
        iteration.status = IterationStatus::Thinking;
        iteration.timestamp = update.timestamp;
        let activity = match mode {
            IterationMode::AutoFinish => format!("Iteration {index}: drafting final report"),
            IterationMode::Normal => format!("Iteration {index}: thinking"),
        };
        self.publish(update, Phase::Thinking, index, activity);
    }

    fn on_thought(&mut self, update: &CanonicalUpdate) {
        let index = self.event_iteration(update);
        let content = update
            .data_str(&["thought", "content", "reasoning"])
            .or_else(|| update.message_text())
            .unwrap_or_default()
            .trim()
            .to_string();
        let thought = ThoughtRecord {
            content: content.clone(),
            token_count: update.data_u64(&["tokens_used", "token_count", "tokens"]).unwrap_or(0),
            latency_ms: update.data_f64(&["latency_ms"]).unwrap_or(0.0),
            timestamp: update.timestamp,
        };
        let iteration = self.iteration_mut(index, update.timestamp);
        iteration.thought = Some(thought);
        if iteration.status == IterationStatus::Pending {
            iteration.status = IterationStatus::Thinking;
        }
        let activity = if content.is_empty() {
            "Thinking".to_string()
        } else {
            preview(&content)
        };
        self.publish(update, Phase::Thinking, index, activity);
    }

    fn on_action(&mut self, update: &CanonicalUpdate) {
        let index = self.event_iteration(update);
        let tool = tool_name(update);
        let params = ["parameters", "params", "input", "arguments"]
            .iter()
            .find_map(|key| update.data_field(key))
            .cloned()
            .unwrap_or(Value::Null);
        let iteration = self.iteration_mut(index, update.timestamp);
        iteration.action = Some(ActionRecord::new(tool.clone(), params, update.timestamp));
        iteration.status = IterationStatus::Acting;
        self.publish(update, Phase::Acting, index, format!("Running {tool}"));
    }

    fn on_tool_execution(&mut self, update: &CanonicalUpdate) {
        let index = self.event_iteration(update);
        let tool = tool_name(update);
        let success = update.data_bool("success").unwrap_or(true);
        let duration_ms = update.data_f64(&["duration_ms"]).or_else(|| {
            update
                .data_f64(&["duration_seconds", "duration"])
                .map(|seconds| seconds * 1000.0)
        });
        let summary = update
            .data_str(&["result_summary", "summary"])
            .or_else(|| update.message_text())
            .unwrap_or_default()
            .to_string();
        let count = result_count(&update.data);
        let provider = update.data_str(&["provider"]).map(str::to_string);
        let error = (!success).then(|| {
            update
                .data_str(&["error", "error_message"])
                .map(str::to_string)
                .unwrap_or_else(|| {
                    if summary.is_empty() {
                        format!("{tool} failed")
                    } else {
                        summary.clone()
                    }
                })
        });

        let iteration = self.iteration_mut(index, update.timestamp);
        let action = iteration.action_mut(&tool, update.timestamp);
        action.success = success;
        action.duration_ms = duration_ms;
        action.result = Some(ActionResult {
            summary: summary.clone(),
            count,
            provider,
        });
        action.error = error;
        iteration.status = IterationStatus::Observing;

        self.session.tool_outputs.push(ToolOutputSummary {
            id: update.id.clone(),
            tool: tool.clone(),
            results_count: count,
            summaries: result_summaries(update, &tool, &summary),
            timestamp: update.timestamp,
        });
        self.session
            .tool_stats
            .entry(tool.clone())
            .or_default()
            .record(success, duration_ms.unwrap_or(0.0), count);

        let activity = if summary.is_empty() {
            format!("{tool} finished")
        } else {
            preview(&summary)
        };
        self.publish(update, Phase::Observing, index, activity);
    }

    fn on_tool_blocked(&mut self, update: &CanonicalUpdate) {
        let index = self.event_iteration(update);
        let tool = tool_name(update);
        let reason = update
            .data_str(&["reason", "error"])
            .or_else(|| update.message_text())
            .unwrap_or("blocked")
            .to_string();
        let iteration = self.iteration_mut(index, update.timestamp);
        let action = iteration.action_mut(&tool, update.timestamp);
        action.success = false;
        action.error = Some(reason.clone());
        self.publish(update, Phase::Acting, index, format!("{tool} blocked: {reason}"));
    }

    fn on_observation(&mut self, update: &CanonicalUpdate) {
        let index = self.event_iteration(update);
        let content = update
            .data_str(&["observation", "content"])
            .or_else(|| update.message_text())
            .unwrap_or_default()
            .to_string();
        let started = self.session.iteration_started.get(&index).copied();
        let iteration = self.iteration_mut(index, update.timestamp);
        iteration.observation = Some(ObservationRecord {
            content: content.clone(),
            timestamp: update.timestamp,
        });
        iteration.status = IterationStatus::Complete;
        if let Some(started) = started {
            iteration.duration_ms = Some((update.timestamp - started).num_milliseconds().max(0));
        }
        let activity = if content.is_empty() {
            format!("Iteration {index} complete")
        } else {
            preview(&content)
        };
        self.publish(update, Phase::Complete, index, activity);
    }

    fn on_iteration_complete(&mut self, update: &CanonicalUpdate) {
        let index = self.event_iteration(update);
        let started = self.session.iteration_started.get(&index).copied();
        let iteration = self.iteration_mut(index, update.timestamp);
        if iteration.status != IterationStatus::Failed {
            iteration.status = IterationStatus::Complete;
        }
        if let (None, Some(started)) = (iteration.duration_ms, started) {
            iteration.duration_ms = Some((update.timestamp - started).num_milliseconds().max(0));
        }
        self.publish(update, Phase::Complete, index, format!("Iteration {index} complete"));
    }

    fn on_evaluation_complete(&mut self, update: &CanonicalUpdate) {
        let index = self.event_iteration(update);
        self.iteration_mut(index, update.timestamp).evaluation = Some(update.data.clone());
        let activity = update
            .message_text()
            .unwrap_or("Evaluation recorded")
            .to_string();
        self.publish(update, Phase::Evaluating, index, activity);
    }

    fn on_finish(&mut self, update: &CanonicalUpdate) {
        let index = update
            .iteration
            .filter(|index| *index > 0)
            .unwrap_or(self.session.current_iteration.saturating_add(1));
        let report_length = update.data_u64(&["report_length"]).unwrap_or(0);
        let num_sources = update.data_u64(&["num_sources"]).unwrap_or(0);
        let auto = update.data_bool("auto_generated").unwrap_or(false);
        let observation = update
            .message_text()
            .unwrap_or("Final report drafted")
            .to_string();
        let started = self.session.iteration_started.get(&index).copied();

        let iteration = self.iteration_mut(index, update.timestamp);
        if auto {
            iteration.mode = IterationMode::AutoFinish;
        }
        let mut action = ActionRecord::new(
            "finish",
            json!({ "report_length": report_length, "num_sources": num_sources }),
            update.timestamp,
        );
        action.result = Some(ActionResult {
            summary: format!("Report drafted with {num_sources} sources"),
            count: num_sources,
            provider: None,
        });
        iteration.action = Some(action);
        iteration.observation = Some(ObservationRecord {
            content: observation.clone(),
            timestamp: update.timestamp,
        });
        iteration.status = IterationStatus::Complete;
        if let Some(started) = started {
            iteration.duration_ms = Some((update.timestamp - started).num_milliseconds().max(0));
        }

        let carries_report = update
            .data
            .get("report")
            .is_some_and(|report| report.is_string() || report.is_object());
        if carries_report {
            if let Some(report) = normalize_report(&update.data, update.timestamp) {
                self.session.report = Some(report);
            }
        }
        self.publish(update, Phase::Evaluating, index, observation);
    }

    fn on_report_chunk(&mut self, update: &CanonicalUpdate) {
        let chunk = ["chunk", "content", "text", "delta"]
            .iter()
            .find_map(|key| update.data.get(*key).and_then(Value::as_str))
            .or(update.message.as_deref())
            .unwrap_or_default();
        if chunk.is_empty() {
            return;
        }
        let session = &mut self.session;
        session.assembler.push(chunk);
        let mut report = session.assembler.build(update.timestamp);
        if let Some(previous) = session.report.take() {
            report.set_sources(previous.sources);
        }
        session.report = Some(report);
    }

    fn on_session_complete(&mut self, update: &CanonicalUpdate) {
        let payload = update
            .data_field("session")
            .filter(|value| value.is_object())
            .unwrap_or(&update.data);
        let timestamp = update.timestamp;

        if let Some(report) = normalize_report(payload, timestamp) {
            self.session.report = Some(report);
        } else if self.session.report.is_none() && !self.session.assembler.is_empty() {
            self.session.report = Some(self.session.assembler.build(timestamp));
        }

        let reported = reported_totals(payload);
        if let Some(evaluation) = payload.get("evaluation").filter(|value| !value.is_null()) {
            self.session.evaluation = Some(evaluation.clone());
        }
        let observed_tokens = self
            .session
            .iterations
            .values()
            .filter_map(|iteration| iteration.thought.as_ref())
            .map(|thought| thought.token_count)
            .sum();
        let observed_duration = self
            .session
            .started_at
            .map(|started| (timestamp - started).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let metrics = compute_run_metrics(
            &self.session.tool_stats,
            &reported,
            self.session.current_iteration,
            observed_duration,
            observed_tokens,
            self.session.evaluation.clone(),
        );
        if let Some(report) = self.session.report.as_mut() {
            if report.metadata.generation_time_ms == 0 {
                report.metadata.generation_time_ms = (metrics.duration_seconds * 1000.0) as u64;
            }
        }

        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .filter(|status| !status.trim().is_empty())
            .unwrap_or("completed")
            .to_string();
        self.session.metrics = Some(metrics.clone());
        self.session.researching = false;
        self.record_history(&update.session_id, &status, timestamp, metrics);
        info!(
            "session_completed: {} status={status} kind={}",
            update.session_id, update.kind
        );

        let iteration = self.session.current_iteration;
        if status == "failed" {
            let progress = self.session.activity.progress;
            self.set_activity(update, Phase::Failed, iteration, "Research failed".to_string(), progress);
        } else {
            self.set_activity(update, Phase::Complete, iteration, "Research complete".to_string(), 100.0);
        }
    }

    fn on_progress_update(&mut self, update: &CanonicalUpdate) {
        let phase = update
            .phase
            .as_deref()
            .or_else(|| update.data_str(&["phase"]))
            .and_then(Phase::parse)
            .unwrap_or(self.session.activity.current_phase);
        let iteration = update
            .iteration
            .unwrap_or(self.session.current_iteration);
        let progress = update
            .data_f64(&["progress", "percent", "percentage"])
            .map(clamp_progress)
            .unwrap_or_else(|| compute_progress(iteration, phase, self.max_iterations()));
        let activity = update
            .message_text()
            .map(preview)
            .unwrap_or_else(|| self.session.activity.current_activity.clone());
        self.session.current_iteration = self.session.current_iteration.max(iteration);
        self.set_activity(update, phase, iteration, activity, progress);
    }

    fn on_failure(&mut self, update: &CanonicalUpdate, kind: FailureKind) -> DomainFailure {
        let message = update
            .data_str(&["error", "error_message", "message"])
            .or_else(|| update.message_text())
            .unwrap_or("unknown error")
            .to_string();
        if let Some(index) = update.iteration {
            self.iteration_mut(index, update.timestamp).status = IterationStatus::Failed;
        }
        let failure = DomainFailure {
            session_id: update.session_id.clone(),
            kind,
            message: message.clone(),
            iteration: update.iteration,
            timestamp: update.timestamp,
        };
        warn!("domain_error: session={} {message}", update.session_id);
        self.session.researching = false;
        self.session.failure = Some(failure.clone());
        let iteration = self.session.current_iteration;
        let progress = self.session.activity.progress;
        self.set_activity(update, Phase::Failed, iteration, message, progress);
        if let Some(hook) = self.error_hook.as_mut() {
            hook(&failure);
        }
        failure
    }

    fn record_history(
        &mut self,
        session_id: &str,
        status: &str,
        completed_at: DateTime<Utc>,
        metrics: RunMetrics,
    ) {
        let entry = RunHistoryEntry {
            session_id: session_id.to_string(),
            query: self.session.query.clone(),
            status: status.to_string(),
            completed_at,
            metrics,
        };
        // completion and session_complete both close the same run
        if self.session.history_recorded {
            if let Some(last) = self
                .history
                .iter_mut()
                .rev()
                .find(|existing| existing.session_id == session_id)
            {
                *last = entry;
                return;
            }
        }
        self.session.history_recorded = true;
        self.history.push_back(entry);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    fn publish(&mut self, update: &CanonicalUpdate, phase: Phase, iteration: u32, activity: String) {
        let progress = compute_progress(iteration, phase, self.max_iterations());
        self.set_activity(update, phase, iteration, activity, progress);
    }

    fn set_activity(
        &mut self,
        update: &CanonicalUpdate,
        phase: Phase,
        iteration: u32,
        activity: String,
        progress: f64,
    ) {
        let max_iterations = self.max_iterations();
        let elapsed_seconds = self
            .session
            .started_at
            .map(|started| (update.timestamp - started).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        let state = &mut self.session.activity;
        state.current_phase = phase;
        state.current_iteration = iteration;
        state.progress = progress;
        state.elapsed_seconds = elapsed_seconds;
        state.estimated_remaining = estimate_remaining(elapsed_seconds, progress);
        state.max_iterations = max_iterations;
        state.latest_update = Some(LatestUpdate {
            id: update.id.clone(),
            message: activity.clone(),
            timestamp: update.timestamp,
        });
        state.current_activity = activity;
    }

    fn max_iterations(&self) -> u32 {
        self.session
            .max_iterations_hint
            .unwrap_or_else(|| self.fallback_max())
    }

    fn fallback_max(&self) -> u32 {
        if self.config.max_iterations > 0 {
            self.config.max_iterations
        } else {
            1
        }
    }

    fn event_iteration(&self, update: &CanonicalUpdate) -> u32 {
        update
            .iteration
            .filter(|index| *index > 0)
            .unwrap_or(self.session.current_iteration.max(1))
    }

    fn iteration_mut(&mut self, index: u32, timestamp: DateTime<Utc>) -> &mut Iteration {
        self.session.current_iteration = self.session.current_iteration.max(index);
        self.session
            .iterations
            .entry(index)
            .or_insert_with(|| Iteration::new(index, timestamp))
    }
}

fn tool_name(update: &CanonicalUpdate) -> String {
    update
        .data_str(&["tool", "tool_name", "action"])
        .unwrap_or("unknown")
        .to_string()
}

fn result_summaries(update: &CanonicalUpdate, tool: &str, summary: &str) -> Vec<ToolResultSummary> {
    let listed: Vec<ToolResultSummary> = update
        .data_field("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|item| {
                    let title = item.get("title").and_then(Value::as_str)?;
                    let summary = ["summary", "snippet", "description"]
                        .iter()
                        .find_map(|key| item.get(*key).and_then(Value::as_str))
                        .unwrap_or_default();
                    let relevance = ["relevance", "relevance_score", "score"]
                        .iter()
                        .find_map(|key| item.get(*key).and_then(Value::as_f64));
                    Some(ToolResultSummary {
                        title: title.to_string(),
                        summary: summary.to_string(),
                        relevance,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    if !listed.is_empty() || summary.is_empty() {
        return listed;
    }
    vec![ToolResultSummary {
        title: tool.to_string(),
        summary: summary.to_string(),
        relevance: None,
    }]
}

fn reported_totals(payload: &Value) -> ReportedTotals {
    let nested = payload.get("metrics").unwrap_or(&Value::Null);
    ReportedTotals {
        iterations: first_number(payload, &["iterations", "total_iterations"])
            .map(|value| value.max(0.0) as u32),
        duration_seconds: first_number(
            payload,
            &["duration_seconds", "duration", "total_duration_seconds"],
        ),
        total_tokens: first_number(payload, &["total_tokens"])
            .or_else(|| first_number(nested, &["total_tokens_used", "total_tokens"]))
            .map(|value| value.max(0.0) as u64),
        total_cost_usd: first_number(payload, &["total_cost_usd", "cost"])
            .or_else(|| first_number(nested, &["total_cost", "total_cost_usd"])),
    }
}

fn first_number(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(value_as_f64))
}

fn preview(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= ACTIVITY_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(ACTIVITY_PREVIEW_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::{Arc, Mutex};

    fn base() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_772_359_200_000)
            .single()
            .expect("timestamp")
    }

    fn event(kind: &str, iteration: Option<u32>, data: Value, at_secs: i64) -> CanonicalUpdate {
        event_for("s-1", kind, iteration, data, at_secs)
    }

    fn event_for(
        session_id: &str,
        kind: &str,
        iteration: Option<u32>,
        data: Value,
        at_secs: i64,
    ) -> CanonicalUpdate {
        CanonicalUpdate {
            id: format!("evt-{kind}-{at_secs}"),
            kind: EventKind::parse(kind),
            session_id: session_id.to_string(),
            iteration,
            phase: None,
            message: None,
            data,
            timestamp: base() + Duration::seconds(at_secs),
        }
    }

    fn run_first_iteration(projector: &mut ProgressProjector) {
        projector.apply(&event("session_start", None, json!({"query": "rust async", "max_iterations": 2}), 0));
        projector.apply(&event("iteration_start", Some(1), json!({"iteration": 1, "mode": "normal"}), 1));
        projector.apply(&event(
            "thought",
            Some(1),
            json!({"thought": "search first", "tokens_used": 120, "latency_ms": 850.0}),
            2,
        ));
        projector.apply(&event(
            "action",
            Some(1),
            json!({"tool": "web_search", "parameters": {"query": "tokio"}, "index": 0}),
            3,
        ));
        projector.apply(&event(
            "tool_execution",
            Some(1),
            json!({
                "tool": "web_search",
                "duration_ms": 400.0,
                "success": true,
                "result_summary": "3 results",
                "result_count": 3,
                "provider": "tavily"
            }),
            4,
        ));
        projector.apply(&event("observation", Some(1), json!({"observation": "found docs"}), 6));
    }

    #[test]
    fn first_iteration_is_folded_in_order() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        run_first_iteration(&mut projector);

        let iteration = projector.iteration(1).expect("iteration 1");
        assert_eq!(iteration.status, IterationStatus::Complete);
        assert_eq!(iteration.duration_ms, Some(5_000));
        assert_eq!(iteration.thought.as_ref().map(|t| t.token_count), Some(120));
        let action = iteration.action.as_ref().expect("action");
        assert_eq!(action.tool_name, "web_search");
        assert_eq!(action.params, json!({"query": "tokio"}));
        assert!(action.success);
        assert_eq!(action.duration_ms, Some(400.0));
        assert_eq!(action.result.as_ref().map(|r| r.count), Some(3));
        assert_eq!(
            iteration.observation.as_ref().map(|o| o.content.as_str()),
            Some("found docs")
        );

        let outputs = projector.tool_outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].results_count, 3);
        assert_eq!(outputs[0].summaries[0].summary, "3 results");

        let activity = projector.activity();
        assert_eq!(activity.current_phase, Phase::Complete);
        assert_eq!(activity.max_iterations, 2);
        assert_eq!(activity.progress, 50.0);
        assert_eq!(activity.elapsed_seconds, 6.0);
        assert_eq!(activity.estimated_remaining, Some(6.0));
        assert!(projector.is_researching());
        assert_eq!(projector.session().query.as_deref(), Some("rust async"));
    }

    #[test]
    fn blank_thought_falls_back_to_message() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        let mut thought = event("thought", Some(1), json!({"thought": "   "}), 1);
        thought.message = Some("Considering sources".to_string());
        projector.apply(&thought);
        let recorded = projector.iteration(1).and_then(|it| it.thought.as_ref()).expect("thought");
        assert_eq!(recorded.content, "Considering sources");
    }

    #[test]
    fn failed_tool_records_error_and_stats() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        projector.apply(&event("action", Some(1), json!({"tool": "arxiv_search"}), 1));
        projector.apply(&event(
            "tool_execution",
            Some(1),
            json!({"tool": "arxiv_search", "success": false, "result_summary": "timed out", "duration_ms": 30000}),
            31,
        ));
        let action = projector
            .iteration(1)
            .and_then(|it| it.action.as_ref())
            .expect("action");
        assert!(!action.success);
        assert_eq!(action.error.as_deref(), Some("timed out"));
        assert_eq!(projector.session().tool_stats["arxiv_search"].executions, 1);
        assert_eq!(projector.session().tool_stats["arxiv_search"].successes, 0);
    }

    #[test]
    fn report_chunks_then_completion_install_final_report() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        run_first_iteration(&mut projector);
        projector.apply(&event("report_chunk", None, json!({"chunk": "Intro text. "}), 7));
        projector.apply(&event("report_chunk", None, json!({"chunk": "More text. Sources: [1] foo"}), 8));

        let draft = projector.report().expect("draft report");
        assert_eq!(draft.executive_summary, "Intro text. More text.");
        assert_eq!(draft.metadata.word_count, 4);

        projector.apply(&event(
            "session_complete",
            None,
            json!({"status": "completed", "iterations": 1, "duration_seconds": 9.5, "total_tokens": 640, "total_cost_usd": 0.02}),
            10,
        ));

        assert!(!projector.is_researching());
        assert_eq!(projector.activity().progress, 100.0);
        assert_eq!(projector.activity().current_phase, Phase::Complete);
        let report = projector.report().expect("report");
        assert_eq!(report.executive_summary, "Intro text. More text.");
        let metrics = projector.metrics().expect("metrics");
        assert_eq!(metrics.total_tokens, 640);
        assert_eq!(metrics.duration_seconds, 9.5);
        assert_eq!(metrics.tool_success_rate, Some(1.0));
        assert_eq!(metrics.tools["web_search"].average_duration_ms, 400.0);
        assert_eq!(projector.history().count(), 1);
    }

    #[test]
    fn completion_envelope_carries_report_and_evaluation() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        run_first_iteration(&mut projector);
        projector.apply(&event(
            "completion",
            None,
            json!({"session": {
                "report": "# Findings\n\nTokio wins.\n\nSources:\n- https://tokio.rs",
                "sources": ["https://tokio.rs"],
                "iterations": 1,
                "duration": 12.0,
                "cost": 0.05,
                "metrics": {"total_tokens_used": 900},
                "evaluation": {"relevance": 8.5}
            }}),
            12,
        ));
        projector.apply(&event("session_complete", None, json!({"status": "completed", "iterations": 1}), 13));

        let report = projector.report().expect("report");
        assert_eq!(report.title, "Findings");
        assert_eq!(report.executive_summary, "Tokio wins.");
        assert_eq!(report.sources.len(), 1);
        assert_eq!(projector.history().count(), 1);
        let entry = projector.history().last().expect("entry");
        assert_eq!(entry.metrics.evaluation, Some(json!({"relevance": 8.5})));
    }

    #[test]
    fn history_is_capped_fifo_across_sessions() {
        let mut projector = ProgressProjector::new(ProjectorConfig {
            history_limit: 2,
            ..ProjectorConfig::default()
        });
        for (offset, session) in ["a", "b", "c"].into_iter().enumerate() {
            let at = offset as i64 * 10;
            projector.apply(&event_for(session, "session_start", None, json!({}), at));
            projector.apply(&event_for(session, "session_complete", None, json!({"status": "completed"}), at + 5));
        }
        let kept: Vec<_> = projector.history().map(|entry| entry.session_id.as_str()).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[test]
    fn max_iterations_resolution_and_zero_limit() {
        let mut projector = ProgressProjector::new(ProjectorConfig {
            max_iterations: 0,
            ..ProjectorConfig::default()
        });
        projector.apply(&event("iteration_start", Some(1), json!({}), 1));
        assert_eq!(projector.activity().max_iterations, 1);
        assert!((projector.activity().progress - 15.0).abs() < 1e-9);

        projector.apply(&event("session_start", None, json!({"max_iterations": 0}), 2));
        projector.apply(&event("iteration_start", Some(1), json!({}), 3));
        assert_eq!(projector.activity().max_iterations, 0);
        assert_eq!(projector.activity().progress, 0.0);
    }

    #[test]
    fn progress_update_overrides_and_clamps() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        let mut update = event("progress_update", Some(2), json!({"progress": 150, "phase": "acting"}), 4);
        update.message = Some("Halfway there".to_string());
        projector.apply(&update);
        let activity = projector.activity();
        assert_eq!(activity.progress, 100.0);
        assert_eq!(activity.current_phase, Phase::Acting);
        assert_eq!(activity.current_activity, "Halfway there");
        assert_eq!(activity.current_iteration, 2);
    }

    #[test]
    fn domain_errors_are_returned_and_reported_to_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut projector = ProgressProjector::new(ProjectorConfig::default()).with_error_hook(
            move |failure: &DomainFailure| {
                sink.lock().expect("lock").push(failure.message.clone());
            },
        );
        run_first_iteration(&mut projector);

        let failure = projector
            .apply(&event("error", Some(1), json!({"iteration": 1, "error": "rate limited"}), 7))
            .expect("failure");
        assert_eq!(failure.kind, FailureKind::Error);
        assert_eq!(failure.message, "rate limited");
        assert_eq!(projector.iteration(1).map(|it| it.status), Some(IterationStatus::Failed));
        assert!(!projector.is_researching());
        assert_eq!(projector.activity().current_phase, Phase::Failed);
        assert_eq!(projector.activity().progress, 50.0);

        let failure = projector
            .apply(&event("session_failed", None, json!({"error": "provider down"}), 8))
            .expect("failure");
        assert_eq!(failure.kind, FailureKind::SessionFailed);
        assert_eq!(*seen.lock().expect("lock"), vec!["rate limited", "provider down"]);
    }

    #[test]
    fn finish_becomes_synthetic_iteration_with_report() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        run_first_iteration(&mut projector);
        projector.apply(&event(
            "finish",
            None,
            json!({"report_length": 31, "num_sources": 1, "report": "Answer body.", "sources": ["https://a.example"]}),
            9,
        ));
        let finish = projector.iteration(2).expect("synthetic iteration");
        assert_eq!(finish.status, IterationStatus::Complete);
        assert_eq!(finish.action.as_ref().map(|a| a.tool_name.as_str()), Some("finish"));
        assert_eq!(projector.report().map(|r| r.sources.len()), Some(1));
        assert_eq!(projector.activity().current_phase, Phase::Evaluating);
    }

    #[test]
    fn finish_accepts_structured_report_object() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        run_first_iteration(&mut projector);
        projector.apply(&event(
            "finish",
            Some(1),
            json!({
                "num_sources": 1,
                "report": {
                    "title": "Async runtimes",
                    "executive_summary": "Tokio leads.",
                    "sections": [{"title": "Adoption", "content": "Most crates target it."}]
                },
                "sources": ["https://a.example"]
            }),
            9,
        ));
        let report = projector.report().expect("structured report");
        assert_eq!(report.title, "Async runtimes");
        assert_eq!(report.sections.len(), 1);
        assert_eq!(report.sources.len(), 1);
        assert_eq!(report.metadata.sources_count, 1);
    }

    #[test]
    fn implicit_iteration_index_saturates() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        projector.apply(&event("iteration_start", Some(u32::MAX), json!({}), 1));
        projector.apply(&event("iteration_start", None, json!({}), 2));
        projector.apply(&event("finish", None, json!({"num_sources": 0}), 3));
        assert_eq!(projector.session().current_iteration, u32::MAX);
        assert_eq!(projector.iterations().count(), 1);
        let last = projector.iteration(u32::MAX).expect("iteration");
        assert_eq!(last.status, IterationStatus::Complete);
        assert!(projector.activity().progress <= 100.0);
    }

    #[test]
    fn new_session_discards_previous_iterations() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        run_first_iteration(&mut projector);
        projector.apply(&event_for("s-2", "thought", Some(1), json!({"thought": "fresh"}), 20));
        assert_eq!(projector.session().session_id.as_deref(), Some("s-2"));
        assert_eq!(projector.iterations().count(), 1);
        assert!(projector.tool_outputs().is_empty());
        assert_eq!(
            projector.iteration(1).and_then(|it| it.thought.as_ref()).map(|t| t.content.as_str()),
            Some("fresh")
        );
    }

    #[test]
    fn unknown_kinds_leave_state_untouched() {
        let mut projector = ProgressProjector::new(ProjectorConfig::default());
        run_first_iteration(&mut projector);
        let before = projector.activity().clone();
        assert!(projector.apply(&event("heartbeat_v2", None, json!({}), 30)).is_none());
        assert_eq!(projector.activity(), &before);
    }
}
