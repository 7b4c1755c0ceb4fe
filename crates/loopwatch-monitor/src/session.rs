use loopwatch_core::CanonicalUpdate;
use loopwatch_progress::{
    ActivityState, DomainFailure, FailureKind, ProgressProjector, ProjectorConfig, RunMetrics,
};
use loopwatch_stream::{ConnectionState, StreamEvent};
use loopwatch_workflow::{NodeId, WorkflowConfig, WorkflowMachine};
use serde::Serialize;
use tracing::{info, warn};

/// Single consumer of the transport queue: every update goes to the projector
/// and the workflow machine in arrival order, then gets rendered.
pub struct SessionView {
    projector: ProgressProjector,
    workflow: WorkflowMachine,
    json: bool,
    finished: bool,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Snapshot<'a> {
    Transport {
        #[serde(flatten)]
        state: &'a ConnectionState,
    },
    Session {
        session_id: Option<&'a str>,
    },
    Update {
        event: &'a str,
        session_id: &'a str,
        activity: &'a ActivityState,
        workflow: WorkflowSnapshot,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<&'a DomainFailure>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metrics: Option<&'a RunMetrics>,
    },
}

#[derive(Serialize)]
struct WorkflowSnapshot {
    iteration: u32,
    max_iterations: u32,
    active_node: Option<NodeId>,
    flowing_edge: Option<String>,
}

impl SessionView {
    pub fn new(max_iterations: u32, json: bool) -> Self {
        Self {
            projector: ProgressProjector::new(ProjectorConfig {
                max_iterations,
                ..ProjectorConfig::default()
            })
            .with_error_hook(|failure| {
                warn!(
                    "agent_failure: session={} kind={:?} message={}",
                    failure.session_id, failure.kind, failure.message
                )
            }),
            workflow: WorkflowMachine::new(WorkflowConfig {
                max_iterations,
                ..WorkflowConfig::default()
            }),
            json,
            finished: false,
        }
    }

    pub fn projector(&self) -> &ProgressProjector {
        &self.projector
    }

    pub fn workflow(&self) -> &WorkflowMachine {
        &self.workflow
    }

    /// Set once the agent reported a terminal outcome for the current session.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the lines to print for `event`.
    pub fn handle(&mut self, event: StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::Status(state) => self.on_status(&state),
            StreamEvent::SessionChanged { session_id } => {
                // derived state of the old session must go before its successor's frames
                self.projector.reset_session(session_id.as_deref());
                self.workflow.reset();
                self.finished = false;
                info!("monitor_session_changed: {session_id:?}");
                let line = if self.json {
                    self.encode(&Snapshot::Session {
                        session_id: session_id.as_deref(),
                    })
                } else {
                    Some(format!(
                        "[session] {}",
                        session_id.as_deref().unwrap_or("none")
                    ))
                };
                line.into_iter().collect()
            }
            StreamEvent::Update(update) => self.on_update(&update),
        }
    }

    fn on_status(&self, state: &ConnectionState) -> Vec<String> {
        if self.json {
            return self
                .encode(&Snapshot::Transport { state })
                .into_iter()
                .collect();
        }
        let mut line = format!(
            "[transport] {} via {} (socket {}, stream {})",
            state.status, state.mode, state.socket_attempts, state.push_stream_attempts
        );
        if let Some(err) = &state.last_error {
            line.push_str(&format!(": {err}"));
        }
        vec![line]
    }

    fn on_update(&mut self, update: &CanonicalUpdate) -> Vec<String> {
        let failure = self.projector.apply(update);
        self.workflow.apply(update);
        // a plain `error` event leaves the run going; only session_failed ends it
        let failed = failure
            .as_ref()
            .is_some_and(|failure| failure.kind == FailureKind::SessionFailed);
        if failed {
            self.finished = true;
        } else if self.projector.metrics().is_some() && !self.projector.is_researching() {
            self.finished = true;
        }
        let terminal = update.kind.is_terminal();

        if self.json {
            let state = self.workflow.state();
            let snapshot = Snapshot::Update {
                event: update.kind.as_str(),
                session_id: &update.session_id,
                activity: self.projector.activity(),
                workflow: WorkflowSnapshot {
                    iteration: state.iteration.current,
                    max_iterations: state.iteration.max,
                    active_node: state.first_active_node(),
                    flowing_edge: state.flowing_edges().next().map(|edge| edge.to_string()),
                },
                failure: failure.as_ref(),
                metrics: self.projector.metrics().filter(|_| terminal),
            };
            return self.encode(&snapshot).into_iter().collect();
        }

        let mut lines = vec![self.activity_line()];
        if let Some(failure) = &failure {
            lines.push(format!("[failed] {}", failure.message));
        }
        if terminal {
            if let Some(report) = self.projector.report() {
                lines.push(format!(
                    "[report] {} ({} words, {} sources)",
                    report.title, report.metadata.word_count, report.metadata.sources_count
                ));
            }
            if let Some(metrics) = self.projector.metrics() {
                lines.push(metrics_line(metrics));
            }
        }
        lines
    }

    fn activity_line(&self) -> String {
        let activity = self.projector.activity();
        let node = self
            .workflow
            .state()
            .first_active_node()
            .map(|node| node.as_str())
            .unwrap_or("-");
        format!(
            "[iter {}/{}] {} {:.0}% node={} | {}",
            activity.current_iteration,
            activity.max_iterations,
            activity.current_phase.as_str(),
            activity.progress,
            node,
            activity.current_activity
        )
    }

    fn encode<T: Serialize>(&self, snapshot: &T) -> Option<String> {
        match serde_json::to_string(snapshot) {
            Ok(line) => Some(line),
            Err(err) => {
                warn!("snapshot_encode_error: {err}");
                None
            }
        }
    }
}

fn metrics_line(metrics: &RunMetrics) -> String {
    let success = metrics
        .tool_success_rate
        .map(|rate| format!("{:.0}%", rate * 100.0))
        .unwrap_or_else(|| "n/a".to_string());
    format!(
        "[metrics] iterations={} duration={:.1}s tokens={} cost=${:.4} tool_success={success}",
        metrics.iterations, metrics.duration_seconds, metrics.total_tokens, metrics.total_cost_usd
    )
}
