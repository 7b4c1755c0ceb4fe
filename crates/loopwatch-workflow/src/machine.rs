use loopwatch_core::CanonicalUpdate;
use tracing::debug;

use crate::event::WorkflowEvent;
use crate::reducer::{apply_in_place, WorkflowConfig, WorkflowState};

/// Owns one [`WorkflowState`] and feeds it canonical updates.
#[derive(Debug, Default)]
pub struct WorkflowMachine {
    state: WorkflowState,
}

impl WorkflowMachine {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            state: WorkflowState::new(config),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Returns `true` when the update moved the graph.
    pub fn apply(&mut self, update: &CanonicalUpdate) -> bool {
        let Some(event) = WorkflowEvent::from_update(update) else {
            debug!(
                "workflow_skip: kind={} session={}",
                update.kind, update.session_id
            );
            return false;
        };
        apply_in_place(&mut self.state, &event, update.timestamp);
        true
    }

    /// Drops the graph without waiting for a `session_start`.
    pub fn reset(&mut self) {
        let config = self.state.config().clone();
        self.state = WorkflowState::new(config);
    }
}
