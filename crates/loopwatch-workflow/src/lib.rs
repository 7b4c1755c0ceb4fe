//! Six-node agent loop graph (start, think, operate, reflect, evaluator,
//! finish) driven by canonical updates.

pub mod event;
pub mod graph;
pub mod machine;
pub mod reducer;

pub use event::{PassMode, WorkflowEvent};
pub use graph::{
    EdgeId, EdgeState, EdgeStatus, EdgeStyle, IterationBadge, NodeId, NodeState, NodeStatus,
};
pub use machine::WorkflowMachine;
pub use reducer::{
    apply_in_place, reduce, CurrentAction, HistoryEntry, IterationCounter, PendingFinish,
    SessionStats, WorkflowConfig, WorkflowState, DEFAULT_HISTORY_LIMIT, DEFAULT_MAX_ITERATIONS,
};
