//! Progress projection for a streamed agent session.
//!
//! [`ProgressProjector`] folds canonical updates into per-iteration records,
//! the activity/progress banner, tool output summaries, the research report
//! and run metrics.

pub mod activity;
pub mod iteration;
pub mod metrics;
pub mod projector;
pub mod report;

pub use activity::{compute_progress, ActivityState, Phase};
pub use iteration::{Iteration, IterationMode, IterationStatus};
pub use metrics::{RunHistoryEntry, RunMetrics};
pub use projector::{
    DomainFailure, FailureKind, ProgressProjector, ProjectorConfig, SessionContext,
    ToolOutputSummary,
};
pub use report::{ResearchReport, ReportSource};
