use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Running tally for one tool across the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub executions: u64,
    pub successes: u64,
    pub total_duration_ms: f64,
    pub results: u64,
}

impl ToolStats {
    pub fn record(&mut self, success: bool, duration_ms: f64, results: u64) {
        self.executions += 1;
        if success {
            self.successes += 1;
        }
        self.total_duration_ms += duration_ms.max(0.0);
        self.results += results;
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.total_duration_ms / self.executions as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetrics {
    pub executions: u64,
    pub successes: u64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub iterations: u32,
    pub duration_seconds: f64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    /// `None` when no tool ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_success_rate: Option<f64>,
    pub tools: BTreeMap<String, ToolMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Value>,
}

/// Totals the terminal event reported, each falling back to what the
/// projector observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportedTotals {
    pub iterations: Option<u32>,
    pub duration_seconds: Option<f64>,
    pub total_tokens: Option<u64>,
    pub total_cost_usd: Option<f64>,
}

pub fn compute_run_metrics(
    tools: &BTreeMap<String, ToolStats>,
    reported: &ReportedTotals,
    observed_iterations: u32,
    observed_duration_seconds: f64,
    observed_tokens: u64,
    evaluation: Option<Value>,
) -> RunMetrics {
    let executions: u64 = tools.values().map(|stats| stats.executions).sum();
    let successes: u64 = tools.values().map(|stats| stats.successes).sum();
    let tool_success_rate = (executions > 0).then(|| successes as f64 / executions as f64);
    RunMetrics {
        iterations: reported.iterations.unwrap_or(observed_iterations),
        duration_seconds: reported
            .duration_seconds
            .unwrap_or(observed_duration_seconds)
            .max(0.0),
        total_tokens: reported.total_tokens.unwrap_or(observed_tokens),
        total_cost_usd: reported.total_cost_usd.unwrap_or(0.0),
        tool_success_rate,
        tools: tools
            .iter()
            .map(|(name, stats)| {
                (
                    name.clone(),
                    ToolMetrics {
                        executions: stats.executions,
                        successes: stats.successes,
                        average_duration_ms: stats.average_duration_ms(),
                    },
                )
            })
            .collect(),
        evaluation,
    }
}

/// One finished run as kept in the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub status: String,
    pub completed_at: DateTime<Utc>,
    pub metrics: RunMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_spans_all_tools() {
        let mut tools = BTreeMap::new();
        let search: &mut ToolStats = tools.entry("web_search".to_string()).or_default();
        search.record(true, 100.0, 3);
        search.record(false, 300.0, 0);
        let arxiv: &mut ToolStats = tools.entry("arxiv_search".to_string()).or_default();
        arxiv.record(true, 50.0, 2);

        let metrics = compute_run_metrics(&tools, &ReportedTotals::default(), 2, 12.5, 900, None);
        let rate = metrics.tool_success_rate.expect("rate");
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(metrics.tools["web_search"].average_duration_ms, 200.0);
        assert_eq!(metrics.tools["arxiv_search"].executions, 1);
        assert_eq!(metrics.duration_seconds, 12.5);
        assert_eq!(metrics.total_tokens, 900);
    }

    #[test]
    fn reported_totals_win_over_observed() {
        let reported = ReportedTotals {
            iterations: Some(4),
            duration_seconds: Some(61.0),
            total_tokens: Some(12_000),
            total_cost_usd: Some(0.42),
        };
        let metrics = compute_run_metrics(&BTreeMap::new(), &reported, 2, 10.0, 100, None);
        assert_eq!(metrics.iterations, 4);
        assert_eq!(metrics.duration_seconds, 61.0);
        assert_eq!(metrics.total_tokens, 12_000);
        assert_eq!(metrics.total_cost_usd, 0.42);
        assert_eq!(metrics.tool_success_rate, None);
    }
}
