//! Aggregate dashboard statistics derived from session snapshots.
//!
//! Pure computations, no side effects: every function reads the given
//! sessions and produces numbers. Cumulative counters contribute their
//! latest observed raw value per session, not their sample-by-sample sum.

use std::collections::HashMap;

use crate::state::{
    SessionData, API_ERROR_EVENT, API_REQUEST_EVENT, COMMIT_METRIC, EDIT_DECISION_METRIC,
    LINES_OF_CODE_METRIC, PULL_REQUEST_METRIC, TOKEN_METRIC, TOOL_RESULT_EVENT,
};

/// Cost and token totals for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelStats {
    pub model: String,
    pub total_cost: f64,
    pub total_tokens: i64,
}

/// Tool invocation frequency entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUsage {
    pub tool_name: String,
    pub count: usize,
}

/// Everything the dashboard's statistics panel displays.
#[derive(Debug, Clone, Default)]
pub struct DashboardStats {
    pub lines_added: i64,
    pub lines_removed: i64,
    pub commits: i64,
    pub pull_requests: i64,
    /// Tool name -> acceptance rate in [0, 1].
    pub tool_acceptance: HashMap<String, f64>,
    /// cacheRead / (input + cacheRead), 0 when there is no token data.
    pub cache_efficiency: f64,
    /// Mean api_request duration in seconds.
    pub avg_api_latency: f64,
    /// Sorted by cost, highest first.
    pub model_breakdown: Vec<ModelStats>,
    /// Sorted by count, highest first.
    pub top_tools: Vec<ToolUsage>,
    /// api_error events per api_request event.
    pub error_rate: f64,
}

/// Computes the full statistics set from session snapshots.
pub fn compute(sessions: &[SessionData]) -> DashboardStats {
    let (lines_added, lines_removed) = lines_of_code(sessions);

    DashboardStats {
        lines_added,
        lines_removed,
        commits: latest_counter_total(sessions, COMMIT_METRIC),
        pull_requests: latest_counter_total(sessions, PULL_REQUEST_METRIC),
        tool_acceptance: tool_acceptance(sessions),
        cache_efficiency: cache_efficiency(sessions),
        avg_api_latency: avg_api_latency(sessions),
        model_breakdown: model_breakdown(sessions),
        top_tools: top_tools(sessions),
        error_rate: error_rate(sessions),
    }
}

/// Total lines added/removed from the lines-of-code counter, latest value
/// per session and type.
fn lines_of_code(sessions: &[SessionData]) -> (i64, i64) {
    let mut added = 0i64;
    let mut removed = 0i64;

    for session in sessions {
        let mut last_added = 0.0;
        let mut last_removed = 0.0;
        for m in &session.metrics {
            if m.name != LINES_OF_CODE_METRIC {
                continue;
            }
            match m.attributes.get("type").map(String::as_str) {
                Some("added") => last_added = m.value,
                Some("removed") => last_removed = m.value,
                _ => {}
            }
        }
        added += last_added as i64;
        removed += last_removed as i64;
    }

    (added, removed)
}

/// Sum of the latest raw value of a named cumulative counter across sessions.
fn latest_counter_total(sessions: &[SessionData], metric_name: &str) -> i64 {
    sessions
        .iter()
        .map(|session| {
            session
                .metrics
                .iter()
                .filter(|m| m.name == metric_name)
                .next_back()
                .map(|m| m.value as i64)
                .unwrap_or(0)
        })
        .sum()
}

/// Acceptance rate per tool from edit-decision counters: accepted / total,
/// using the latest value per session, tool, and decision.
fn tool_acceptance(sessions: &[SessionData]) -> HashMap<String, f64> {
    let mut accepted: HashMap<String, i64> = HashMap::new();
    let mut totals: HashMap<String, i64> = HashMap::new();

    for session in sessions {
        let mut latest: HashMap<(String, String), f64> = HashMap::new();
        for m in &session.metrics {
            if m.name != EDIT_DECISION_METRIC {
                continue;
            }
            let tool = m.attributes.get("tool").cloned().unwrap_or_default();
            let decision = m.attributes.get("decision").cloned().unwrap_or_default();
            latest.insert((tool, decision), m.value);
        }

        for ((tool, decision), value) in latest {
            let count = value as i64;
            *totals.entry(tool.clone()).or_default() += count;
            if decision.eq_ignore_ascii_case("accept") {
                *accepted.entry(tool).or_default() += count;
            }
        }
    }

    totals
        .into_iter()
        .map(|(tool, total)| {
            let rate = if total == 0 {
                0.0
            } else {
                *accepted.get(&tool).unwrap_or(&0) as f64 / total as f64
            };
            (tool, rate)
        })
        .collect()
}

/// cacheRead / (input + cacheRead) from token counters, latest value per
/// session and type. Zero when there is no token data.
fn cache_efficiency(sessions: &[SessionData]) -> f64 {
    let mut cache_read = 0.0;
    let mut input = 0.0;

    for session in sessions {
        let mut last_cache_read = 0.0;
        let mut last_input = 0.0;
        for m in &session.metrics {
            if m.name != TOKEN_METRIC {
                continue;
            }
            match m.attributes.get("type").map(String::as_str) {
                Some("cacheRead") => last_cache_read = m.value,
                Some("input") => last_input = m.value,
                _ => {}
            }
        }
        cache_read += last_cache_read;
        input += last_input;
    }

    let denominator = input + cache_read;
    if denominator == 0.0 {
        0.0
    } else {
        cache_read / denominator
    }
}

/// Mean duration_ms of api_request events, converted to seconds.
fn avg_api_latency(sessions: &[SessionData]) -> f64 {
    let mut total_ms = 0.0;
    let mut count = 0usize;

    for session in sessions {
        for e in &session.events {
            if e.name != API_REQUEST_EVENT {
                continue;
            }
            if let Some(ms) = e.attributes.get("duration_ms").and_then(|d| d.parse::<f64>().ok()) {
                total_ms += ms;
                count += 1;
            }
        }
    }

    if count == 0 {
        0.0
    } else {
        total_ms / count as f64 / 1000.0
    }
}

/// Cost and token totals grouped by model from api_request events, sorted by
/// cost descending.
fn model_breakdown(sessions: &[SessionData]) -> Vec<ModelStats> {
    let mut models: HashMap<String, (f64, i64)> = HashMap::new();

    for session in sessions {
        for e in &session.events {
            if e.name != API_REQUEST_EVENT {
                continue;
            }
            let Some(model) = e.attributes.get("model").filter(|m| !m.is_empty()) else {
                continue;
            };

            let entry = models.entry(model.clone()).or_default();

            if let Some(cost) = e.attributes.get("cost_usd").and_then(|c| c.parse::<f64>().ok()) {
                entry.0 += cost;
            }
            for key in ["input_tokens", "output_tokens"] {
                if let Some(tokens) = e.attributes.get(key).and_then(|t| t.parse::<i64>().ok()) {
                    entry.1 += tokens;
                }
            }
        }
    }

    let mut result: Vec<ModelStats> = models
        .into_iter()
        .map(|(model, (total_cost, total_tokens))| ModelStats {
            model,
            total_cost,
            total_tokens,
        })
        .collect();

    result.sort_by(|a, b| {
        b.total_cost
            .partial_cmp(&a.total_cost)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    result
}

/// Tools ranked by tool_result frequency, highest first.
fn top_tools(sessions: &[SessionData]) -> Vec<ToolUsage> {
    let mut tools: HashMap<String, usize> = HashMap::new();

    for session in sessions {
        for e in &session.events {
            if e.name != TOOL_RESULT_EVENT {
                continue;
            }
            if let Some(tool) = e.attributes.get("tool_name").filter(|t| !t.is_empty()) {
                *tools.entry(tool.clone()).or_default() += 1;
            }
        }
    }

    let mut result: Vec<ToolUsage> = tools
        .into_iter()
        .map(|(tool_name, count)| ToolUsage { tool_name, count })
        .collect();

    result.sort_by(|a, b| b.count.cmp(&a.count));
    result
}

/// api_error events per api_request event; zero without any requests.
fn error_rate(sessions: &[SessionData]) -> f64 {
    let mut requests = 0usize;
    let mut errors = 0usize;

    for session in sessions {
        for e in &session.events {
            match e.name.as_str() {
                API_REQUEST_EVENT => requests += 1,
                API_ERROR_EVENT => errors += 1,
                _ => {}
            }
        }
    }

    if requests == 0 {
        0.0
    } else {
        errors as f64 / requests as f64
    }
}
