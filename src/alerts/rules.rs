use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::burnrate::Calculator;
use crate::config::Config;
use crate::state::{
    MemoryStore, API_ERROR_EVENT, API_REQUEST_EVENT, TOOL_DECISION_EVENT, TOOL_RESULT_EVENT,
    USER_PROMPT_EVENT,
};

use super::normalize::{CommandNormalizer, DefaultNormalizer};
use super::{Alert, RuleKind, Severity};

/// Trailing window for the error-storm rule.
const ERROR_STORM_WINDOW: Duration = Duration::from_secs(60);

/// Trailing window for the high-rejection rule.
const HIGH_REJECTION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// One anomaly rule. Rules own whatever private state they need across
/// evaluations (sustain timers, event watermarks, hash tables).
pub trait Rule: Send {
    fn evaluate(&mut self, store: &MemoryStore, now: SystemTime) -> Vec<Alert>;
}

/// Builds the full rule set from configuration. The calculator is shared
/// with the cost/velocity rules.
pub(crate) fn build_rules(cfg: &Config, calculator: Arc<Calculator>) -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(CostSurgeRule {
            threshold: cfg.alerts.cost_surge_threshold_per_hour,
            calculator: Arc::clone(&calculator),
        }),
        Box::new(RunawayTokensRule {
            velocity_threshold: cfg.alerts.runaway_token_velocity as f64,
            sustain: Duration::from_secs(cfg.alerts.runaway_token_sustained_minutes * 60),
            calculator,
            exceeded_since: None,
        }),
        Box::new(LoopDetectorRule::new(
            cfg.alerts.loop_detector_threshold,
            Duration::from_secs(cfg.alerts.loop_detector_window_minutes * 60),
            Box::new(DefaultNormalizer),
        )),
        Box::new(ErrorStormRule {
            threshold: cfg.alerts.error_storm_count,
        }),
        Box::new(StaleSessionRule {
            max_age: Duration::from_secs(cfg.alerts.stale_session_hours * 3600),
        }),
        Box::new(ContextPressureRule {
            pressure_percent: cfg.alerts.context_pressure_percent,
            model_limits: cfg.models.clone(),
            warned_models: HashSet::new(),
        }),
        Box::new(HighRejectionRule),
    ]
}

/// Fires when the global hourly cost rate meets the configured threshold.
struct CostSurgeRule {
    threshold: f64,
    calculator: Arc<Calculator>,
}

impl Rule for CostSurgeRule {
    fn evaluate(&mut self, store: &MemoryStore, now: SystemTime) -> Vec<Alert> {
        let br = self.calculator.compute_at(store, now);
        if br.hourly_rate >= self.threshold {
            return vec![Alert {
                rule: RuleKind::CostSurge,
                severity: Severity::Critical,
                session_id: String::new(),
                message: format!(
                    "Cost surge: ${:.2}/hr exceeds threshold ${:.2}/hr",
                    br.hourly_rate, self.threshold,
                ),
                fired_at: now,
            }];
        }
        Vec::new()
    }
}

/// Fires when token velocity stays over the threshold for the sustain
/// period. Dropping below the threshold resets the timer.
struct RunawayTokensRule {
    velocity_threshold: f64,
    sustain: Duration,
    calculator: Arc<Calculator>,
    exceeded_since: Option<SystemTime>,
}

impl Rule for RunawayTokensRule {
    fn evaluate(&mut self, store: &MemoryStore, now: SystemTime) -> Vec<Alert> {
        let br = self.calculator.compute_at(store, now);

        if br.token_velocity < self.velocity_threshold {
            self.exceeded_since = None;
            return Vec::new();
        }

        let since = *self.exceeded_since.get_or_insert(now);
        let sustained = now.duration_since(since).unwrap_or(Duration::ZERO);
        if sustained >= self.sustain {
            return vec![Alert {
                rule: RuleKind::RunawayTokens,
                severity: Severity::Warning,
                session_id: String::new(),
                message: format!(
                    "Runaway tokens: {:.0} tokens/min exceeds threshold {:.0} for {}+ min",
                    br.token_velocity,
                    self.velocity_threshold,
                    self.sustain.as_secs() / 60,
                ),
                fired_at: now,
            }];
        }

        Vec::new()
    }
}

/// Fires when the same (normalized) Bash command fails repeatedly inside
/// the window. Tracks a per-session event watermark so each event is
/// examined once.
struct LoopDetectorRule {
    threshold: usize,
    window: Duration,
    normalizer: Box<dyn CommandNormalizer>,
    /// session -> command hash -> failure timestamps within the window.
    failures: HashMap<String, HashMap<String, Vec<SystemTime>>>,
    /// session -> number of events already examined.
    watermarks: HashMap<String, usize>,
}

impl LoopDetectorRule {
    fn new(threshold: usize, window: Duration, normalizer: Box<dyn CommandNormalizer>) -> Self {
        Self {
            threshold,
            window,
            normalizer,
            failures: HashMap::new(),
            watermarks: HashMap::new(),
        }
    }
}

impl Rule for LoopDetectorRule {
    fn evaluate(&mut self, store: &MemoryStore, now: SystemTime) -> Vec<Alert> {
        let cutoff = now.checked_sub(self.window);
        let mut alerts = Vec::new();

        for session in store.list_sessions() {
            let watermark = self.watermarks.entry(session.session_id.clone()).or_insert(0);

            for event in session.events.iter().skip(*watermark) {
                if event.name != TOOL_RESULT_EVENT {
                    continue;
                }
                if event.attributes.get("tool_name").map(String::as_str) != Some("Bash") {
                    continue;
                }
                if event.attributes.get("success").map(String::as_str) == Some("true") {
                    continue;
                }

                let Some(command) = event
                    .attributes
                    .get("tool_parameters")
                    .and_then(|params| extract_bash_command(params))
                else {
                    continue;
                };

                let hash = self.normalizer.normalize(&command);
                if hash.is_empty() {
                    continue;
                }

                self.failures
                    .entry(session.session_id.clone())
                    .or_default()
                    .entry(hash)
                    .or_default()
                    .push(event.timestamp);
            }
            *watermark = session.events.len();

            let Some(session_failures) = self.failures.get_mut(&session.session_id) else {
                continue;
            };

            for timestamps in session_failures.values_mut() {
                if let Some(cutoff) = cutoff {
                    timestamps.retain(|ts| *ts >= cutoff);
                }

                if timestamps.len() >= self.threshold {
                    alerts.push(Alert {
                        rule: RuleKind::LoopDetector,
                        severity: Severity::Warning,
                        session_id: session.session_id.clone(),
                        message: format!(
                            "Loop detected: same command failed {} times in {} min",
                            timestamps.len(),
                            self.window.as_secs() / 60,
                        ),
                        fired_at: now,
                    });
                }
            }
        }

        alerts
    }
}

/// Pulls the command string out of a tool_parameters JSON blob, accepting
/// both the `bash_command` and `command` keys.
fn extract_bash_command(tool_params: &str) -> Option<String> {
    if tool_params.is_empty() {
        return None;
    }

    let params: serde_json::Value = serde_json::from_str(tool_params).ok()?;
    params
        .get("bash_command")
        .or_else(|| params.get("command"))?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Fires when api_error events inside the trailing minute exceed the
/// threshold.
struct ErrorStormRule {
    threshold: usize,
}

impl Rule for ErrorStormRule {
    fn evaluate(&mut self, store: &MemoryStore, now: SystemTime) -> Vec<Alert> {
        let Some(cutoff) = now.checked_sub(ERROR_STORM_WINDOW) else {
            return Vec::new();
        };
        let mut alerts = Vec::new();

        for session in store.list_sessions() {
            let count = session
                .events
                .iter()
                .filter(|e| e.name == API_ERROR_EVENT && e.timestamp >= cutoff)
                .count();

            if count > self.threshold {
                alerts.push(Alert {
                    rule: RuleKind::ErrorStorm,
                    severity: Severity::Critical,
                    session_id: session.session_id.clone(),
                    message: format!(
                        "Error storm: {count} API errors in 1 minute (threshold {})",
                        self.threshold,
                    ),
                    fired_at: now,
                });
            }
        }

        alerts
    }
}

/// Fires for long-running sessions that never saw a user prompt.
struct StaleSessionRule {
    max_age: Duration,
}

impl Rule for StaleSessionRule {
    fn evaluate(&mut self, store: &MemoryStore, now: SystemTime) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for session in store.list_sessions() {
            if session.exited {
                continue;
            }

            let age = now
                .duration_since(session.started_at)
                .unwrap_or(Duration::ZERO);
            if age < self.max_age {
                continue;
            }

            let has_prompt = session.events.iter().any(|e| e.name == USER_PROMPT_EVENT);
            if !has_prompt {
                alerts.push(Alert {
                    rule: RuleKind::StaleSession,
                    severity: Severity::Warning,
                    session_id: session.session_id.clone(),
                    message: format!(
                        "Stale session: active for {:.0} hours with no user prompts",
                        age.as_secs_f64() / 3600.0,
                    ),
                    fired_at: now,
                });
            }
        }

        alerts
    }
}

/// Fires when an api_request's input tokens approach the model's context
/// limit. Unknown models are logged once and skipped.
struct ContextPressureRule {
    pressure_percent: u32,
    model_limits: HashMap<String, u64>,
    warned_models: HashSet<String>,
}

impl Rule for ContextPressureRule {
    fn evaluate(&mut self, store: &MemoryStore, now: SystemTime) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for session in store.list_sessions() {
            for event in &session.events {
                if event.name != API_REQUEST_EVENT {
                    continue;
                }

                let Some(model) = event.attributes.get("model").filter(|m| !m.is_empty()) else {
                    continue;
                };

                let Some(&limit) = self.model_limits.get(model) else {
                    if self.warned_models.insert(model.clone()) {
                        warn!(model = %model, "model not in context limit map, skipping context pressure check");
                    }
                    continue;
                };

                let Some(input_tokens) = event
                    .attributes
                    .get("input_tokens")
                    .and_then(|t| t.parse::<u64>().ok())
                else {
                    continue;
                };

                let threshold = limit as f64 * self.pressure_percent as f64 / 100.0;
                if input_tokens as f64 > threshold {
                    let pct = input_tokens as f64 / limit as f64 * 100.0;
                    alerts.push(Alert {
                        rule: RuleKind::ContextPressure,
                        severity: Severity::Warning,
                        session_id: session.session_id.clone(),
                        message: format!(
                            "Context pressure: {input_tokens} input tokens ({pct:.0}% of {limit} limit for {model})",
                        ),
                        fired_at: now,
                    });
                }
            }
        }

        alerts
    }
}

/// Fires when more than half of the tool decisions in the trailing five
/// minutes were rejections.
struct HighRejectionRule;

impl Rule for HighRejectionRule {
    fn evaluate(&mut self, store: &MemoryStore, now: SystemTime) -> Vec<Alert> {
        let Some(cutoff) = now.checked_sub(HIGH_REJECTION_WINDOW) else {
            return Vec::new();
        };
        let mut alerts = Vec::new();

        for session in store.list_sessions() {
            let mut total = 0usize;
            let mut rejects = 0usize;

            for event in &session.events {
                if event.name != TOOL_DECISION_EVENT || event.timestamp < cutoff {
                    continue;
                }
                total += 1;
                if event.attributes.get("decision").map(String::as_str) == Some("reject") {
                    rejects += 1;
                }
            }

            if total > 0 {
                let rate = rejects as f64 / total as f64;
                if rate > 0.50 {
                    alerts.push(Alert {
                        rule: RuleKind::HighRejection,
                        severity: Severity::Warning,
                        session_id: session.session_id.clone(),
                        message: format!(
                            "High rejection rate: {:.0}% of tool decisions rejected ({rejects}/{total} in 5min)",
                            rate * 100.0,
                        ),
                        fired_at: now,
                    });
                }
            }
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Event, Metric, COST_METRIC, TOKEN_METRIC};

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn add_cost(store: &MemoryStore, session: &str, value: f64, at: SystemTime) {
        store.add_metric(
            session,
            Metric {
                name: COST_METRIC.to_string(),
                value,
                timestamp: at,
                ..Default::default()
            },
        );
    }

    fn bash_failure(command: &str, at: SystemTime) -> Event {
        let params = serde_json::json!({ "bash_command": command }).to_string();
        Event {
            name: TOOL_RESULT_EVENT.to_string(),
            attributes: attrs(&[
                ("tool_name", "Bash"),
                ("success", "false"),
                ("tool_parameters", &params),
            ]),
            timestamp: at,
        }
    }

    #[test]
    fn test_cost_surge_fires_over_threshold() {
        let store = MemoryStore::new();
        let calc = Arc::new(Calculator::new());
        let mut rule = CostSurgeRule {
            threshold: 100.0,
            calculator: Arc::clone(&calc),
        };

        let base = SystemTime::now() - Duration::from_secs(360);

        // $10 over 5 minutes = $120/hr, above the $100/hr threshold.
        add_cost(&store, "sess-1", 0.0, base);
        calc.compute_at(&store, base);
        add_cost(&store, "sess-1", 10.0, base + Duration::from_secs(300));

        let alerts = rule.evaluate(&store, base + Duration::from_secs(300));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, RuleKind::CostSurge);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(alerts[0].session_id.is_empty());
    }

    #[test]
    fn test_cost_surge_quiet_below_threshold() {
        let store = MemoryStore::new();
        let calc = Arc::new(Calculator::new());
        let mut rule = CostSurgeRule {
            threshold: 100.0,
            calculator: Arc::clone(&calc),
        };

        let base = SystemTime::now() - Duration::from_secs(360);

        add_cost(&store, "sess-1", 0.0, base);
        calc.compute_at(&store, base);
        add_cost(&store, "sess-1", 0.05, base + Duration::from_secs(300));

        assert!(rule.evaluate(&store, base + Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn test_runaway_tokens_requires_sustained_velocity() {
        let store = MemoryStore::new();
        let calc = Arc::new(Calculator::new());
        let mut rule = RunawayTokensRule {
            velocity_threshold: 200_000.0,
            sustain: Duration::from_secs(60),
            calculator: Arc::clone(&calc),
            exceeded_since: None,
        };

        let base = SystemTime::now() - Duration::from_secs(600);

        store.add_metric(
            "sess-1",
            Metric {
                name: TOKEN_METRIC.to_string(),
                value: 0.0,
                attributes: attrs(&[("type", "input")]),
                timestamp: base,
            },
        );
        calc.compute_at(&store, base);

        // 1.5M tokens over 5 minutes = 300k tokens/min, over the threshold.
        store.add_metric(
            "sess-1",
            Metric {
                name: TOKEN_METRIC.to_string(),
                value: 1_500_000.0,
                attributes: attrs(&[("type", "input")]),
                timestamp: base + Duration::from_secs(300),
            },
        );

        // First breach starts the sustain timer without firing.
        let t1 = base + Duration::from_secs(300);
        assert!(rule.evaluate(&store, t1).is_empty());

        // Velocity stays high for another minute: fires.
        store.add_metric(
            "sess-1",
            Metric {
                name: TOKEN_METRIC.to_string(),
                value: 1_800_000.0,
                attributes: attrs(&[("type", "input")]),
                timestamp: t1 + Duration::from_secs(60),
            },
        );
        let alerts = rule.evaluate(&store, t1 + Duration::from_secs(60));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, RuleKind::RunawayTokens);
    }

    #[test]
    fn test_runaway_tokens_timer_resets_when_velocity_drops() {
        let store = MemoryStore::new();
        let calc = Arc::new(Calculator::new());
        let mut rule = RunawayTokensRule {
            velocity_threshold: 200_000.0,
            sustain: Duration::from_secs(60),
            calculator: calc,
            exceeded_since: None,
        };

        rule.exceeded_since = Some(SystemTime::now() - Duration::from_secs(120));

        // Empty store means zero velocity, which resets the timer.
        assert!(rule.evaluate(&store, SystemTime::now()).is_empty());
        assert!(rule.exceeded_since.is_none());
    }

    #[test]
    fn test_loop_detector_aliased_commands_fire_once() {
        let store = MemoryStore::new();
        let mut rule = LoopDetectorRule::new(
            3,
            Duration::from_secs(300),
            Box::new(DefaultNormalizer),
        );

        let now = SystemTime::now();

        // Three semantically equivalent failing commands inside the window.
        for (i, command) in ["npm test", "npm run test", "npx jest"].iter().enumerate() {
            store.add_event(
                "sess-1",
                bash_failure(command, now - Duration::from_secs(180 - i as u64 * 60)),
            );
        }

        let alerts = rule.evaluate(&store, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, RuleKind::LoopDetector);
        assert_eq!(alerts[0].session_id, "sess-1");
    }

    #[test]
    fn test_loop_detector_watermark_skips_seen_events() {
        let store = MemoryStore::new();
        let mut rule = LoopDetectorRule::new(
            3,
            Duration::from_secs(300),
            Box::new(DefaultNormalizer),
        );

        let now = SystemTime::now();
        store.add_event("sess-1", bash_failure("npm test", now));
        store.add_event("sess-1", bash_failure("npm test", now));

        // Two failures: below threshold.
        assert!(rule.evaluate(&store, now).is_empty());
        // Re-evaluating without new events must not double count.
        assert!(rule.evaluate(&store, now).is_empty());

        store.add_event("sess-1", bash_failure("npm test", now));
        assert_eq!(rule.evaluate(&store, now).len(), 1);
    }

    #[test]
    fn test_loop_detector_ignores_successes_and_other_tools() {
        let store = MemoryStore::new();
        let mut rule = LoopDetectorRule::new(
            2,
            Duration::from_secs(300),
            Box::new(DefaultNormalizer),
        );

        let now = SystemTime::now();
        let params = serde_json::json!({ "bash_command": "npm test" }).to_string();

        store.add_event(
            "sess-1",
            Event {
                name: TOOL_RESULT_EVENT.to_string(),
                attributes: attrs(&[
                    ("tool_name", "Bash"),
                    ("success", "true"),
                    ("tool_parameters", &params),
                ]),
                timestamp: now,
            },
        );
        store.add_event(
            "sess-1",
            Event {
                name: TOOL_RESULT_EVENT.to_string(),
                attributes: attrs(&[
                    ("tool_name", "Read"),
                    ("success", "false"),
                    ("tool_parameters", &params),
                ]),
                timestamp: now,
            },
        );

        assert!(rule.evaluate(&store, now).is_empty());
    }

    #[test]
    fn test_loop_detector_prunes_outside_window() {
        let store = MemoryStore::new();
        let mut rule = LoopDetectorRule::new(
            3,
            Duration::from_secs(300),
            Box::new(DefaultNormalizer),
        );

        let now = SystemTime::now();

        // Two stale failures and one fresh one: below threshold.
        store.add_event("sess-1", bash_failure("npm test", now - Duration::from_secs(900)));
        store.add_event("sess-1", bash_failure("npm test", now - Duration::from_secs(600)));
        store.add_event("sess-1", bash_failure("npm test", now));

        assert!(rule.evaluate(&store, now).is_empty());
    }

    #[test]
    fn test_extract_bash_command_forms() {
        assert_eq!(
            extract_bash_command(r#"{"bash_command": "npm test"}"#),
            Some("npm test".to_string()),
        );
        assert_eq!(
            extract_bash_command(r#"{"command": "go build ./..."}"#),
            Some("go build ./...".to_string()),
        );
        assert_eq!(extract_bash_command(""), None);
        assert_eq!(extract_bash_command("{not json"), None);
        assert_eq!(extract_bash_command(r#"{"tool_name": "Bash"}"#), None);
    }

    #[test]
    fn test_error_storm_fires_over_threshold() {
        let store = MemoryStore::new();
        let mut rule = ErrorStormRule { threshold: 10 };

        let now = SystemTime::now();
        for i in 0..11u64 {
            store.add_event(
                "sess-1",
                Event {
                    name: API_ERROR_EVENT.to_string(),
                    attributes: attrs(&[("error", "overloaded"), ("status_code", "529")]),
                    timestamp: now - Duration::from_secs(55 - i * 5),
                },
            );
        }

        let alerts = rule.evaluate(&store, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, RuleKind::ErrorStorm);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn test_error_storm_counts_only_recent_events() {
        let store = MemoryStore::new();
        let mut rule = ErrorStormRule { threshold: 10 };

        let now = SystemTime::now();
        // 11 errors, all older than the one-minute window.
        for i in 0..11u64 {
            store.add_event(
                "sess-1",
                Event {
                    name: API_ERROR_EVENT.to_string(),
                    timestamp: now - Duration::from_secs(120 + i),
                    ..Default::default()
                },
            );
        }

        assert!(rule.evaluate(&store, now).is_empty());
    }

    #[test]
    fn test_stale_session_fires_without_prompts() {
        let store = MemoryStore::new();
        let mut rule = StaleSessionRule {
            max_age: Duration::from_secs(2 * 3600),
        };

        add_cost(&store, "sess-stale", 1.0, SystemTime::now());
        store.add_event(
            "sess-stale",
            Event {
                name: API_REQUEST_EVENT.to_string(),
                timestamp: SystemTime::now(),
                ..Default::default()
            },
        );

        let future = SystemTime::now() + Duration::from_secs(3 * 3600);
        let alerts = rule.evaluate(&store, future);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, RuleKind::StaleSession);
    }

    #[test]
    fn test_stale_session_quiet_with_prompt_or_exit() {
        let store = MemoryStore::new();
        let mut rule = StaleSessionRule {
            max_age: Duration::from_secs(2 * 3600),
        };
        let future = SystemTime::now() + Duration::from_secs(3 * 3600);

        add_cost(&store, "sess-prompted", 1.0, SystemTime::now());
        store.add_event(
            "sess-prompted",
            Event {
                name: USER_PROMPT_EVENT.to_string(),
                timestamp: SystemTime::now(),
                ..Default::default()
            },
        );
        assert!(rule.evaluate(&store, future).is_empty());

        add_cost(&store, "sess-gone", 1.0, SystemTime::now());
        store.update_pid("sess-gone", 555);
        store.mark_exited(555);
        assert!(rule.evaluate(&store, future).is_empty());
    }

    #[test]
    fn test_context_pressure_fires_over_limit() {
        let store = MemoryStore::new();
        let mut rule = ContextPressureRule {
            pressure_percent: 80,
            model_limits: [("claude-sonnet-4-5-20250929".to_string(), 200_000u64)]
                .into_iter()
                .collect(),
            warned_models: HashSet::new(),
        };

        let now = SystemTime::now();
        store.add_event(
            "sess-1",
            Event {
                name: API_REQUEST_EVENT.to_string(),
                attributes: attrs(&[
                    ("model", "claude-sonnet-4-5-20250929"),
                    ("input_tokens", "170000"),
                ]),
                timestamp: now,
            },
        );

        let alerts = rule.evaluate(&store, now);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("170000"));
        assert!(alerts[0].message.contains("85%"));
    }

    #[test]
    fn test_context_pressure_skips_unknown_model() {
        let store = MemoryStore::new();
        let mut rule = ContextPressureRule {
            pressure_percent: 80,
            model_limits: HashMap::new(),
            warned_models: HashSet::new(),
        };

        let now = SystemTime::now();
        store.add_event(
            "sess-1",
            Event {
                name: API_REQUEST_EVENT.to_string(),
                attributes: attrs(&[("model", "unknown-model-xyz"), ("input_tokens", "190000")]),
                timestamp: now,
            },
        );

        assert!(rule.evaluate(&store, now).is_empty());
        assert!(rule.warned_models.contains("unknown-model-xyz"));
    }

    #[test]
    fn test_high_rejection_fires_over_half() {
        let store = MemoryStore::new();
        let mut rule = HighRejectionRule;

        let now = SystemTime::now();
        for i in 0..4u64 {
            store.add_event(
                "sess-1",
                Event {
                    name: TOOL_DECISION_EVENT.to_string(),
                    attributes: attrs(&[("tool_name", "Bash"), ("decision", "reject")]),
                    timestamp: now - Duration::from_secs(250 - i * 10),
                },
            );
        }
        for i in 0..2u64 {
            store.add_event(
                "sess-1",
                Event {
                    name: TOOL_DECISION_EVENT.to_string(),
                    attributes: attrs(&[("tool_name", "Write"), ("decision", "accept")]),
                    timestamp: now - Duration::from_secs(100 - i * 10),
                },
            );
        }

        let alerts = rule.evaluate(&store, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule, RuleKind::HighRejection);
    }

    #[test]
    fn test_high_rejection_quiet_at_half_or_below() {
        let store = MemoryStore::new();
        let mut rule = HighRejectionRule;

        let now = SystemTime::now();
        for decision in ["reject", "accept"] {
            store.add_event(
                "sess-1",
                Event {
                    name: TOOL_DECISION_EVENT.to_string(),
                    attributes: attrs(&[("decision", decision)]),
                    timestamp: now,
                },
            );
        }

        // Exactly 50% is not "more than half".
        assert!(rule.evaluate(&store, now).is_empty());
    }
}
