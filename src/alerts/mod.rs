//! Anomaly detection over the session store.
//!
//! A fixed set of rules is evaluated on a short cadence; triggered alerts
//! are deduplicated per `rule|session` key and fanned out to an optional
//! system notifier.

pub mod engine;
pub mod normalize;
pub mod rules;

use std::fmt;
use std::process::Command;
use std::time::SystemTime;

use tracing::debug;

pub use self::engine::Engine;
pub use self::normalize::{CommandNormalizer, DefaultNormalizer};

/// Which rule produced an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    CostSurge,
    RunawayTokens,
    LoopDetector,
    ErrorStorm,
    StaleSession,
    ContextPressure,
    HighRejection,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuleKind::CostSurge => "cost_surge",
            RuleKind::RunawayTokens => "runaway_tokens",
            RuleKind::LoopDetector => "loop_detector",
            RuleKind::ErrorStorm => "error_storm",
            RuleKind::StaleSession => "stale_session",
            RuleKind::ContextPressure => "context_pressure",
            RuleKind::HighRejection => "high_rejection",
        };
        f.write_str(name)
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Critical => f.write_str("critical"),
        }
    }
}

/// One triggered alert. An empty `session_id` means the alert is global.
#[derive(Debug, Clone)]
pub struct Alert {
    pub rule: RuleKind,
    pub severity: Severity,
    pub session_id: String,
    pub message: String,
    pub fired_at: SystemTime,
}

impl Alert {
    /// Deduplication key: alerts sharing it are suppressed inside the dedup
    /// window.
    pub(crate) fn alert_key(&self) -> String {
        format!("{}|{}", self.rule, self.session_id)
    }
}

/// Delivery port for triggered alerts. Implementations are free to be no-op.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Desktop notification delivery via the platform's notification command
/// (`notify-send` on Linux, `osascript` on macOS). Disabled instances are
/// no-ops, which also keeps tests popup-free.
pub struct SystemNotifier {
    enabled: bool,
}

impl SystemNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Notifier for SystemNotifier {
    fn notify(&self, alert: &Alert) {
        if !self.enabled {
            return;
        }

        let title = format!("claudetop: {}", alert.rule);
        let mut body = alert.message.clone();
        if !alert.session_id.is_empty() {
            body.push_str(&format!(" [{}]", truncate_session_id(&alert.session_id)));
        }

        let result = if cfg!(target_os = "macos") {
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                escape_osascript(&body),
                escape_osascript(&title),
            );
            Command::new("osascript").args(["-e", &script]).spawn()
        } else {
            let urgency = match alert.severity {
                Severity::Critical => "critical",
                Severity::Warning => "normal",
            };
            Command::new("notify-send")
                .args(["--urgency", urgency, &title, &body])
                .spawn()
        };

        if let Err(e) = result {
            debug!(error = %e, "system notification failed");
        }
    }
}

/// Escapes backslashes and double quotes for embedding in an AppleScript
/// string literal.
fn escape_osascript(input: &str) -> String {
    input.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Shortens long session ids for notification bodies.
fn truncate_session_id(session_id: &str) -> String {
    const MAX: usize = 16;
    if session_id.chars().count() <= MAX {
        return session_id.to_string();
    }
    let head: String = session_id.chars().take(MAX - 3).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_key_combines_rule_and_session() {
        let alert = Alert {
            rule: RuleKind::ErrorStorm,
            severity: Severity::Critical,
            session_id: "sess-1".to_string(),
            message: String::new(),
            fired_at: SystemTime::now(),
        };
        assert_eq!(alert.alert_key(), "error_storm|sess-1");

        let global = Alert {
            session_id: String::new(),
            ..alert
        };
        assert_eq!(global.alert_key(), "error_storm|");
    }

    #[test]
    fn test_disabled_notifier_is_noop() {
        let notifier = SystemNotifier::new(false);
        // Must not panic or spawn anything, special characters included.
        notifier.notify(&Alert {
            rule: RuleKind::CostSurge,
            severity: Severity::Critical,
            session_id: "sess-notification-test-1234567890".to_string(),
            message: r#"Cost surge: $5.00/hr with "special" chars"#.to_string(),
            fired_at: SystemTime::now(),
        });
    }

    #[test]
    fn test_osascript_escaping() {
        assert_eq!(
            escape_osascript(r#"He said "hello" and \n stuff"#),
            r#"He said \"hello\" and \\n stuff"#,
        );
    }

    #[test]
    fn test_session_id_truncation() {
        let truncated = truncate_session_id("sess-1234567890abcdef");
        assert!(truncated.chars().count() <= 16);
        assert!(truncated.ends_with("..."));

        assert_eq!(truncate_session_id("sess-123"), "sess-123");
    }
}
