//! Bounded ring of display-formatted events.
//!
//! The store's event listener feeds each incoming event through the
//! formatter once and appends it here; front-ends read chronological copies.

use std::collections::VecDeque;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use parking_lot::Mutex;

use crate::state::{
    Event, API_ERROR_EVENT, API_REQUEST_EVENT, TOOL_DECISION_EVENT, TOOL_RESULT_EVENT,
    USER_PROMPT_EVENT,
};

/// One display-ready event.
#[derive(Debug, Clone)]
pub struct FormattedEvent {
    pub session_id: String,
    /// Short event family, e.g. "api", "error", "tool".
    pub event_type: String,
    /// One-line human-readable rendering.
    pub display: String,
    pub timestamp: SystemTime,
    /// Set for events with a success/failure outcome.
    pub success: Option<bool>,
}

impl FormattedEvent {
    /// Wall-clock rendering of the event time for log/stream output.
    pub fn clock(&self) -> String {
        DateTime::<Local>::from(self.timestamp)
            .format("%H:%M:%S")
            .to_string()
    }
}

/// Fixed-capacity event ring. Adding to a full ring evicts the oldest entry.
pub struct RingBuffer {
    capacity: usize,
    inner: Mutex<VecDeque<FormattedEvent>>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn add(&self, event: FormattedEvent) {
        let mut inner = self.inner.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(event);
    }

    /// All buffered events, oldest first.
    pub fn list_all(&self) -> Vec<FormattedEvent> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Buffered events for one session, oldest first.
    pub fn list_by_session(&self, session_id: &str) -> Vec<FormattedEvent> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    /// The most recent `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<FormattedEvent> {
        let inner = self.inner.lock();
        inner
            .iter()
            .skip(inner.len().saturating_sub(limit))
            .cloned()
            .collect()
    }
}

/// Renders a raw store event into its display form.
pub fn format_event(session_id: &str, e: &Event) -> FormattedEvent {
    let (event_type, display, success) = match e.name.as_str() {
        API_REQUEST_EVENT => {
            let model = attr(e, "model").unwrap_or("?");
            let mut display = format!("API request: {model}");
            if let Some(cost) = attr(e, "cost_usd").and_then(|c| c.parse::<f64>().ok()) {
                display.push_str(&format!(" ${cost:.4}"));
            }
            if let (Some(input), Some(output)) = (attr(e, "input_tokens"), attr(e, "output_tokens"))
            {
                display.push_str(&format!(" {input}\u{2192}{output} tok"));
            }
            if let Some(ms) = attr(e, "duration_ms") {
                display.push_str(&format!(" {ms}ms"));
            }
            ("api".to_string(), display, None)
        }
        API_ERROR_EVENT => {
            let error = attr(e, "error").unwrap_or("unknown error");
            let display = match attr(e, "status_code") {
                Some(status) => format!("API error: {error} ({status})"),
                None => format!("API error: {error}"),
            };
            ("error".to_string(), display, Some(false))
        }
        TOOL_RESULT_EVENT => {
            let tool = attr(e, "tool_name").unwrap_or("tool");
            let success = attr(e, "success").map(|s| s == "true");
            let display = match success {
                Some(true) => format!("{tool} completed"),
                Some(false) => format!("{tool} failed"),
                None => format!("{tool} finished"),
            };
            ("tool".to_string(), display, success)
        }
        TOOL_DECISION_EVENT => {
            let tool = attr(e, "tool_name").unwrap_or("tool");
            let decision = attr(e, "decision").unwrap_or("?");
            (
                "decision".to_string(),
                format!("{tool} {decision}"),
                Some(decision == "accept"),
            )
        }
        USER_PROMPT_EVENT => {
            let display = match attr(e, "prompt_length") {
                Some(len) => format!("User prompt ({len} chars)"),
                None => "User prompt".to_string(),
            };
            ("prompt".to_string(), display, None)
        }
        other => ("other".to_string(), other.to_string(), None),
    };

    FormattedEvent {
        session_id: session_id.to_string(),
        event_type,
        display,
        timestamp: e.timestamp,
        success,
    }
}

fn attr<'a>(e: &'a Event, key: &str) -> Option<&'a str> {
    e.attributes.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn event(name: &str, pairs: &[(&str, &str)]) -> Event {
        Event {
            name: name.to_string(),
            attributes: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            timestamp: SystemTime::now(),
        }
    }

    fn formatted(session: &str, n: usize) -> FormattedEvent {
        FormattedEvent {
            session_id: session.to_string(),
            event_type: "other".to_string(),
            display: format!("event-{n}"),
            timestamp: SystemTime::now(),
            success: None,
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = RingBuffer::new(3);
        for n in 0..5 {
            ring.add(formatted("s1", n));
        }

        let all = ring.list_all();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].display, "event-2");
        assert_eq!(all[2].display, "event-4");
    }

    #[test]
    fn test_list_by_session_filters() {
        let ring = RingBuffer::new(10);
        ring.add(formatted("s1", 0));
        ring.add(formatted("s2", 1));
        ring.add(formatted("s1", 2));

        let s1 = ring.list_by_session("s1");
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].display, "event-0");
        assert_eq!(s1[1].display, "event-2");
    }

    #[test]
    fn test_recent_returns_tail() {
        let ring = RingBuffer::new(10);
        for n in 0..6 {
            ring.add(formatted("s1", n));
        }

        let recent = ring.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].display, "event-4");
        assert_eq!(recent[1].display, "event-5");

        assert_eq!(ring.recent(100).len(), 6);
    }

    #[test]
    fn test_format_api_request() {
        let fe = format_event(
            "sess-1",
            &event(
                API_REQUEST_EVENT,
                &[
                    ("model", "claude-sonnet-4-5-20250929"),
                    ("cost_usd", "0.0500"),
                    ("input_tokens", "1200"),
                    ("output_tokens", "300"),
                    ("duration_ms", "850"),
                ],
            ),
        );

        assert_eq!(fe.event_type, "api");
        assert!(fe.display.contains("claude-sonnet-4-5-20250929"));
        assert!(fe.display.contains("$0.0500"));
        assert!(fe.display.contains("1200\u{2192}300 tok"));
        assert!(fe.display.contains("850ms"));
    }

    #[test]
    fn test_format_tool_result_success_flag() {
        let ok = format_event(
            "s",
            &event(TOOL_RESULT_EVENT, &[("tool_name", "Bash"), ("success", "true")]),
        );
        assert_eq!(ok.success, Some(true));
        assert_eq!(ok.display, "Bash completed");

        let failed = format_event(
            "s",
            &event(TOOL_RESULT_EVENT, &[("tool_name", "Bash"), ("success", "false")]),
        );
        assert_eq!(failed.success, Some(false));
        assert_eq!(failed.display, "Bash failed");
    }

    #[test]
    fn test_format_unknown_event_uses_raw_name() {
        let fe = format_event("s", &event("claude_code.something_new", &[]));
        assert_eq!(fe.event_type, "other");
        assert_eq!(fe.display, "claude_code.something_new");
    }
}
