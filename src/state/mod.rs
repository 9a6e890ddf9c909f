use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

/// Bucket used for metrics and events that arrive without a session.id.
pub const UNKNOWN_SESSION_ID: &str = "unknown";

/// Cumulative cost counter emitted by Claude Code (USD).
pub const COST_METRIC: &str = "claude_code.cost.usage";
/// Cumulative token counter, dimensioned by a `type` attribute.
pub const TOKEN_METRIC: &str = "claude_code.token.usage";
/// Cumulative active-time counter in seconds.
pub const ACTIVE_TIME_METRIC: &str = "claude_code.active_time.total";
/// Cumulative lines-of-code counter, dimensioned by `type` (added/removed).
pub const LINES_OF_CODE_METRIC: &str = "claude_code.lines_of_code.count";
/// Cumulative git commit counter.
pub const COMMIT_METRIC: &str = "claude_code.commit.count";
/// Cumulative pull-request counter.
pub const PULL_REQUEST_METRIC: &str = "claude_code.pull_request.count";
/// Cumulative edit-tool decision counter, dimensioned by `tool` and `decision`.
pub const EDIT_DECISION_METRIC: &str = "claude_code.code_edit_tool.decision";

/// Log event emitted for every model API call.
pub const API_REQUEST_EVENT: &str = "claude_code.api_request";
/// Log event emitted for failed model API calls.
pub const API_ERROR_EVENT: &str = "claude_code.api_error";
/// Log event emitted when a tool invocation finishes.
pub const TOOL_RESULT_EVENT: &str = "claude_code.tool_result";
/// Log event emitted when a tool permission decision is made.
pub const TOOL_DECISION_EVENT: &str = "claude_code.tool_decision";
/// Log event emitted when the user submits a prompt.
pub const USER_PROMPT_EVENT: &str = "claude_code.user_prompt";

/// A single OTLP number data point, flattened to the fields the store needs.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub attributes: HashMap<String, String>,
    pub timestamp: SystemTime,
}

impl Default for Metric {
    fn default() -> Self {
        Self {
            name: String::new(),
            value: 0.0,
            attributes: HashMap::new(),
            timestamp: UNIX_EPOCH,
        }
    }
}

/// A single OTLP log record, flattened to name + string attributes.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub timestamp: SystemTime,
}

impl Default for Event {
    fn default() -> Self {
        Self {
            name: String::new(),
            attributes: HashMap::new(),
            timestamp: UNIX_EPOCH,
        }
    }
}

/// Everything the collector knows about one logical session.
///
/// `previous_values` carries the last raw sample per counter key so
/// cumulative counters can be converted to deltas (with reset handling).
#[derive(Debug, Clone)]
pub struct SessionData {
    pub session_id: String,
    /// Owning OS process, 0 while uncorrelated.
    pub pid: i32,
    pub started_at: SystemTime,
    pub last_event_at: SystemTime,
    pub exited: bool,
    pub model: String,
    pub terminal: String,
    pub cwd: String,
    pub total_cost: f64,
    pub total_tokens: i64,
    pub active_time: Duration,
    pub metrics: Vec<Metric>,
    pub events: Vec<Event>,
    pub previous_values: HashMap<String, f64>,
}

impl SessionData {
    fn new(session_id: String, now: SystemTime) -> Self {
        Self {
            session_id,
            pid: 0,
            started_at: now,
            last_event_at: now,
            exited: false,
            model: String::new(),
            terminal: String::new(),
            cwd: String::new(),
            total_cost: 0.0,
            total_tokens: 0,
            active_time: Duration::ZERO,
            metrics: Vec::new(),
            events: Vec::new(),
            previous_values: HashMap::new(),
        }
    }
}

/// Callback invoked after an event is stored. Receives the resolved session
/// id and the event. Listeners run outside the store lock and must not call
/// back into a writing operation.
pub type EventListener = dyn Fn(&str, &Event) + Send + Sync;

/// Thread-safe in-memory session index.
///
/// Writes serialize behind the `RwLock` writer mode; readers get owned deep
/// copies, never references into the backing map.
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionData>>,
    listeners: Mutex<Vec<Arc<EventListener>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Registers a listener called synchronously after every `add_event`.
    pub fn on_event<F>(&self, f: F)
    where
        F: Fn(&str, &Event) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(f));
    }

    /// Indexes a metric data point under the given session id.
    ///
    /// Counter resets (raw value below the previous sample) contribute the
    /// new raw value as the delta, as if the previous sample were zero.
    pub fn add_metric(&self, session_id: &str, m: Metric) {
        let session_id = resolve_session_id(session_id);
        let now = SystemTime::now();

        let mut sessions = self.sessions.write();
        let s = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionData::new(session_id.to_string(), now));

        let ts = if m.timestamp == UNIX_EPOCH { now } else { m.timestamp };
        if ts > s.last_event_at {
            s.last_event_at = ts;
        }

        let key = metric_key(&m.name, &m.attributes);
        let prev = s.previous_values.insert(key, m.value);

        let delta = match prev {
            None => m.value,
            Some(prev) if m.value < prev => m.value,
            Some(prev) => m.value - prev,
        };

        match m.name.as_str() {
            COST_METRIC => s.total_cost += delta,
            TOKEN_METRIC => s.total_tokens += delta as i64,
            ACTIVE_TIME_METRIC => s.active_time += Duration::from_secs_f64(delta.max(0.0)),
            _ => {}
        }

        if let Some(model) = m.attributes.get("model") {
            if !model.is_empty() {
                s.model = model.clone();
            }
        }
        if let Some(terminal) = m.attributes.get("terminal.type") {
            if !terminal.is_empty() {
                s.terminal = terminal.clone();
            }
        }

        s.metrics.push(m);
    }

    /// Indexes an event under the given session id and notifies listeners.
    ///
    /// Events never contribute to cost or token aggregates, even when they
    /// carry a `cost_usd` attribute; only metrics do.
    pub fn add_event(&self, session_id: &str, e: Event) {
        let session_id = resolve_session_id(session_id).to_string();
        let now = SystemTime::now();

        {
            let mut sessions = self.sessions.write();
            let s = sessions
                .entry(session_id.clone())
                .or_insert_with(|| SessionData::new(session_id.clone(), now));

            let ts = if e.timestamp == UNIX_EPOCH { now } else { e.timestamp };
            if ts > s.last_event_at {
                s.last_event_at = ts;
            }

            if e.name == API_REQUEST_EVENT {
                if let Some(model) = e.attributes.get("model") {
                    if !model.is_empty() {
                        s.model = model.clone();
                    }
                }
            }

            s.events.push(e.clone());
        }

        // Snapshot the listener list, then invoke outside every store lock
        // so a listener may read the store without deadlocking.
        let listeners: Vec<Arc<EventListener>> = self.listeners.lock().clone();
        for listener in &listeners {
            listener(&session_id, &e);
        }
    }

    /// Returns a deep copy of the session, or None if it does not exist.
    pub fn get_session(&self, session_id: &str) -> Option<SessionData> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Returns deep copies of all sessions, oldest `started_at` first.
    pub fn list_sessions(&self) -> Vec<SessionData> {
        let sessions = self.sessions.read();
        let mut result: Vec<SessionData> = sessions.values().cloned().collect();
        result.sort_by_key(|s| s.started_at);
        result
    }

    /// Sum of `total_cost` across all sessions.
    pub fn get_aggregated_cost(&self) -> f64 {
        self.sessions.read().values().map(|s| s.total_cost).sum()
    }

    /// Associates a PID with the session, creating the session if needed.
    pub fn update_pid(&self, session_id: &str, pid: i32) {
        let session_id = resolve_session_id(session_id);
        let now = SystemTime::now();

        let mut sessions = self.sessions.write();
        let s = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionData::new(session_id.to_string(), now));
        s.pid = pid;
    }

    /// Flags every session owned by `pid` as exited. PID 0 means
    /// "uncorrelated" and is never matched.
    pub fn mark_exited(&self, pid: i32) {
        if pid == 0 {
            return;
        }

        let mut sessions = self.sessions.write();
        for s in sessions.values_mut() {
            if s.pid == pid {
                s.exited = true;
            }
        }
    }

    /// Whether any session has been correlated to the given PID. Used as the
    /// ground-truth "has received data" input to telemetry classification.
    pub fn has_session_for_pid(&self, pid: i32) -> bool {
        if pid == 0 {
            return false;
        }
        self.sessions.read().values().any(|s| s.pid == pid)
    }
}

/// Maps an empty inbound session id to the unknown bucket, logging once per
/// occurrence.
fn resolve_session_id(session_id: &str) -> &str {
    if session_id.is_empty() {
        warn!(bucket = UNKNOWN_SESSION_ID, "metric/event received without session.id");
        UNKNOWN_SESSION_ID
    } else {
        session_id
    }
}

/// Builds the deterministic counter key: the metric name alone when there are
/// no attributes, otherwise `name|k1=v1,k2=v2` with keys sorted.
fn metric_key(name: &str, attrs: &HashMap<String, String>) -> String {
    if attrs.is_empty() {
        return name.to_string();
    }

    let mut keys: Vec<&str> = attrs.keys().map(String::as_str).collect();
    keys.sort_unstable();

    let parts: Vec<String> = keys
        .iter()
        .map(|k| format!("{k}={}", attrs[*k]))
        .collect();

    format!("{name}|{}", parts.join(","))
}
