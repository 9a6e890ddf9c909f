use url::Url;

use super::ProcessInfo;

/// Where a process sits on the telemetry-health lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryStatus {
    /// Data from this process has actually arrived; overrides env inspection.
    Connected,
    /// Environment unreadable, nothing can be determined.
    Unknown,
    /// Telemetry disabled (or never enabled).
    Off,
    /// Telemetry enabled but exporting to the console only.
    ConsoleOnly,
    /// Correctly pointed at this collector, no data yet.
    Waiting,
    /// Pointed at some other port.
    WrongPort,
}

/// Classification result with display decoration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub status: TelemetryStatus,
    pub icon: &'static str,
    pub label: String,
}

impl StatusInfo {
    fn new(status: TelemetryStatus, icon: &'static str, label: &str) -> Self {
        Self {
            status,
            icon,
            label: label.to_string(),
        }
    }
}

/// Decides whether a process is emitting telemetry correctly.
///
/// Pure function of its inputs; same inputs always produce the same output.
/// Decision order:
///   1. received data => Connected (ground truth)
///   2. unreadable env => Unknown
///   3. telemetry env absent/empty/"0" => Off
///   4. no endpoint set: exporters not "otlp" => ConsoleOnly, otherwise the
///      emitter will use the default endpoint on port 4317
///   5. endpoint set: compare its port against ours
pub fn classify_telemetry(
    proc: &ProcessInfo,
    configured_port: u16,
    has_received_data: bool,
) -> StatusInfo {
    if has_received_data {
        return connected();
    }

    if !proc.env_readable {
        return StatusInfo::new(TelemetryStatus::Unknown, "\u{2753}", "Unknown");
    }

    let telemetry = proc
        .env_vars
        .get("CLAUDE_CODE_ENABLE_TELEMETRY")
        .map(String::as_str)
        .unwrap_or("");
    if telemetry.is_empty() || telemetry == "0" {
        return StatusInfo::new(TelemetryStatus::Off, "\u{274c}", "No telemetry");
    }

    let endpoint = proc
        .env_vars
        .get("OTEL_EXPORTER_OTLP_ENDPOINT")
        .map(String::as_str)
        .unwrap_or("");
    let metrics_exporter = proc
        .env_vars
        .get("OTEL_METRICS_EXPORTER")
        .map(String::as_str)
        .unwrap_or("");
    let logs_exporter = proc
        .env_vars
        .get("OTEL_LOGS_EXPORTER")
        .map(String::as_str)
        .unwrap_or("");

    if endpoint.is_empty() {
        if metrics_exporter != "otlp" && logs_exporter != "otlp" {
            return StatusInfo::new(
                TelemetryStatus::ConsoleOnly,
                "\u{26a0}\u{fe0f}",
                "Console only",
            );
        }
        // Exporters are otlp with no endpoint: the emitter falls back to the
        // default localhost:4317.
        if configured_port == 4317 {
            return waiting();
        }
        return wrong_port();
    }

    match extract_port(endpoint) {
        Some(port) if port == configured_port => waiting(),
        _ => wrong_port(),
    }
}

fn connected() -> StatusInfo {
    StatusInfo::new(TelemetryStatus::Connected, "\u{2705}", "Connected")
}

fn waiting() -> StatusInfo {
    StatusInfo::new(TelemetryStatus::Waiting, "\u{2705}", "Waiting...")
}

fn wrong_port() -> StatusInfo {
    StatusInfo::new(TelemetryStatus::WrongPort, "\u{26a0}\u{fe0f}", "Wrong port")
}

/// Port of an endpoint URL. Bare `host:port` values are accepted by
/// prefixing `http://`; without an explicit port the scheme default applies
/// (http 80, https 443). Unparseable endpoints yield None.
fn extract_port(endpoint: &str) -> Option<u16> {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    };

    let url = Url::parse(&normalized).ok()?;

    if let Some(port) = url.port() {
        return Some(port);
    }

    match url.scheme() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}
