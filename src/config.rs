use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

/// Top-level configuration for the claudetop collector.
///
/// The config file is optional; every value has a default that lets the
/// collector work out of the box. Unknown top-level keys are warned about
/// but never fatal; out-of-range values are.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OTLP receiver endpoints.
    pub receiver: ReceiverConfig,

    /// Process scanner cadence.
    pub scanner: ScannerConfig,

    /// Alert thresholds and notification behaviour.
    pub alerts: AlertsConfig,

    /// Display parameters consumed by front-ends.
    pub display: DisplayConfig,

    /// Model name -> context token limit, for the context-pressure rule.
    pub models: HashMap<String, u64>,

    /// Model name -> [input, output, cache_read, cache_creation] USD per
    /// million tokens.
    pub pricing: HashMap<String, [f64; 4]>,
}

/// OTLP receiver endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub grpc_port: u16,
    pub http_port: u16,
    pub bind: String,
}

/// Process scanner configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub interval_seconds: u64,
}

/// Alert rule thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub cost_surge_threshold_per_hour: f64,
    pub runaway_token_velocity: u64,
    pub runaway_token_sustained_minutes: u64,
    pub loop_detector_threshold: usize,
    pub loop_detector_window_minutes: u64,
    pub error_storm_count: usize,
    pub stale_session_hours: u64,
    pub context_pressure_percent: u32,
    pub notifications: NotificationConfig,
}

/// System notification behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub system_notify: bool,
}

/// Display parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub event_buffer_size: usize,
    pub refresh_rate_ms: u64,
    pub cost_color_green_below: f64,
    pub cost_color_yellow_below: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            scanner: ScannerConfig::default(),
            alerts: AlertsConfig::default(),
            display: DisplayConfig::default(),
            models: default_model_context_limits(),
            pricing: default_pricing(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            grpc_port: 4317,
            http_port: 4318,
            bind: "127.0.0.1".to_string(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cost_surge_threshold_per_hour: 100.0,
            runaway_token_velocity: 200_000,
            runaway_token_sustained_minutes: 5,
            loop_detector_threshold: 3,
            loop_detector_window_minutes: 5,
            error_storm_count: 10,
            stale_session_hours: 2,
            context_pressure_percent: 80,
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            system_notify: true,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            refresh_rate_ms: 500,
            cost_color_green_below: 0.50,
            cost_color_yellow_below: 2.00,
        }
    }
}

/// Built-in model context token limits.
fn default_model_context_limits() -> HashMap<String, u64> {
    [
        ("claude-sonnet-4-5-20250929", 200_000),
        ("claude-opus-4-6", 200_000),
        ("claude-haiku-4-5-20251001", 200_000),
    ]
    .into_iter()
    .map(|(name, limit)| (name.to_string(), limit))
    .collect()
}

/// Built-in per-token pricing (USD per million tokens).
fn default_pricing() -> HashMap<String, [f64; 4]> {
    [(
        "claude-sonnet-4-5-20250929".to_string(),
        [3.00, 15.00, 0.30, 3.75],
    )]
    .into_iter()
    .collect()
}

/// Default config file location (~/.config/claudetop/config.yaml).
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("claudetop").join("config.yaml"))
}

impl Config {
    /// Loads configuration from the default location. A missing file means
    /// all defaults, no error.
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads configuration from an explicit path. Unlike the default
    /// location, a missing file here is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::parse(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parses YAML configuration from a string, applying defaults for every
    /// absent key and warning about unknown top-level keys.
    pub fn parse(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            let cfg = Self::default();
            cfg.validate()?;
            return Ok(cfg);
        }

        // A first pass over the raw document catches misspelled sections
        // that serde would otherwise silently drop.
        let raw: serde_yaml::Value = serde_yaml::from_str(data).context("invalid YAML")?;
        if let serde_yaml::Value::Mapping(mapping) = &raw {
            const KNOWN: &[&str] = &["receiver", "scanner", "alerts", "display", "models", "pricing"];
            for key in mapping.keys() {
                if let serde_yaml::Value::String(key) = key {
                    if !KNOWN.contains(&key.as_str()) {
                        warn!(key = %key, "unknown config key");
                    }
                }
            }
        }

        let cfg: Config = serde_yaml::from_str(data).context("invalid configuration")?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Checks every value against its allowed range. Violations are
    /// collected and reported together.
    pub fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();

        if self.receiver.grpc_port == 0 {
            errs.push("receiver.grpc_port must be 1-65535".to_string());
        }
        if self.receiver.http_port == 0 {
            errs.push("receiver.http_port must be 1-65535".to_string());
        }

        if self.scanner.interval_seconds < 1 {
            errs.push(format!(
                "scanner.interval_seconds must be positive, got {}",
                self.scanner.interval_seconds
            ));
        }

        if self.alerts.cost_surge_threshold_per_hour <= 0.0 {
            errs.push(format!(
                "alerts.cost_surge_threshold_per_hour must be positive, got {}",
                self.alerts.cost_surge_threshold_per_hour
            ));
        }
        if self.alerts.runaway_token_velocity < 1 {
            errs.push("alerts.runaway_token_velocity must be positive".to_string());
        }
        if self.alerts.runaway_token_sustained_minutes < 1 {
            errs.push("alerts.runaway_token_sustained_minutes must be positive".to_string());
        }
        if self.alerts.loop_detector_threshold < 1 {
            errs.push("alerts.loop_detector_threshold must be positive".to_string());
        }
        if self.alerts.loop_detector_window_minutes < 1 {
            errs.push("alerts.loop_detector_window_minutes must be positive".to_string());
        }
        if self.alerts.error_storm_count < 1 {
            errs.push("alerts.error_storm_count must be positive".to_string());
        }
        if self.alerts.stale_session_hours < 1 {
            errs.push("alerts.stale_session_hours must be positive".to_string());
        }
        if !(1..=100).contains(&self.alerts.context_pressure_percent) {
            errs.push(format!(
                "alerts.context_pressure_percent must be 1-100, got {}",
                self.alerts.context_pressure_percent
            ));
        }

        if self.display.event_buffer_size < 1 {
            errs.push("display.event_buffer_size must be positive".to_string());
        }
        if self.display.refresh_rate_ms < 1 {
            errs.push("display.refresh_rate_ms must be positive".to_string());
        }
        if self.display.cost_color_green_below <= 0.0 {
            errs.push("display.cost_color_green_below must be positive".to_string());
        }
        if self.display.cost_color_yellow_below <= 0.0 {
            errs.push("display.cost_color_yellow_below must be positive".to_string());
        }

        for (model, limit) in &self.models {
            if *limit < 1 {
                errs.push(format!("model {model:?} context limit must be positive"));
            }
        }

        if !errs.is_empty() {
            bail!("config validation error: {}", errs.join("; "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.receiver.grpc_port, 4317);
        assert_eq!(cfg.receiver.http_port, 4318);
        assert_eq!(cfg.receiver.bind, "127.0.0.1");
        assert_eq!(cfg.scanner.interval_seconds, 5);
        assert_eq!(cfg.alerts.error_storm_count, 10);
        assert_eq!(cfg.display.event_buffer_size, 1000);
        assert_eq!(cfg.models["claude-opus-4-6"], 200_000);
    }

    #[test]
    fn test_empty_input_yields_defaults() {
        let cfg = Config::parse("").expect("empty config parses");
        assert_eq!(cfg.alerts.cost_surge_threshold_per_hour, 100.0);
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let cfg = Config::parse(
            "receiver:\n  grpc_port: 14317\nalerts:\n  error_storm_count: 25\n",
        )
        .expect("parses");

        assert_eq!(cfg.receiver.grpc_port, 14317);
        // Sibling keys keep their defaults.
        assert_eq!(cfg.receiver.http_port, 4318);
        assert_eq!(cfg.alerts.error_storm_count, 25);
        assert_eq!(cfg.alerts.stale_session_hours, 2);
    }

    #[test]
    fn test_models_and_pricing_tables() {
        let cfg = Config::parse(
            "models:\n  custom-model: 500000\npricing:\n  custom-model: [1.0, 2.0, 0.1, 1.5]\n",
        )
        .expect("parses");

        assert_eq!(cfg.models["custom-model"], 500_000);
        assert_eq!(cfg.pricing["custom-model"], [1.0, 2.0, 0.1, 1.5]);
    }

    #[test]
    fn test_out_of_range_values_fail() {
        let err = Config::parse("scanner:\n  interval_seconds: 0\n").unwrap_err();
        assert!(err.to_string().contains("interval_seconds"));

        let err = Config::parse("alerts:\n  context_pressure_percent: 150\n").unwrap_err();
        assert!(err.to_string().contains("context_pressure_percent"));

        let err = Config::parse("receiver:\n  grpc_port: 0\n").unwrap_err();
        assert!(err.to_string().contains("grpc_port"));
    }

    #[test]
    fn test_invalid_yaml_fails() {
        assert!(Config::parse("receiver: [not a mapping").is_err());
    }
}
