//! Claude Code process discovery.
//!
//! The scanner enumerates processes visible to the current user, keeps the
//! ones that look like Claude Code CLI instances ("claude" binaries that are
//! not GUI app bundles, or node processes running the
//! `@anthropic-ai/claude-code` module), and enriches each with argv,
//! telemetry environment variables, CWD, and terminal type. Liveness is
//! diffed between scans: first-ever PIDs are flagged new, disappeared PIDs
//! move to a preserved exited pool.

pub mod classifier;
pub mod procfs;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

pub use self::classifier::{classify_telemetry, StatusInfo, TelemetryStatus};
pub use self::procfs::SysinfoProcessApi;

/// The telemetry environment variables the classifier cares about. Only
/// these survive env filtering.
pub const TELEMETRY_ENV_KEYS: &[&str] = &[
    "CLAUDE_CODE_ENABLE_TELEMETRY",
    "OTEL_METRICS_EXPORTER",
    "OTEL_LOGS_EXPORTER",
    "OTEL_EXPORTER_OTLP_ENDPOINT",
    "OTEL_EXPORTER_OTLP_PROTOCOL",
];

/// Basic identity returned by the low-level process API before enrichment.
#[derive(Debug, Clone)]
pub struct RawProcessInfo {
    pub pid: i32,
    pub binary_name: String,
}

/// Capability surface over OS process inspection. Production code uses
/// [`SysinfoProcessApi`]; behavioral tests supply mocks so no real syscalls
/// are needed.
pub trait ProcessApi: Send + Sync {
    /// All PIDs visible to the current user.
    fn list_all_pids(&self) -> Result<Vec<i32>>;

    /// Basic info (binary name) for one PID.
    fn process_info(&self, pid: i32) -> Result<RawProcessInfo>;

    /// Full argv and environment for one PID.
    fn process_args(&self, pid: i32) -> Result<(Vec<String>, HashMap<String, String>)>;

    /// Current working directory for one PID.
    fn process_cwd(&self, pid: i32) -> Result<String>;

    /// (local, remote) port pairs of TCP sockets owned by the PID.
    fn open_ports(&self, pid: i32) -> Result<Vec<(u16, u16)>>;
}

/// One discovered (or exited) Claude Code process.
#[derive(Debug, Clone, Default)]
pub struct ProcessInfo {
    pub pid: i32,
    pub binary_name: String,
    pub args: Vec<String>,
    pub cwd: String,
    pub terminal: String,
    /// False when argv/env could not be read (zombies, permission denied).
    pub env_readable: bool,
    /// Filtered to the telemetry allowlist, with global settings merged in.
    pub env_vars: HashMap<String, String>,
    /// True only on the scan where the PID was first observed.
    pub is_new: bool,
    pub exited: bool,
}

/// Result of one scan cycle.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Everything currently tracked: live processes plus the exited pool.
    pub processes: Vec<ProcessInfo>,
    /// PIDs that disappeared in this cycle. The caller feeds these into
    /// `MemoryStore::mark_exited`.
    pub newly_exited: Vec<i32>,
}

struct ScanState {
    current: HashMap<i32, ProcessInfo>,
    seen: HashSet<i32>,
    exited: HashMap<i32, ProcessInfo>,
}

/// External-program fallback enumerator, used when the process API finds no
/// targets at all.
type FallbackFn = Box<dyn Fn() -> Vec<i32> + Send + Sync>;

/// Discovers and tracks Claude Code processes across scan cycles. The latest
/// result is published as a lock-free snapshot for display readers.
pub struct Scanner {
    api: Arc<dyn ProcessApi>,
    state: Mutex<ScanState>,
    snapshot: ArcSwap<Vec<ProcessInfo>>,
    settings_paths: Vec<PathBuf>,
    fallback: FallbackFn,
}

impl Scanner {
    /// Creates a scanner with the default global-settings search paths
    /// (user settings, then managed settings; later overrides earlier).
    pub fn new(api: Arc<dyn ProcessApi>) -> Self {
        let mut settings_paths = Vec::with_capacity(2);
        if let Some(home) = dirs::home_dir() {
            settings_paths.push(home.join(".claude").join("settings.json"));
        }
        settings_paths.push(PathBuf::from("/etc/claude-code/managed-settings.json"));

        Self::with_settings_paths(api, settings_paths)
    }

    /// Creates a scanner with explicit settings paths. Used by tests.
    pub fn with_settings_paths(api: Arc<dyn ProcessApi>, settings_paths: Vec<PathBuf>) -> Self {
        Self {
            api,
            state: Mutex::new(ScanState {
                current: HashMap::new(),
                seen: HashSet::new(),
                exited: HashMap::new(),
            }),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            settings_paths,
            fallback: Box::new(pgrep_claude_pids),
        }
    }

    /// Replaces the fallback enumerator. Used by tests to avoid shelling
    /// out.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Vec<i32> + Send + Sync + 'static,
    {
        self.fallback = Box::new(fallback);
        self
    }

    /// The underlying process API, shared with the correlator.
    pub fn api(&self) -> Arc<dyn ProcessApi> {
        Arc::clone(&self.api)
    }

    /// The most recently published process list.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.snapshot.load().as_ref().clone()
    }

    /// PIDs of currently live tracked processes.
    pub fn live_pids(&self) -> Vec<i32> {
        self.state.lock().current.keys().copied().collect()
    }

    /// Runs one scan cycle: discover, enrich, merge global settings, and
    /// diff liveness against the previous cycle. One inaccessible PID never
    /// aborts the cycle.
    pub fn scan(&self) -> ScanOutcome {
        let pids = match self.api.list_all_pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!(error = %e, "PID enumeration failed, keeping previous results");
                return ScanOutcome {
                    processes: self.processes(),
                    newly_exited: Vec::new(),
                };
            }
        };

        let mut discovered: HashMap<i32, ProcessInfo> = HashMap::new();

        for pid in pids {
            let Ok(raw) = self.api.process_info(pid) else {
                continue;
            };

            let (args, env_vars, env_readable) = match self.api.process_args(pid) {
                Ok((args, env)) => (args, env, true),
                Err(_) => (Vec::new(), HashMap::new(), false),
            };

            if !is_claude_process(&raw.binary_name, &args) {
                continue;
            }

            let cwd = self.api.process_cwd(pid).unwrap_or_default();

            discovered.insert(
                pid,
                ProcessInfo {
                    pid,
                    binary_name: raw.binary_name,
                    args,
                    cwd: shorten_home(&cwd),
                    terminal: detect_terminal(&env_vars),
                    env_vars: filter_telemetry_env(&env_vars),
                    env_readable,
                    is_new: false,
                    exited: false,
                },
            );
        }

        // Fallback for hosts where the process API cannot read other
        // processes: exact-name lookup via pgrep, enriched best-effort.
        if discovered.is_empty() {
            for pid in (self.fallback)() {
                let (args, env_vars, env_readable) = match self.api.process_args(pid) {
                    Ok((args, env)) => (args, env, true),
                    Err(_) => (Vec::new(), HashMap::new(), false),
                };

                // GUI app bundles are not CLI sessions.
                if args.first().is_some_and(|a| a.contains(".app/")) {
                    continue;
                }

                let cwd = self.api.process_cwd(pid).unwrap_or_default();

                discovered.insert(
                    pid,
                    ProcessInfo {
                        pid,
                        binary_name: "claude".to_string(),
                        args,
                        cwd: shorten_home(&cwd),
                        terminal: detect_terminal(&env_vars),
                        env_vars: filter_telemetry_env(&env_vars),
                        env_readable,
                        is_new: false,
                        exited: false,
                    },
                );
            }
        }

        // Merge global settings env into each process; the process's own
        // environment wins.
        let global_env = self.read_global_telemetry_env();
        for info in discovered.values_mut() {
            for (k, v) in &global_env {
                info.env_vars.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        let mut state = self.state.lock();

        for (pid, info) in &mut discovered {
            if !state.seen.contains(pid) {
                info.is_new = true;
            }
        }

        let mut newly_exited = Vec::new();
        let mut to_mark_exited = Vec::new();
        for (pid, prev) in &state.current {
            if !discovered.contains_key(pid) {
                let mut gone = prev.clone();
                gone.exited = true;
                gone.is_new = false;
                to_mark_exited.push((*pid, gone));
                newly_exited.push(*pid);
            }
        }
        for (pid, gone) in to_mark_exited {
            state.exited.insert(pid, gone);
        }

        state.seen.extend(discovered.keys().copied());
        state.current = discovered;

        let processes = list_all_locked(&state);
        drop(state);

        self.snapshot.store(Arc::new(processes.clone()));

        debug!(
            tracked = processes.len(),
            newly_exited = newly_exited.len(),
            "scan cycle complete",
        );

        ScanOutcome {
            processes,
            newly_exited,
        }
    }

    /// Reads telemetry env from the global settings files, later files
    /// overriding earlier ones.
    fn read_global_telemetry_env(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for path in &self.settings_paths {
            merged.extend(read_settings_env(path));
        }
        merged
    }
}

fn list_all_locked(state: &ScanState) -> Vec<ProcessInfo> {
    let mut result: Vec<ProcessInfo> = state.current.values().cloned().collect();
    for info in state.exited.values() {
        if !state.current.contains_key(&info.pid) {
            result.push(info.clone());
        }
    }
    result.sort_by_key(|p| p.pid);
    result
}

/// Whether a process is a Claude Code CLI instance: the "claude" binary
/// (rejecting `.app/` bundle paths in argv[0]) or a node process with the
/// Claude Code module somewhere in its argv.
fn is_claude_process(binary_name: &str, args: &[String]) -> bool {
    let name = binary_name.to_lowercase();

    if name == "claude" {
        return !args.first().is_some_and(|a| a.contains(".app/"));
    }

    if name == "node" || name == "nodejs" {
        return args.iter().any(|a| a.contains("@anthropic-ai/claude-code"));
    }

    false
}

/// Guesses the hosting terminal from environment variables.
fn detect_terminal(env: &HashMap<String, String>) -> String {
    if let Some(tp) = env.get("TERM_PROGRAM").filter(|v| !v.is_empty()) {
        return match tp.to_lowercase().as_str() {
            "iterm.app" => "iTerm2".to_string(),
            "apple_terminal" => "Terminal".to_string(),
            "vscode" => "VS Code".to_string(),
            "cursor" => "Cursor".to_string(),
            _ => tp.clone(),
        };
    }

    if env.get("TMUX").is_some_and(|v| !v.is_empty()) {
        return "tmux".to_string();
    }
    if env.get("VSCODE_PID").is_some_and(|v| !v.is_empty()) {
        return "VS Code".to_string();
    }
    if env.get("CURSOR_CHANNEL").is_some_and(|v| !v.is_empty()) {
        return "Cursor".to_string();
    }

    String::new()
}

/// Keeps only the telemetry allowlist keys.
fn filter_telemetry_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    TELEMETRY_ENV_KEYS
        .iter()
        .filter_map(|&k| env.get(k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

/// Replaces the user's home-directory prefix with `~`.
fn shorten_home(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    if let Some(home) = dirs::home_dir() {
        let home = home.to_string_lossy();
        if let Some(rest) = path.strip_prefix(home.as_ref()) {
            return format!("~{rest}");
        }
    }

    path.to_string()
}

/// Telemetry env from one settings JSON file's top-level `env` map.
/// Missing or malformed files yield an empty map.
fn read_settings_env(path: &Path) -> HashMap<String, String> {
    #[derive(Deserialize)]
    struct Settings {
        #[serde(default)]
        env: HashMap<String, String>,
    }

    let Ok(data) = std::fs::read(path) else {
        return HashMap::new();
    };
    let Ok(settings) = serde_json::from_slice::<Settings>(&data) else {
        return HashMap::new();
    };

    filter_telemetry_env(&settings.env)
}

/// Exact-name fallback lookup via pgrep, for hosts where per-PID inspection
/// of other processes is restricted.
fn pgrep_claude_pids() -> Vec<i32> {
    let Ok(output) = Command::new("pgrep").args(["-x", "claude"]).output() else {
        return Vec::new();
    };

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Scriptable ProcessApi for behavioral tests.
    #[derive(Default)]
    pub(crate) struct MockProcessApi {
        pub processes: Mutex<HashMap<i32, MockProcess>>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct MockProcess {
        pub binary_name: String,
        pub args: Vec<String>,
        pub env: HashMap<String, String>,
        pub cwd: String,
        pub env_fails: bool,
    }

    impl MockProcessApi {
        pub fn insert(&self, pid: i32, proc: MockProcess) {
            self.processes.lock().insert(pid, proc);
        }

        pub fn remove(&self, pid: i32) {
            self.processes.lock().remove(&pid);
        }
    }

    impl ProcessApi for MockProcessApi {
        fn list_all_pids(&self) -> Result<Vec<i32>> {
            Ok(self.processes.lock().keys().copied().collect())
        }

        fn process_info(&self, pid: i32) -> Result<RawProcessInfo> {
            let procs = self.processes.lock();
            let p = procs.get(&pid).ok_or_else(|| anyhow::anyhow!("no such pid"))?;
            Ok(RawProcessInfo {
                pid,
                binary_name: p.binary_name.clone(),
            })
        }

        fn process_args(&self, pid: i32) -> Result<(Vec<String>, HashMap<String, String>)> {
            let procs = self.processes.lock();
            let p = procs.get(&pid).ok_or_else(|| anyhow::anyhow!("no such pid"))?;
            if p.env_fails {
                anyhow::bail!("permission denied");
            }
            Ok((p.args.clone(), p.env.clone()))
        }

        fn process_cwd(&self, pid: i32) -> Result<String> {
            let procs = self.processes.lock();
            let p = procs.get(&pid).ok_or_else(|| anyhow::anyhow!("no such pid"))?;
            Ok(p.cwd.clone())
        }

        fn open_ports(&self, _pid: i32) -> Result<Vec<(u16, u16)>> {
            Ok(Vec::new())
        }
    }

    fn claude_proc() -> MockProcess {
        MockProcess {
            binary_name: "claude".to_string(),
            args: vec!["claude".to_string()],
            ..Default::default()
        }
    }

    fn scanner_with(api: Arc<MockProcessApi>) -> Scanner {
        Scanner::with_settings_paths(api, Vec::new()).with_fallback(Vec::new)
    }

    #[test]
    fn test_discovers_claude_binary() {
        let api = Arc::new(MockProcessApi::default());
        api.insert(100, claude_proc());
        api.insert(200, MockProcess {
            binary_name: "bash".to_string(),
            ..Default::default()
        });

        let scanner = scanner_with(api);
        let outcome = scanner.scan();

        assert_eq!(outcome.processes.len(), 1);
        assert_eq!(outcome.processes[0].pid, 100);
        assert!(outcome.processes[0].is_new);
    }

    #[test]
    fn test_discovers_node_with_claude_code_module() {
        let api = Arc::new(MockProcessApi::default());
        api.insert(300, MockProcess {
            binary_name: "node".to_string(),
            args: vec![
                "node".to_string(),
                "/usr/lib/node_modules/@anthropic-ai/claude-code/cli.js".to_string(),
            ],
            ..Default::default()
        });
        api.insert(301, MockProcess {
            binary_name: "node".to_string(),
            args: vec!["node".to_string(), "server.js".to_string()],
            ..Default::default()
        });

        let scanner = scanner_with(api);
        let outcome = scanner.scan();

        assert_eq!(outcome.processes.len(), 1);
        assert_eq!(outcome.processes[0].pid, 300);
    }

    #[test]
    fn test_rejects_desktop_app_bundle() {
        let api = Arc::new(MockProcessApi::default());
        api.insert(400, MockProcess {
            binary_name: "claude".to_string(),
            args: vec!["/Applications/Claude.app/Contents/MacOS/Claude".to_string()],
            ..Default::default()
        });

        let scanner = scanner_with(api);
        assert!(scanner.scan().processes.is_empty());
    }

    #[test]
    fn test_unreadable_env_keeps_entry() {
        let api = Arc::new(MockProcessApi::default());
        api.insert(500, MockProcess {
            binary_name: "claude".to_string(),
            env_fails: true,
            ..Default::default()
        });

        let scanner = scanner_with(api);
        let outcome = scanner.scan();

        assert_eq!(outcome.processes.len(), 1);
        assert!(!outcome.processes[0].env_readable);
    }

    #[test]
    fn test_is_new_only_on_first_observation() {
        let api = Arc::new(MockProcessApi::default());
        api.insert(600, claude_proc());

        let scanner = scanner_with(Arc::clone(&api));
        assert!(scanner.scan().processes[0].is_new);
        assert!(!scanner.scan().processes[0].is_new);
    }

    #[test]
    fn test_exited_pool_preserved_and_reported_once() {
        let api = Arc::new(MockProcessApi::default());
        api.insert(700, claude_proc());

        let scanner = scanner_with(Arc::clone(&api));
        scanner.scan();

        api.remove(700);
        let outcome = scanner.scan();
        assert_eq!(outcome.newly_exited, vec![700]);
        assert_eq!(outcome.processes.len(), 1);
        assert!(outcome.processes[0].exited);

        // Still displayed on later scans, but not reported as newly exited.
        let outcome = scanner.scan();
        assert!(outcome.newly_exited.is_empty());
        assert_eq!(outcome.processes.len(), 1);
    }

    #[test]
    fn test_fallback_enumeration_when_nothing_found() {
        // PID 42 is invisible to enumeration but reachable per-PID, the way
        // restricted hosts behave.
        let inner = Arc::new(MockProcessApi::default());
        inner.insert(42, MockProcess {
            binary_name: "claude".to_string(),
            args: vec!["claude".to_string(), "--resume".to_string()],
            ..Default::default()
        });

        let scanner = Scanner::with_settings_paths(
            Arc::new(EmptyListingApi(inner)),
            Vec::new(),
        )
        .with_fallback(|| vec![42, 43]);

        let outcome = scanner.scan();

        // PID 42 enriched via the API; PID 43 unreadable but retained.
        assert_eq!(outcome.processes.len(), 2);
        let enriched = outcome.processes.iter().find(|p| p.pid == 42).unwrap();
        assert_eq!(enriched.binary_name, "claude");
        assert!(enriched.env_readable);
        let opaque = outcome.processes.iter().find(|p| p.pid == 43).unwrap();
        assert!(!opaque.env_readable);
    }

    /// Delegates per-PID calls but reports no PIDs from enumeration.
    struct EmptyListingApi(Arc<MockProcessApi>);

    impl ProcessApi for EmptyListingApi {
        fn list_all_pids(&self) -> Result<Vec<i32>> {
            Ok(Vec::new())
        }

        fn process_info(&self, pid: i32) -> Result<RawProcessInfo> {
            self.0.process_info(pid)
        }

        fn process_args(&self, pid: i32) -> Result<(Vec<String>, HashMap<String, String>)> {
            self.0.process_args(pid)
        }

        fn process_cwd(&self, pid: i32) -> Result<String> {
            self.0.process_cwd(pid)
        }

        fn open_ports(&self, pid: i32) -> Result<Vec<(u16, u16)>> {
            self.0.open_ports(pid)
        }
    }

    #[test]
    fn test_env_filtered_to_allowlist() {
        let api = Arc::new(MockProcessApi::default());
        let mut env = HashMap::new();
        env.insert("CLAUDE_CODE_ENABLE_TELEMETRY".to_string(), "1".to_string());
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("HOME".to_string(), "/home/dev".to_string());
        api.insert(800, MockProcess {
            binary_name: "claude".to_string(),
            env,
            ..Default::default()
        });

        let scanner = scanner_with(api);
        let outcome = scanner.scan();

        let vars = &outcome.processes[0].env_vars;
        assert_eq!(vars.len(), 1);
        assert_eq!(vars["CLAUDE_CODE_ENABLE_TELEMETRY"], "1");
    }

    #[test]
    fn test_settings_merge_process_env_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let user_path = dir.path().join("settings.json");
        let managed_path = dir.path().join("managed-settings.json");

        let mut f = std::fs::File::create(&user_path).unwrap();
        write!(
            f,
            r#"{{"env": {{"OTEL_METRICS_EXPORTER": "otlp", "CLAUDE_CODE_ENABLE_TELEMETRY": "1"}}}}"#
        )
        .unwrap();
        let mut f = std::fs::File::create(&managed_path).unwrap();
        write!(f, r#"{{"env": {{"OTEL_METRICS_EXPORTER": "console"}}}}"#).unwrap();

        let api = Arc::new(MockProcessApi::default());
        let mut env = HashMap::new();
        env.insert("CLAUDE_CODE_ENABLE_TELEMETRY".to_string(), "0".to_string());
        api.insert(900, MockProcess {
            binary_name: "claude".to_string(),
            env,
            ..Default::default()
        });

        let scanner = Scanner::with_settings_paths(api, vec![user_path, managed_path]);
        let outcome = scanner.scan();

        let vars = &outcome.processes[0].env_vars;
        // The process's own value is never overwritten.
        assert_eq!(vars["CLAUDE_CODE_ENABLE_TELEMETRY"], "0");
        // Later settings files override earlier ones.
        assert_eq!(vars["OTEL_METRICS_EXPORTER"], "console");
    }

    #[test]
    fn test_malformed_settings_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(read_settings_env(&path).is_empty());
        assert!(read_settings_env(Path::new("/nonexistent/settings.json")).is_empty());
    }

    #[test]
    fn test_detect_terminal_table() {
        let cases: &[(&[(&str, &str)], &str)] = &[
            (&[("TERM_PROGRAM", "iTerm.app")], "iTerm2"),
            (&[("TERM_PROGRAM", "Apple_Terminal")], "Terminal"),
            (&[("TERM_PROGRAM", "vscode")], "VS Code"),
            (&[("TERM_PROGRAM", "cursor")], "Cursor"),
            (&[("TERM_PROGRAM", "WezTerm")], "WezTerm"),
            (&[("TMUX", "/tmp/tmux-1000/default,123,0")], "tmux"),
            (&[("VSCODE_PID", "4321")], "VS Code"),
            (&[("CURSOR_CHANNEL", "stable")], "Cursor"),
            (&[], ""),
        ];

        for (pairs, expected) in cases {
            let env: HashMap<String, String> = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            assert_eq!(detect_terminal(&env), *expected, "env: {pairs:?}");
        }
    }

    #[test]
    fn test_shorten_home() {
        if let Some(home) = dirs::home_dir() {
            let path = format!("{}/projects/demo", home.to_string_lossy());
            assert_eq!(shorten_home(&path), "~/projects/demo");
        }
        assert_eq!(shorten_home("/opt/other"), "/opt/other");
        assert_eq!(shorten_home(""), "");
    }
}
