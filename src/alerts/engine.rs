use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::burnrate::Calculator;
use crate::config::Config;
use crate::state::MemoryStore;

use super::rules::{build_rules, Rule};
use super::{Alert, Notifier};

/// Default evaluation cadence.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Default suppression window for repeated alerts with the same key.
const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(60);

/// Periodically evaluates all alert rules against the store, deduplicates
/// the results, and dispatches new alerts to the notifier.
pub struct Engine {
    store: Arc<MemoryStore>,
    rules: Mutex<Vec<Box<dyn Rule>>>,
    notifier: Option<Arc<dyn Notifier>>,
    interval: Duration,
    dedup_ttl: Duration,

    alerts: RwLock<Vec<Alert>>,
    last_fired: Mutex<HashMap<String, SystemTime>>,

    cancel: Mutex<Option<CancellationToken>>,
    run_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Creates an engine with all built-in rules configured from `cfg`. The
    /// calculator is shared with the cost/velocity rules (and typically with
    /// the dashboard).
    pub fn new(store: Arc<MemoryStore>, cfg: &Config, calculator: Arc<Calculator>) -> Self {
        Self {
            rules: Mutex::new(build_rules(cfg, calculator)),
            store,
            notifier: None,
            interval: DEFAULT_INTERVAL,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            alerts: RwLock::new(Vec::new()),
            last_fired: Mutex::new(HashMap::new()),
            cancel: Mutex::new(None),
            run_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Sets the notifier for system notifications.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Overrides the evaluation cadence.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Overrides the deduplication window.
    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Launches the periodic evaluator.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        *self.cancel.lock() = Some(cancel.clone());

        let engine = Arc::clone(&self);
        let interval = self.interval;

        let run_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        engine.evaluate_at(SystemTime::now());
                    }
                }
            }
        });
        *self.run_task.lock().await = Some(run_task);

        info!(interval = ?self.interval, dedup_ttl = ?self.dedup_ttl, "alert engine started");
    }

    /// Cancels the evaluator and waits for it to exit.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let run_task = { self.run_task.lock().await.take() };
        if let Some(task) = run_task {
            if let Err(e) = task.await {
                warn!(error = %e, "alert evaluator join failed");
            }
        }
    }

    /// Runs one evaluation cycle at an explicit time. Deterministic-test
    /// entry point, also used by the ticker.
    pub fn evaluate_at(&self, now: SystemTime) {
        let mut new_alerts = Vec::new();

        {
            let mut rules = self.rules.lock();
            for rule in rules.iter_mut() {
                for alert in rule.evaluate(&self.store, now) {
                    if self.is_duplicate(&alert) {
                        continue;
                    }
                    self.record_fired(&alert);
                    new_alerts.push(alert);
                }
            }
        }

        if new_alerts.is_empty() {
            return;
        }

        self.alerts.write().extend(new_alerts.iter().cloned());

        if let Some(notifier) = &self.notifier {
            for alert in &new_alerts {
                notifier.notify(alert);
            }
        }
    }

    /// Snapshot of every alert fired so far.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }

    /// Alerts scoped to one session, plus global alerts.
    pub fn alerts_for_session(&self, session_id: &str) -> Vec<Alert> {
        self.alerts
            .read()
            .iter()
            .filter(|a| a.session_id == session_id || a.session_id.is_empty())
            .cloned()
            .collect()
    }

    fn is_duplicate(&self, alert: &Alert) -> bool {
        let last_fired = self.last_fired.lock();
        match last_fired.get(&alert.alert_key()) {
            Some(&last) => alert
                .fired_at
                .duration_since(last)
                .map(|elapsed| elapsed < self.dedup_ttl)
                .unwrap_or(true),
            None => false,
        }
    }

    fn record_fired(&self, alert: &Alert) {
        let mut last_fired = self.last_fired.lock();
        last_fired.insert(alert.alert_key(), alert.fired_at);

        // Keep the dedup index bounded.
        let horizon = self.dedup_ttl * 2;
        last_fired.retain(|_, &mut fired| {
            alert
                .fired_at
                .duration_since(fired)
                .map(|elapsed| elapsed <= horizon)
                .unwrap_or(true)
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::state::{Event, API_ERROR_EVENT};

    /// Notifier that counts deliveries for assertions.
    #[derive(Default)]
    struct CountingNotifier {
        delivered: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _alert: &Alert) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn storm(store: &MemoryStore, session: &str, count: usize, now: SystemTime) {
        for i in 0..count {
            store.add_event(
                session,
                Event {
                    name: API_ERROR_EVENT.to_string(),
                    timestamp: now - Duration::from_secs(50 - (i as u64 % 50)),
                    ..Default::default()
                },
            );
        }
    }

    fn test_engine(store: Arc<MemoryStore>) -> (Arc<Engine>, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier::default());
        let engine = Engine::new(
            store,
            &Config::default(),
            Arc::new(Calculator::new()),
        )
        .with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>);
        (Arc::new(engine), notifier)
    }

    #[test]
    fn test_engine_fires_and_notifies() {
        let store = Arc::new(MemoryStore::new());
        let (engine, notifier) = test_engine(Arc::clone(&store));

        let now = SystemTime::now();
        storm(&store, "sess-engine", 15, now);

        engine.evaluate_at(now);

        assert!(!engine.alerts().is_empty());
        assert!(notifier.delivered.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_dedup_suppresses_within_window_and_allows_refire() {
        let store = Arc::new(MemoryStore::new());
        let (engine, notifier) = test_engine(Arc::clone(&store));

        let now = SystemTime::now();
        storm(&store, "sess-dedup", 15, now);

        engine.evaluate_at(now);
        let first_alerts = engine.alerts().len();
        let first_notified = notifier.delivered.load(Ordering::SeqCst);
        assert!(first_alerts > 0);

        // 30 seconds later the same condition holds, but the 60s dedup
        // window suppresses it.
        storm(&store, "sess-dedup", 15, now + Duration::from_secs(30));
        engine.evaluate_at(now + Duration::from_secs(30));
        assert_eq!(engine.alerts().len(), first_alerts);
        assert_eq!(notifier.delivered.load(Ordering::SeqCst), first_notified);

        // Two minutes later the window has passed and the alert may fire
        // again.
        storm(&store, "sess-dedup", 15, now + Duration::from_secs(120));
        engine.evaluate_at(now + Duration::from_secs(120));
        assert!(engine.alerts().len() > first_alerts);
    }

    #[test]
    fn test_alerts_for_session_includes_global() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = test_engine(Arc::clone(&store));

        let now = SystemTime::now();
        storm(&store, "sess-a", 15, now);
        engine.evaluate_at(now);

        assert!(!engine.alerts_for_session("sess-a").is_empty());
        // The error-storm alert is scoped to sess-a; other sessions only
        // see global alerts, of which there are none here.
        assert!(engine.alerts_for_session("sess-other").is_empty());
    }

    #[tokio::test]
    async fn test_engine_start_stop() {
        let store = Arc::new(MemoryStore::new());
        let (engine, _) = test_engine(store);

        let cancel = CancellationToken::new();
        Arc::clone(&engine).start(cancel.child_token()).await;

        cancel.cancel();
        engine.stop().await;
    }
}
