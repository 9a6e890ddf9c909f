use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::{Engine, Notifier, SystemNotifier};
use crate::burnrate::{BurnRate, Calculator};
use crate::config::Config;
use crate::control::{ProcessControl, SignalProcessControl};
use crate::correlator::Correlator;
use crate::events::{format_event, FormattedEvent, RingBuffer};
use crate::receiver::{PortMapper, Receiver};
use crate::scanner::{
    classify_telemetry, ProcessApi, ProcessInfo, Scanner, StatusInfo, SysinfoProcessApi,
};
use crate::state::{MemoryStore, SessionData};
use crate::stats::{self, DashboardStats};

/// Cadence of the periodic activity summary in the logs.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Agent wires all components together: store, receivers, scanner,
/// correlator, alert engine, and event buffer. It owns their lifecycles and
/// exposes the narrow snapshot-returning query surface front-ends consume.
pub struct Agent {
    cfg: Config,
    store: Arc<MemoryStore>,
    calculator: Arc<Calculator>,
    scanner: Arc<Scanner>,
    correlator: Arc<Correlator>,
    event_buffer: Arc<RingBuffer>,
    engine: Arc<Engine>,
    receiver: Receiver,
    control: Arc<dyn ProcessControl>,
    cancel: CancellationToken,
    scan_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Agent {
    /// Builds the component graph from configuration. Nothing is bound or
    /// spawned until `start`.
    pub fn new(cfg: Config) -> Self {
        Self::with_process_api(cfg, Arc::new(SysinfoProcessApi::new()))
    }

    /// Builds the agent against an explicit process API. Tests use this to
    /// run the full pipeline without real process inspection.
    pub fn with_process_api(cfg: Config, api: Arc<dyn ProcessApi>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let calculator = Arc::new(Calculator::new());

        let scanner = Arc::new(Scanner::new(api));
        let correlator = Arc::new(Correlator::new(scanner.api()));

        let receiver = Receiver::new(
            cfg.receiver.clone(),
            Arc::clone(&store),
            Some(Arc::clone(&correlator) as Arc<dyn PortMapper>),
        );

        // Bridge: every stored event is formatted once into the ring buffer.
        let event_buffer = Arc::new(RingBuffer::new(cfg.display.event_buffer_size));
        {
            let buffer = Arc::clone(&event_buffer);
            store.on_event(move |session_id, event| {
                buffer.add(format_event(session_id, event));
            });
        }

        let notifier = SystemNotifier::new(cfg.alerts.notifications.system_notify);
        let engine = Arc::new(
            Engine::new(Arc::clone(&store), &cfg, Arc::clone(&calculator))
                .with_notifier(Arc::new(notifier) as Arc<dyn Notifier>),
        );

        Self {
            cfg,
            store,
            calculator,
            scanner,
            correlator,
            event_buffer,
            engine,
            receiver,
            control: Arc::new(SignalProcessControl::new()),
            cancel: CancellationToken::new(),
            scan_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Starts all components: binds the OTLP listeners, runs an initial
    /// synchronous scan so the first display frame has results, then spawns
    /// the periodic scan loop and the alert evaluator.
    pub async fn start(&mut self) -> Result<()> {
        self.receiver
            .start(self.cancel.child_token())
            .await
            .context("starting OTLP receivers")?;

        // Initial scan before anything periodic runs.
        let scanner = Arc::clone(&self.scanner);
        let outcome = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .context("initial process scan")?;
        info!(processes = outcome.processes.len(), "initial process scan complete");
        self.absorb_scan(outcome.newly_exited);

        let scan_task = self.spawn_scan_loop();
        *self.scan_task.lock().await = Some(scan_task);

        Arc::clone(&self.engine)
            .start(self.cancel.child_token())
            .await;
        self.spawn_summary_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stops every component: listeners drain, the scan loop and
    /// evaluator exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        self.receiver.stop().await;
        self.engine.stop().await;

        let scan_task = { self.scan_task.lock().await.take() };
        if let Some(task) = scan_task {
            if let Err(e) = task.await {
                warn!(error = %e, "scan loop join failed");
            }
        }

        info!("agent stopped");
    }

    /// Applies one scan cycle's liveness diff to the store and resolves any
    /// pending session correlations.
    fn absorb_scan(&self, newly_exited: Vec<i32>) {
        for pid in newly_exited {
            self.store.mark_exited(pid);
        }
        self.correlator
            .correlate(&self.store, &self.scanner.live_pids());
    }

    /// Spawns the periodic scanner loop.
    fn spawn_scan_loop(&self) -> tokio::task::JoinHandle<()> {
        let cancel = self.cancel.clone();
        let scanner = Arc::clone(&self.scanner);
        let correlator = Arc::clone(&self.correlator);
        let store = Arc::clone(&self.store);
        let interval = Duration::from_secs(self.cfg.scanner.interval_seconds);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let scan = Arc::clone(&scanner);
                        let outcome = match tokio::task::spawn_blocking(move || scan.scan()).await {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                warn!(error = %e, "scan task failed");
                                continue;
                            }
                        };

                        for pid in outcome.newly_exited {
                            debug!(pid, "tracked process exited");
                            store.mark_exited(pid);
                        }
                        correlator.correlate(&store, &scanner.live_pids());
                    }
                }
            }
        })
    }

    /// Spawns the periodic activity summary logger.
    fn spawn_summary_reporter(&self) {
        let cancel = self.cancel.clone();
        let store = Arc::clone(&self.store);
        let calculator = Arc::clone(&self.calculator);
        let engine = Arc::clone(&self.engine);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let sessions = store.list_sessions();
                        if sessions.is_empty() {
                            continue;
                        }

                        let br = calculator.compute(&store);
                        info!(
                            sessions = sessions.len(),
                            total_cost = format!("{:.4}", br.total_cost),
                            hourly_rate = format!("{:.2}", br.hourly_rate),
                            alerts = engine.alerts().len(),
                            "activity summary (60s)",
                        );
                    }
                }
            }
        });
    }

    // --- Query surface consumed by front-ends ---

    /// Session snapshots, oldest first.
    pub fn sessions(&self) -> Vec<SessionData> {
        self.store.list_sessions()
    }

    /// Tracked processes from the latest scan (live + exited pool).
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.scanner.processes()
    }

    /// Telemetry classification for one process, with received data from
    /// this collector as ground truth.
    pub fn telemetry_status(&self, proc: &ProcessInfo) -> StatusInfo {
        let has_data = self.store.has_session_for_pid(proc.pid);
        classify_telemetry(proc, self.cfg.receiver.grpc_port, has_data)
    }

    /// Current burn rate across all sessions.
    pub fn burn_rate(&self) -> BurnRate {
        self.calculator.compute(&self.store)
    }

    /// Every alert fired so far.
    pub fn active_alerts(&self) -> Vec<crate::alerts::Alert> {
        self.engine.alerts()
    }

    /// The most recent `limit` formatted events.
    pub fn recent_events(&self, limit: usize) -> Vec<FormattedEvent> {
        self.event_buffer.recent(limit)
    }

    /// Aggregate dashboard statistics.
    pub fn dashboard_stats(&self) -> DashboardStats {
        stats::compute(&self.store.list_sessions())
    }

    /// The process-control port for pause/terminate/resume actions.
    pub fn process_control(&self) -> Arc<dyn ProcessControl> {
        Arc::clone(&self.control)
    }

    /// The underlying store. Primarily for integration tests.
    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    /// Bound receiver addresses, available after `start`.
    pub fn grpc_addr(&self) -> Option<std::net::SocketAddr> {
        self.receiver.grpc_addr()
    }

    /// Bound HTTP receiver address, available after `start`.
    pub fn http_addr(&self) -> Option<std::net::SocketAddr> {
        self.receiver.http_addr()
    }
}
