//! PID ↔ session correlation via source-port fingerprinting.
//!
//! The receivers observe the ephemeral TCP source port of every inbound
//! export and record `source_port → session_id` here. To bind a session to a
//! PID, the correlator walks the scanner's live processes and asks the OS
//! for each one's open TCP socket pairs: a process with a socket whose
//! *remote* port matches a recorded source port owns that session.
//! Unresolvable sessions simply stay at PID 0; nothing downstream may assume
//! correlation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::receiver::PortMapper;
use crate::scanner::ProcessApi;
use crate::state::MemoryStore;

/// Maps inbound connection source ports to session ids and resolves them to
/// PIDs on demand.
pub struct Correlator {
    api: Arc<dyn ProcessApi>,
    /// source port -> session id, pending resolution.
    pending: Mutex<HashMap<u16, String>>,
}

impl Correlator {
    pub fn new(api: Arc<dyn ProcessApi>) -> Self {
        Self {
            api,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Number of recorded, not-yet-resolved port mappings.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Attempts to resolve every pending mapping against the given live
    /// PIDs, writing successful bindings into the store. Per-PID socket
    /// inspection failures are skipped; their mappings stay pending.
    pub fn correlate(&self, store: &MemoryStore, live_pids: &[i32]) {
        if self.pending.lock().is_empty() {
            return;
        }

        // Snapshot socket pairs per PID once per cycle.
        let mut ports_by_pid: HashMap<i32, Vec<(u16, u16)>> = HashMap::new();
        for &pid in live_pids {
            if let Ok(pairs) = self.api.open_ports(pid) {
                ports_by_pid.insert(pid, pairs);
            }
        }

        let mut pending = self.pending.lock();
        pending.retain(|&source_port, session_id| {
            for (&pid, pairs) in &ports_by_pid {
                // The fingerprint matches on the remote side of the pair.
                if pairs.iter().any(|&(_, remote)| remote == source_port) {
                    store.update_pid(session_id, pid);
                    debug!(session_id = %session_id, pid, source_port, "session correlated");
                    return false;
                }
            }
            true
        });
    }
}

impl PortMapper for Correlator {
    fn record_source_port(&self, source_port: u16, session_id: &str) {
        if source_port == 0 || session_id.is_empty() {
            return;
        }
        self.pending
            .lock()
            .insert(source_port, session_id.to_string());
    }
}
