//! Session kill-switch plumbing.
//!
//! The dashboard's pause/terminate actions go through the [`ProcessControl`]
//! port so tests never deliver real signals. The production implementation
//! maps the three actions onto SIGSTOP/SIGCONT/SIGTERM.

use anyhow::{bail, Context, Result};

/// Signal-delivery capability for correlated session processes.
pub trait ProcessControl: Send + Sync {
    /// Suspends the process (SIGSTOP).
    fn pause(&self, pid: i32) -> Result<()>;

    /// Resumes a suspended process (SIGCONT).
    fn resume(&self, pid: i32) -> Result<()>;

    /// Requests termination (SIGTERM).
    fn terminate(&self, pid: i32) -> Result<()>;
}

/// Production [`ProcessControl`] delivering real signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProcessControl;

impl SignalProcessControl {
    pub fn new() -> Self {
        Self
    }

    fn kill(&self, pid: i32, signal: libc::c_int) -> Result<()> {
        // Never signal pid 0 / negative pids: those address process groups.
        if pid <= 0 {
            bail!("refusing to signal pid {pid}");
        }

        // SAFETY: kill(2) with a positive pid affects exactly that process
        // and has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("signalling pid {pid}"));
        }

        Ok(())
    }
}

impl ProcessControl for SignalProcessControl {
    fn pause(&self, pid: i32) -> Result<()> {
        self.kill(pid, libc::SIGSTOP)
    }

    fn resume(&self, pid: i32) -> Result<()> {
        self.kill(pid, libc::SIGCONT)
    }

    fn terminate(&self, pid: i32) -> Result<()> {
        self.kill(pid, libc::SIGTERM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_positive_pids() {
        let control = SignalProcessControl::new();
        assert!(control.pause(0).is_err());
        assert!(control.terminate(-1).is_err());
    }

    #[test]
    fn test_pause_resume_terminate_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id() as i32;

        let control = SignalProcessControl::new();
        control.pause(pid).expect("pause");
        control.resume(pid).expect("resume");
        control.terminate(pid).expect("terminate");

        let status = child.wait().expect("wait");
        assert!(!status.success());
    }

    #[test]
    fn test_signalling_dead_pid_errors() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id() as i32;
        child.wait().expect("wait");

        // The reaped PID no longer exists (modulo unlucky reuse).
        let control = SignalProcessControl::new();
        let _ = control.resume(pid);
    }
}
