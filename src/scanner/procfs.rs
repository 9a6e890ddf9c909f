use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

use super::{ProcessApi, RawProcessInfo};

/// Production [`ProcessApi`] backed by the sysinfo crate, with /proc used
/// directly for per-PID TCP socket pairs (which sysinfo does not expose).
pub struct SysinfoProcessApi {
    sys: Mutex<System>,
}

impl Default for SysinfoProcessApi {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProcessApi {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    fn with_process<T>(&self, pid: i32, f: impl FnOnce(&sysinfo::Process) -> T) -> Result<T> {
        let sys = self.sys.lock();
        let process = sys
            .process(Pid::from_u32(pid as u32))
            .ok_or_else(|| anyhow!("pid {pid} not found"))?;
        Ok(f(process))
    }
}

impl ProcessApi for SysinfoProcessApi {
    fn list_all_pids(&self) -> Result<Vec<i32>> {
        let mut sys = self.sys.lock();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        Ok(sys
            .processes()
            .keys()
            .map(|pid| pid.as_u32() as i32)
            .collect())
    }

    fn process_info(&self, pid: i32) -> Result<RawProcessInfo> {
        self.with_process(pid, |p| RawProcessInfo {
            pid,
            binary_name: p.name().to_string_lossy().to_string(),
        })
    }

    fn process_args(&self, pid: i32) -> Result<(Vec<String>, HashMap<String, String>)> {
        let (args, environ) = self.with_process(pid, |p| {
            let args: Vec<String> = p
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy().to_string())
                .collect();
            let environ: Vec<String> = p
                .environ()
                .iter()
                .map(|e| e.to_string_lossy().to_string())
                .collect();
            (args, environ)
        })?;

        // An empty environment for a live process means we could not read it
        // (kernel threads, other users' processes).
        if args.is_empty() && environ.is_empty() {
            anyhow::bail!("argv/env unreadable for pid {pid}");
        }

        let env_vars = environ
            .iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        Ok((args, env_vars))
    }

    fn process_cwd(&self, pid: i32) -> Result<String> {
        self.with_process(pid, |p| {
            p.cwd()
                .map(|c| c.to_string_lossy().to_string())
                .unwrap_or_default()
        })
    }

    #[cfg(target_os = "linux")]
    fn open_ports(&self, pid: i32) -> Result<Vec<(u16, u16)>> {
        let inodes = socket_inodes(pid)?;
        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut pairs = Vec::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(content) = std::fs::read_to_string(table) {
                pairs.extend(tcp_pairs_for_inodes(&content, &inodes));
            }
        }

        Ok(pairs)
    }

    #[cfg(not(target_os = "linux"))]
    fn open_ports(&self, _pid: i32) -> Result<Vec<(u16, u16)>> {
        Ok(Vec::new())
    }
}

/// Socket inodes owned by a PID, from its /proc fd table.
#[cfg(target_os = "linux")]
fn socket_inodes(pid: i32) -> Result<HashSet<u64>> {
    use anyhow::Context;

    let fd_dir = format!("/proc/{pid}/fd");
    let entries = std::fs::read_dir(&fd_dir).with_context(|| format!("reading {fd_dir}"))?;

    let mut inodes = HashSet::new();
    for entry in entries.flatten() {
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let target = target.to_string_lossy();
        if let Some(inode) = target
            .strip_prefix("socket:[")
            .and_then(|rest| rest.strip_suffix(']'))
        {
            if let Ok(inode) = inode.parse() {
                inodes.insert(inode);
            }
        }
    }

    Ok(inodes)
}

/// Parses a /proc/net/tcp-format table into (local_port, remote_port) pairs
/// for the given socket inodes.
fn tcp_pairs_for_inodes(table: &str, inodes: &HashSet<u64>) -> Vec<(u16, u16)> {
    let mut pairs = Vec::new();

    // Header line first; columns: sl local_address rem_address st tx:rx
    // tr:tm->when retrnsmt uid timeout inode ...
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }

        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };
        if !inodes.contains(&inode) {
            continue;
        }

        let (Some(local), Some(remote)) = (hex_port(fields[1]), hex_port(fields[2])) else {
            continue;
        };
        pairs.push((local, remote));
    }

    pairs
}

/// Port component of a `HEXIP:HEXPORT` address field.
fn hex_port(addr: &str) -> Option<u16> {
    let (_, port) = addr.rsplit_once(':')?;
    u16::from_str_radix(port, 16).ok()
}
