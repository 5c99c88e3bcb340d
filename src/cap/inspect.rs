use anyhow::{ensure, Result};
use nix::unistd::{getpgid, Pid};
use sysinfo::System;

/// One row of a process-table snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: i32,
    pub ppid: i32,
    pub pgid: i32,
}

/// Process lookup back-end. The kernel implementation prefers a per-PID
/// group probe; the full table scan is considerably slower and only used
/// when descendants are requested or the probe is unavailable.
pub trait Inspector {
    /// Group of a single process; `None` when the process is gone.
    fn pgid_of(&self, pid: i32) -> Option<i32>;

    /// Full process-table scan. Never cached; it goes stale instantly.
    fn snapshot(&self) -> Result<Vec<ProcEntry>>;

    /// Whether `pgid_of` is backed by a real kernel probe.
    fn has_fast_path(&self) -> bool;
}

pub struct KernelInspector {
    fast: bool,
}

impl KernelInspector {
    /// Capability probe: if the kernel answers for our own process, the fast
    /// path is usable for everyone else too.
    pub fn probe() -> Self {
        Self { fast: getpgid(None).is_ok() }
    }
}

impl Inspector for KernelInspector {
    fn pgid_of(&self, pid: i32) -> Option<i32> {
        if self.fast {
            return getpgid(Some(Pid::from_raw(pid))).ok().map(Pid::as_raw);
        }
        let snap = self.snapshot().ok()?;
        snap.iter().find(|e| e.pid == pid).map(|e| e.pgid)
    }

    fn snapshot(&self) -> Result<Vec<ProcEntry>> {
        let mut sys = System::new();
        sys.refresh_processes();
        let mut out = Vec::with_capacity(sys.processes().len());
        for (pid, proc_) in sys.processes() {
            let pid = pid.as_u32() as i32;
            // A process can vanish between the scan and the group lookup;
            // such rows carry no information.
            let Ok(pgid) = getpgid(Some(Pid::from_raw(pid))) else {
                continue;
            };
            let ppid = proc_.parent().map(|p| p.as_u32() as i32).unwrap_or(0);
            out.push(ProcEntry { pid, ppid, pgid: pgid.as_raw() });
        }
        ensure!(!out.is_empty(), "process table scan came back empty");
        Ok(out)
    }

    fn has_fast_path(&self) -> bool {
        self.fast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_finds_the_fast_path() {
        // getpgid(0) works on every POSIX kernel we support.
        assert!(KernelInspector::probe().has_fast_path());
    }

    #[test]
    fn own_group_resolves() {
        let insp = KernelInspector::probe();
        let me = std::process::id() as i32;
        let pgid = insp.pgid_of(me).expect("own pgid");
        assert_eq!(pgid, nix::unistd::getpgrp().as_raw());
    }

    #[test]
    fn missing_process_resolves_to_none() {
        let insp = KernelInspector::probe();
        assert_eq!(insp.pgid_of(i32::MAX - 1), None);
    }

    #[test]
    fn snapshot_contains_ourselves() {
        let insp = KernelInspector::probe();
        let snap = insp.snapshot().unwrap();
        let me = std::process::id() as i32;
        assert!(snap.iter().any(|e| e.pid == me));
    }
}
