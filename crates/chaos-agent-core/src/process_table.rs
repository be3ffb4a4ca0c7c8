//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessStatus, System};
use thiserror::Error;

use crate::error::AgentError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Point-in-time view of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    pub fn new(pid: u32, parent: Option<u32>, name: impl Into<String>, cmdline: &[&str]) -> Self {
        Self {
            pid,
            parent,
            name: name.into(),
            cmdline: cmdline.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Polite request to exit (SIGTERM).
    Terminate,
    /// Forced termination (SIGKILL).
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("process {0} no longer exists")]
    NoSuchProcess(u32),
    #[error("permission denied signalling process {0}")]
    PermissionDenied(u32),
    #[error("failed to signal process {pid}: {detail}")]
    Other { pid: u32, detail: String },
}

/// Read and signal the host process table.
#[async_trait]
pub trait ProcessTable: Send + Sync + fmt::Debug {
    /// All visible processes ordered by ascending pid.
    fn snapshot(&self) -> Result<Vec<ProcessInfo>, AgentError>;

    fn current_pid(&self) -> u32;

    fn parent_pid(&self) -> Option<u32>;

    fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), SignalError>;

    /// Wait until `pid` is gone. Returns `false` if it outlived `timeout`.
    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool;
}

/// Every transitive child of `root` according to the parent links in `processes`.
pub fn descendants_of(root: u32, processes: &[ProcessInfo]) -> BTreeSet<u32> {
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for process in processes {
        if let Some(parent) = process.parent {
            if parent != process.pid {
                children.entry(parent).or_default().push(process.pid);
            }
        }
    }

    let mut found = BTreeSet::new();
    let mut pending = vec![root];
    while let Some(pid) = pending.pop() {
        for child in children.get(&pid).into_iter().flatten() {
            if *child != root && found.insert(*child) {
                pending.push(*child);
            }
        }
    }
    found
}

/// [`ProcessTable`] backed by `sysinfo` for enumeration and POSIX signals for delivery.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn is_gone(&self, pid: u32) -> bool {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return true;
        }
        // A zombie has exited; only its parent's bookkeeping keeps it listed.
        matches!(
            system.process(pid).map(|process| process.status()),
            None | Some(ProcessStatus::Zombie) | Some(ProcessStatus::Dead)
        )
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemProcessTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemProcessTable").finish_non_exhaustive()
    }
}

#[async_trait]
impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessInfo>, AgentError> {
        let mut system = self.system.lock();
        system.refresh_processes();
        let mut processes: Vec<ProcessInfo> = system
            .processes()
            .values()
            .map(|process| ProcessInfo {
                pid: process.pid().as_u32(),
                parent: process.parent().map(|pid| pid.as_u32()),
                name: process.name().to_owned(),
                cmdline: process.cmd().to_vec(),
            })
            .collect();
        if processes.is_empty() {
            return Err(AgentError::ProcessTable(
                "no processes visible to the agent".to_owned(),
            ));
        }
        processes.sort_by_key(|process| process.pid);
        Ok(processes)
    }

    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn parent_pid(&self) -> Option<u32> {
        #[cfg(unix)]
        {
            u32::try_from(nix::unistd::getppid().as_raw()).ok()
        }
        #[cfg(not(unix))]
        {
            let system = self.system.lock();
            system
                .process(Pid::from_u32(std::process::id()))
                .and_then(|process| process.parent())
                .map(|pid| pid.as_u32())
        }
    }

    fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), SignalError> {
        send_signal(pid, signal)
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_gone(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: ProcessSignal) -> Result<(), SignalError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as RawPid;

    let raw = i32::try_from(pid).map_err(|_| SignalError::Other {
        pid,
        detail: "pid out of range".to_owned(),
    })?;
    let signal = match signal {
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
    };
    kill(RawPid::from_raw(raw), signal).map_err(|errno| match errno {
        Errno::ESRCH => SignalError::NoSuchProcess(pid),
        Errno::EPERM => SignalError::PermissionDenied(pid),
        other => SignalError::Other {
            pid,
            detail: other.desc().to_owned(),
        },
    })
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: ProcessSignal) -> Result<(), SignalError> {
    Err(SignalError::Other {
        pid,
        detail: "process signals are not supported on this platform".to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendants_follow_parent_links_transitively() {
        let processes = vec![
            ProcessInfo::new(1, None, "init", &[]),
            ProcessInfo::new(10, Some(1), "agent", &[]),
            ProcessInfo::new(11, Some(10), "worker", &[]),
            ProcessInfo::new(12, Some(11), "grandchild", &[]),
            ProcessInfo::new(20, Some(1), "unrelated", &[]),
        ];
        let found = descendants_of(10, &processes);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![11, 12]);
        assert!(descendants_of(20, &processes).is_empty());
    }

    #[test]
    fn descendants_tolerate_cycles() {
        let processes = vec![
            ProcessInfo::new(5, Some(6), "a", &[]),
            ProcessInfo::new(6, Some(5), "b", &[]),
        ];
        assert_eq!(descendants_of(5, &processes).into_iter().collect::<Vec<_>>(), vec![6]);
    }

    #[test]
    fn live_snapshot_contains_self() {
        let table = SystemProcessTable::new();
        let snapshot = table.snapshot().unwrap();
        assert!(snapshot.iter().any(|p| p.pid == table.current_pid()));
        assert!(snapshot.windows(2).all(|pair| pair[0].pid < pair[1].pid));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminates_and_observes_exit_of_real_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let table = SystemProcessTable::new();
        table.signal(child.id(), ProcessSignal::Terminate).unwrap();
        // Reap so the pid does not linger as our zombie.
        let _ = child.wait();
        assert!(table.wait_for_exit(child.id(), Duration::from_secs(3)).await);
    }

    #[cfg(unix)]
    #[test]
    fn signalling_missing_process_reports_no_such_process() {
        let table = SystemProcessTable::new();
        assert_eq!(
            table.signal(999_999_999, ProcessSignal::Terminate),
            Err(SignalError::NoSuchProcess(999_999_999))
        );
    }
}
