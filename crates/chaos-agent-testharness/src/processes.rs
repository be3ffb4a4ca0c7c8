//! ---
//! agent_section: "11-verification"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Host test doubles and shared exports."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chaos_agent_core::{AgentError, ProcessInfo, ProcessSignal, ProcessTable, SignalError};
use parking_lot::Mutex;

/// How a fake process reacts to signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitBehaviour {
    /// Exits on SIGTERM.
    #[default]
    Graceful,
    /// Ignores SIGTERM, dies on SIGKILL.
    Stubborn,
    /// Survives even SIGKILL.
    Unkillable,
    /// Disappears between enumeration and the first signal.
    Vanishes,
    /// Owned by another user.
    Protected,
}

/// In-memory process table that records every signal it receives.
#[derive(Debug)]
pub struct FakeProcessTable {
    own_pid: u32,
    parent_pid: Option<u32>,
    processes: Mutex<BTreeMap<u32, ProcessInfo>>,
    behaviours: Mutex<BTreeMap<u32, ExitBehaviour>>,
    signals: Mutex<Vec<(u32, ProcessSignal)>>,
    snapshots: AtomicUsize,
    unavailable: AtomicBool,
}

impl FakeProcessTable {
    /// A table in which the agent runs as `own_pid` under `parent_pid`.
    pub fn new(own_pid: u32, parent_pid: Option<u32>) -> Self {
        Self {
            own_pid,
            parent_pid,
            processes: Mutex::new(BTreeMap::new()),
            behaviours: Mutex::new(BTreeMap::new()),
            signals: Mutex::new(Vec::new()),
            snapshots: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn with_process(self, process: ProcessInfo) -> Self {
        self.processes.lock().insert(process.pid, process);
        self
    }

    pub fn with_behaviour(self, pid: u32, behaviour: ExitBehaviour) -> Self {
        self.behaviours.lock().insert(pid, behaviour);
        self
    }

    /// Make every snapshot fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().contains_key(&pid)
    }

    pub fn signals(&self) -> Vec<(u32, ProcessSignal)> {
        self.signals.lock().clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    fn behaviour(&self, pid: u32) -> ExitBehaviour {
        self.behaviours.lock().get(&pid).copied().unwrap_or_default()
    }
}

#[async_trait]
impl ProcessTable for FakeProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessInfo>, AgentError> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AgentError::ProcessTable("fake table offline".to_owned()));
        }
        Ok(self.processes.lock().values().cloned().collect())
    }

    fn current_pid(&self) -> u32 {
        self.own_pid
    }

    fn parent_pid(&self) -> Option<u32> {
        self.parent_pid
    }

    fn signal(&self, pid: u32, signal: ProcessSignal) -> Result<(), SignalError> {
        self.signals.lock().push((pid, signal));
        let behaviour = self.behaviour(pid);
        let mut processes = self.processes.lock();
        if !processes.contains_key(&pid) {
            return Err(SignalError::NoSuchProcess(pid));
        }
        let exits = match behaviour {
            ExitBehaviour::Vanishes => {
                processes.remove(&pid);
                return Err(SignalError::NoSuchProcess(pid));
            }
            ExitBehaviour::Protected => return Err(SignalError::PermissionDenied(pid)),
            ExitBehaviour::Graceful => true,
            ExitBehaviour::Stubborn => signal == ProcessSignal::Kill,
            ExitBehaviour::Unkillable => false,
        };
        if exits {
            processes.remove(&pid);
        }
        Ok(())
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        if self.is_alive(pid) {
            // Cap the wait so tests with production timeouts stay quick.
            tokio::time::sleep(timeout.min(Duration::from_millis(20))).await;
        }
        !self.is_alive(pid)
    }
}
