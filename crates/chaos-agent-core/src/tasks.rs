//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("background task limit reached ({limit} outstanding)")]
pub struct RegistryFull {
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub id: TaskId,
    pub label: String,
    pub age: Duration,
}

#[derive(Debug)]
struct TaskEntry {
    label: String,
    started: Instant,
    handle: JoinHandle<()>,
}

/// Bounded set of detached injections that outlive the cycle that started them.
#[derive(Debug)]
pub struct TaskRegistry {
    capacity: usize,
    next_id: AtomicU64,
    tasks: Mutex<BTreeMap<TaskId, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Spawn `task` on the runtime unless the registry is at capacity.
    pub fn try_spawn<F>(&self, label: impl Into<String>, task: F) -> Result<TaskId, RegistryFull>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, entry| !entry.handle.is_finished());
        if tasks.len() >= self.capacity {
            return Err(RegistryFull {
                limit: self.capacity,
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        debug!(task_id = id, label = %label, "spawning background injection");
        tasks.insert(
            id,
            TaskEntry {
                label,
                started: Instant::now(),
                handle: tokio::spawn(task),
            },
        );
        Ok(id)
    }

    pub fn outstanding(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, entry| !entry.handle.is_finished());
        tasks.len()
    }

    pub fn list(&self) -> Vec<TaskSummary> {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, entry| !entry.handle.is_finished());
        tasks
            .iter()
            .map(|(id, entry)| TaskSummary {
                id: *id,
                label: entry.label.clone(),
                age: entry.started.elapsed(),
            })
            .collect()
    }

    /// Wait for every outstanding task to finish on its own.
    pub async fn drain(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (id, entry) in tasks {
            if let Err(err) = entry.handle.await {
                if !err.is_cancelled() {
                    warn!(task_id = id, label = %entry.label, error = %err, "background injection ended abnormally");
                }
            }
        }
    }

    /// Cancel every outstanding task; returns how many were still running.
    pub fn abort_all(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let mut aborted = 0;
        for (id, entry) in tasks {
            if !entry.handle.is_finished() {
                entry.handle.abort();
                aborted += 1;
                debug!(task_id = id, label = %entry.label, "aborted background injection");
            }
        }
        aborted
    }
}
