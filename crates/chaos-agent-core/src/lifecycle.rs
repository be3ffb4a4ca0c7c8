//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
//! Tracking of applied host changes and their guaranteed removal.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::injectors::network::{cleanup_network_rules, CleanupError, DEFAULT_COMMAND_TIMEOUT};
use crate::tasks::TaskRegistry;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    interfaces: Vec<String>,
}

/// Interfaces that currently carry an injected latency rule.
///
/// Optionally mirrored to a journal file so a restarted agent can remove rules
/// left behind by a crash.
#[derive(Debug, Default)]
pub struct ActiveResourceSet {
    interfaces: Mutex<BTreeSet<String>>,
    journal: Option<PathBuf>,
}

impl ActiveResourceSet {
    /// In-memory set without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set mirrored to `path`, seeded with whatever a previous run left there.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let interfaces = match read_journal(&path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "ignoring unreadable rule journal");
                BTreeSet::new()
            }
        };
        if !interfaces.is_empty() {
            info!(path = %path.display(), interfaces = ?interfaces, "found rules recorded by a previous run");
        }
        Self {
            interfaces: Mutex::new(interfaces),
            journal: Some(path),
        }
    }

    pub fn insert(&self, interface: &str) -> bool {
        let mut interfaces = self.interfaces.lock();
        let added = interfaces.insert(interface.to_owned());
        if added {
            self.persist(&interfaces);
        }
        added
    }

    pub fn remove(&self, interface: &str) -> bool {
        let mut interfaces = self.interfaces.lock();
        let removed = interfaces.remove(interface);
        if removed {
            self.persist(&interfaces);
        }
        removed
    }

    pub fn contains(&self, interface: &str) -> bool {
        self.interfaces.lock().contains(interface)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.interfaces.lock().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.interfaces.lock().len()
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_deref()
    }

    fn persist(&self, interfaces: &BTreeSet<String>) {
        let Some(path) = &self.journal else {
            return;
        };
        if let Err(err) = write_journal(path, interfaces) {
            warn!(path = %path.display(), error = %format!("{err:#}"), "failed to persist rule journal");
        }
    }
}

fn read_journal(path: &Path) -> Result<BTreeSet<String>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let raw = fs::read(path).with_context(|| format!("unable to read {}", path.display()))?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeSet::new());
    }
    let journal: Journal = serde_json::from_slice(&raw)
        .with_context(|| format!("malformed rule journal {}", path.display()))?;
    Ok(journal.interfaces.into_iter().collect())
}

fn write_journal(path: &Path, interfaces: &BTreeSet<String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
    }
    let journal = Journal {
        interfaces: interfaces.iter().cloned().collect(),
    };
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, serde_json::to_vec_pretty(&journal)?)
        .with_context(|| format!("unable to write {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| format!("unable to replace {}", path.display()))?;
    Ok(())
}

/// Result of a cleanup sweep.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupSummary {
    pub cleaned: Vec<String>,
    pub failed: Vec<(String, CleanupError)>,
    pub aborted_tasks: usize,
}

impl CleanupSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Restores the host at startup, on demand and at shutdown.
#[derive(Debug)]
pub struct LifecycleManager {
    active: Arc<ActiveResourceSet>,
    runner: Arc<dyn CommandRunner>,
    tasks: Option<Arc<TaskRegistry>>,
    command_timeout: Duration,
}

impl LifecycleManager {
    pub fn new(active: Arc<ActiveResourceSet>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            active,
            runner,
            tasks: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Cancel these detached injections at shutdown.
    pub fn with_tasks(mut self, tasks: Arc<TaskRegistry>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn active(&self) -> &Arc<ActiveResourceSet> {
        &self.active
    }

    /// Startup sweep: remove rules recorded by a previous run plus any rule on
    /// the configured interface.
    pub async fn recover(&self, configured: Option<&str>) -> CleanupSummary {
        let mut summary = self.cleanup_all().await;
        if let Some(interface) = configured {
            let already_handled = summary.cleaned.iter().any(|i| i == interface)
                || summary.failed.iter().any(|(i, _)| i == interface);
            if !already_handled {
                match cleanup_network_rules(self.runner.as_ref(), interface, self.command_timeout).await {
                    Ok(_) => summary.cleaned.push(interface.to_owned()),
                    Err(err) => {
                        warn!(interface, error = %err, "startup cleanup of configured interface failed");
                        summary.failed.push((interface.to_owned(), err));
                    }
                }
            }
        }
        info!(
            cleaned = summary.cleaned.len(),
            failed = summary.failed.len(),
            "startup recovery finished"
        );
        summary
    }

    /// Remove every rule still recorded as active.
    pub async fn cleanup_all(&self) -> CleanupSummary {
        let mut summary = CleanupSummary::default();
        for interface in self.active.snapshot() {
            match cleanup_network_rules(self.runner.as_ref(), &interface, self.command_timeout).await {
                Ok(_) => {
                    self.active.remove(&interface);
                    info!(interface = %interface, "removed injected latency");
                    summary.cleaned.push(interface);
                }
                Err(err) => {
                    // A rule can never be removed from a missing or invalid interface.
                    if matches!(err, CleanupError::NoSuchDevice(_) | CleanupError::Rejected(_)) {
                        self.active.remove(&interface);
                    }
                    warn!(interface = %interface, error = %err, "failed to remove injected latency");
                    summary.failed.push((interface, err));
                }
            }
        }
        summary
    }

    /// Cancel detached injections, then remove every active rule.
    pub async fn shutdown(&self) -> CleanupSummary {
        let aborted = self.tasks.as_ref().map_or(0, |tasks| tasks.abort_all());
        let mut summary = self.cleanup_all().await;
        summary.aborted_tasks = aborted;
        if summary.is_clean() {
            info!(aborted_tasks = aborted, cleaned = summary.cleaned.len(), "host restored");
        } else {
            warn!(
                aborted_tasks = aborted,
                failed = ?summary.failed.iter().map(|(i, _)| i.as_str()).collect::<Vec<_>>(),
                "shutdown left injected rules in place"
            );
        }
        summary
    }
}
