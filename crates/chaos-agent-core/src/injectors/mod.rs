//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
//! One injector per failure type, all behind the [`Injector`] trait.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chaos_agent_common::{FailureKind, FailureSpec};
use chaos_agent_metrics::InjectionMetrics;

use crate::command::CommandRunner;
use crate::context::InjectionContext;
use crate::error::AgentError;
use crate::lifecycle::ActiveResourceSet;
use crate::outcome::Dispatch;
use crate::process_table::ProcessTable;
use crate::safety::{LinkProbe, ProcessSafetyPolicy};
use crate::tasks::TaskRegistry;

pub mod cpu;
pub mod memory;
pub mod network;
pub mod process;

pub use cpu::CpuInjector;
pub use memory::MemoryInjector;
pub use network::NetworkInjector;
pub use process::ProcessInjector;

/// Applies one failure type to the host and reports how it ended.
///
/// Expected failures (validation, missing targets, tool errors) come back as an
/// outcome inside `Ok`; `Err` is reserved for conditions the injector could not
/// interpret. Every outcome is recorded in metrics exactly once by the injector.
#[async_trait]
pub trait Injector: Send + Sync {
    fn kind(&self) -> FailureKind;

    async fn inject(&self, spec: &FailureSpec, ctx: &InjectionContext) -> Result<Dispatch, AgentError>;
}

/// Everything the built-in injectors need from the host.
#[derive(Debug, Clone)]
pub struct HostBindings {
    pub metrics: InjectionMetrics,
    pub runner: Arc<dyn CommandRunner>,
    pub probe: Arc<dyn LinkProbe>,
    pub processes: Arc<dyn ProcessTable>,
    pub policy: Arc<ProcessSafetyPolicy>,
    pub active: Arc<ActiveResourceSet>,
    pub tasks: Arc<TaskRegistry>,
    pub command_timeout: Duration,
}

/// Injectors keyed by the failure type they handle.
#[derive(Clone, Default)]
pub struct InjectorSet {
    injectors: BTreeMap<FailureKind, Arc<dyn Injector>>,
}

impl InjectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in injectors wired to `host`.
    pub fn standard(host: &HostBindings) -> Self {
        Self::new()
            .with(Arc::new(CpuInjector::new(host.metrics.clone())))
            .with(Arc::new(MemoryInjector::new(
                host.metrics.clone(),
                host.tasks.clone(),
            )))
            .with(Arc::new(ProcessInjector::new(
                host.metrics.clone(),
                host.processes.clone(),
                host.policy.clone(),
            )))
            .with(Arc::new(
                NetworkInjector::new(
                    host.metrics.clone(),
                    host.runner.clone(),
                    host.probe.clone(),
                    host.active.clone(),
                )
                .with_command_timeout(host.command_timeout),
            ))
    }

    /// Register `injector`, replacing any previous one for the same kind.
    pub fn with(mut self, injector: Arc<dyn Injector>) -> Self {
        self.injectors.insert(injector.kind(), injector);
        self
    }

    pub fn get(&self, kind: FailureKind) -> Option<&Arc<dyn Injector>> {
        self.injectors.get(&kind)
    }

    pub fn kinds(&self) -> Vec<FailureKind> {
        self.injectors.keys().copied().collect()
    }
}

impl fmt::Debug for InjectorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectorSet")
            .field("kinds", &self.kinds())
            .finish()
    }
}
