//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::sync::Arc;

use chaos_agent_common::{Config, FailureKind};
use chaos_agent_metrics::InjectionMetrics;

use crate::command::{CommandRunner, SystemCommandRunner};
use crate::injectors::network::DEFAULT_COMMAND_TIMEOUT;
use crate::injectors::{HostBindings, InjectorSet};
use crate::lifecycle::{ActiveResourceSet, LifecycleManager};
use crate::process_table::SystemProcessTable;
use crate::safety::{IpLinkProbe, ProcessSafetyPolicy};
use crate::scheduler::Scheduler;
use crate::tasks::TaskRegistry;

impl HostBindings {
    /// Bindings to the real host: child processes, `sysinfo` and POSIX signals,
    /// and the rule journal at `agent.state_file`.
    pub fn system(config: &Config, metrics: InjectionMetrics) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        Self {
            metrics,
            probe: Arc::new(IpLinkProbe::new(runner.clone(), DEFAULT_COMMAND_TIMEOUT)),
            runner,
            processes: Arc::new(SystemProcessTable::new()),
            policy: Arc::new(ProcessSafetyPolicy::from_config(&config.safety)),
            active: Arc::new(ActiveResourceSet::open(&config.agent.state_file)),
            tasks: Arc::new(TaskRegistry::new(config.agent.max_memory_tasks)),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// A scheduler and the lifecycle manager that shares its host state.
#[derive(Debug)]
pub struct AgentRuntime {
    pub scheduler: Scheduler,
    pub lifecycle: Arc<LifecycleManager>,
}

impl AgentRuntime {
    pub fn new(config: &Config, host: HostBindings) -> Self {
        let lifecycle = Arc::new(
            LifecycleManager::new(host.active.clone(), host.runner.clone())
                .with_tasks(host.tasks.clone())
                .with_command_timeout(host.command_timeout),
        );
        let scheduler = Scheduler::new(config, InjectorSet::standard(&host), host.metrics.clone())
            .with_lifecycle(lifecycle.clone());
        Self {
            scheduler,
            lifecycle,
        }
    }
}

/// Interface the network injector would touch, if network injection is enabled.
pub fn configured_interface(config: &Config) -> Option<&str> {
    config
        .failure(FailureKind::Network)
        .filter(|spec| spec.enabled)
        .map(|spec| spec.interface.as_str())
}
