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
use std::time::Duration;

use async_trait::async_trait;
use chaos_agent_common::{FailureKind, FailureSpec};
use chaos_agent_logging::{agent_debug, agent_info, agent_warn, LogContext};
use chaos_agent_metrics::InjectionMetrics;

use super::Injector;
use crate::context::InjectionContext;
use crate::error::AgentError;
use crate::outcome::{conclude, Dispatch, InjectionOutcome};
use crate::process_table::{descendants_of, ProcessInfo, ProcessSignal, ProcessTable, SignalError};
use crate::safety::ProcessSafetyPolicy;

/// Time a target gets to honour SIGTERM before SIGKILL.
pub const TERMINATE_WAIT: Duration = Duration::from_secs(3);
pub const KILL_WAIT: Duration = Duration::from_secs(2);

/// Terminates one named, non-critical process that is not part of the agent.
#[derive(Debug)]
pub struct ProcessInjector {
    metrics: InjectionMetrics,
    table: Arc<dyn ProcessTable>,
    policy: Arc<ProcessSafetyPolicy>,
    terminate_wait: Duration,
    kill_wait: Duration,
}

impl ProcessInjector {
    pub fn new(
        metrics: InjectionMetrics,
        table: Arc<dyn ProcessTable>,
        policy: Arc<ProcessSafetyPolicy>,
    ) -> Self {
        Self {
            metrics,
            table,
            policy,
            terminate_wait: TERMINATE_WAIT,
            kill_wait: KILL_WAIT,
        }
    }

    pub fn with_waits(mut self, terminate_wait: Duration, kill_wait: Duration) -> Self {
        self.terminate_wait = terminate_wait;
        self.kill_wait = kill_wait;
        self
    }

    /// Processes matching `target` that are safe to kill, in ascending pid order.
    ///
    /// Excludes the agent, its parent and descendants, and critical processes.
    /// `target` must already have passed target-name validation.
    pub fn find_targets(&self, target: &str, log: &LogContext<'_>) -> Result<Vec<ProcessInfo>, AgentError> {
        let processes = self.table.snapshot()?;
        let own_pid = self.table.current_pid();
        let mut protected = descendants_of(own_pid, &processes);
        protected.insert(own_pid);
        if let Some(parent) = self.table.parent_pid() {
            protected.insert(parent);
        }

        let needle = target.trim().to_lowercase();
        let mut matches = Vec::new();
        for process in processes {
            if protected.contains(&process.pid) {
                continue;
            }
            if self.policy.is_critical_process(&process.name, &process.cmdline) {
                agent_debug!(context = log, pid = process.pid, name = %process.name, "skipping critical process");
                continue;
            }
            let by_name = process.name.to_lowercase().contains(&needle);
            let by_cmdline = !by_name && {
                let cmdline = process.cmdline.join(" ").to_lowercase();
                cmdline.contains(&needle) && !self.policy.is_self_cmdline(&cmdline)
            };
            if by_name || by_cmdline {
                matches.push(process);
            }
        }
        Ok(matches)
    }

    async fn terminate(&self, target: &ProcessInfo, log: &LogContext<'_>) -> InjectionOutcome {
        let pid = target.pid;
        if let Err(err) = self.table.signal(pid, ProcessSignal::Terminate) {
            return signal_failure(err);
        }
        if self.table.wait_for_exit(pid, self.terminate_wait).await {
            agent_info!(context = log, pid, name = %target.name, "process terminated");
            return InjectionOutcome::Success;
        }

        agent_warn!(context = log, pid, name = %target.name, "process ignored SIGTERM; sending SIGKILL");
        if let Err(err) = self.table.signal(pid, ProcessSignal::Kill) {
            return signal_failure(err);
        }
        if self.table.wait_for_exit(pid, self.kill_wait).await {
            agent_info!(context = log, pid, name = %target.name, "process killed");
            InjectionOutcome::Success
        } else {
            InjectionOutcome::failed(format!("process {pid} survived SIGKILL"))
        }
    }
}

fn signal_failure(err: SignalError) -> InjectionOutcome {
    match err {
        SignalError::NoSuchProcess(pid) => {
            InjectionOutcome::skipped(format!("process {pid} exited before it could be signalled"))
        }
        other => InjectionOutcome::failed(other.to_string()),
    }
}

#[async_trait]
impl Injector for ProcessInjector {
    fn kind(&self) -> FailureKind {
        FailureKind::Process
    }

    async fn inject(&self, spec: &FailureSpec, ctx: &InjectionContext) -> Result<Dispatch, AgentError> {
        let log = ctx.log(FailureKind::Process);
        let finish = |outcome| Ok(Dispatch::Completed(conclude(&self.metrics, FailureKind::Process, ctx, outcome)));

        let Some(raw_target) = spec.target_name.as_deref().filter(|name| !name.is_empty()) else {
            agent_warn!(context = log, "process injection enabled without a target_name");
            return finish(InjectionOutcome::skipped("no target_name configured"));
        };
        let target = match self.policy.validate_target_name(raw_target) {
            Ok(target) => target,
            Err(rejection) => {
                agent_warn!(context = log, target = raw_target, reason = %rejection, "process injection rejected");
                return finish(InjectionOutcome::failed(format!("validation failed: {rejection}")));
            }
        };

        let candidates = self.find_targets(&target, &log)?;
        let Some(victim) = candidates.first() else {
            agent_info!(context = log, target = %target, "no killable process matched");
            return finish(InjectionOutcome::skipped(format!("no killable process matching '{target}'")));
        };

        if ctx.dry_run() {
            agent_info!(
                context = log,
                pid = victim.pid,
                name = %victim.name,
                candidates = candidates.len(),
                "dry run: would kill process"
            );
            return finish(InjectionOutcome::skipped("dry run"));
        }

        agent_info!(context = log, pid = victim.pid, name = %victim.name, "killing process");
        let _active = self.metrics.begin(FailureKind::Process.as_str());
        let outcome = self.terminate(victim, &log).await;
        finish(outcome)
    }
}
