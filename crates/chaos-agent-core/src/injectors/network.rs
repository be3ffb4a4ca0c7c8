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
use chaos_agent_logging::{agent_info, agent_warn, LogContext};
use chaos_agent_metrics::InjectionMetrics;
use thiserror::Error;

use super::Injector;
use crate::command::{CommandRunner, CommandVerdict};
use crate::context::InjectionContext;
use crate::error::AgentError;
use crate::lifecycle::ActiveResourceSet;
use crate::outcome::{conclude, Dispatch, InjectionOutcome};
use crate::safety::{validate_delay, validate_interface_name, verify_interface_exists, LinkProbe, Rejection};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub fn delete_rule_argv(interface: &str) -> Vec<String> {
    ["tc", "qdisc", "del", "dev", interface, "root"]
        .map(str::to_owned)
        .to_vec()
}

pub fn add_delay_argv(interface: &str, delay_ms: f64) -> Vec<String> {
    let delay = format!("{delay_ms}ms");
    ["tc", "qdisc", "add", "dev", interface, "root", "netem", "delay", delay.as_str()]
        .map(str::to_owned)
        .to_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    /// No rule was installed; treated as success.
    NothingToRemove,
}

/// Cleanup failures that may leave a rule in place.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CleanupError {
    #[error("refusing to clean up: {0}")]
    Rejected(#[from] Rejection),
    #[error("interface '{0}' does not exist")]
    NoSuchDevice(String),
    #[error("permission denied - NET_ADMIN capability required")]
    PermissionDenied,
    #[error("tc command not found - install iproute2")]
    ToolMissing,
    #[error("tc did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("failed to clean up: {0}")]
    Failed(String),
}

/// Remove any root queueing discipline from `interface`. Idempotent.
pub async fn cleanup_network_rules(
    runner: &dyn CommandRunner,
    interface: &str,
    timeout: Duration,
) -> Result<CleanupOutcome, CleanupError> {
    validate_interface_name(interface)?;
    let output = runner.run(&delete_rule_argv(interface), timeout).await;
    match output.classify() {
        CommandVerdict::Succeeded => Ok(CleanupOutcome::Removed),
        CommandVerdict::BenignAbsence => Ok(CleanupOutcome::NothingToRemove),
        CommandVerdict::NoSuchDevice => Err(CleanupError::NoSuchDevice(interface.to_owned())),
        CommandVerdict::PermissionDenied => Err(CleanupError::PermissionDenied),
        CommandVerdict::ToolMissing => Err(CleanupError::ToolMissing),
        CommandVerdict::TimedOut => Err(CleanupError::TimedOut(timeout)),
        CommandVerdict::Failed(detail) => Err(CleanupError::Failed(detail)),
    }
}

/// Adds latency to an interface with `tc netem` for the configured duration.
#[derive(Debug)]
pub struct NetworkInjector {
    metrics: InjectionMetrics,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn LinkProbe>,
    active: Arc<ActiveResourceSet>,
    command_timeout: Duration,
}

impl NetworkInjector {
    pub fn new(
        metrics: InjectionMetrics,
        runner: Arc<dyn CommandRunner>,
        probe: Arc<dyn LinkProbe>,
        active: Arc<ActiveResourceSet>,
    ) -> Self {
        Self {
            metrics,
            runner,
            probe,
            active,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn validate(&self, spec: &FailureSpec) -> Result<f64, Rejection> {
        validate_interface_name(&spec.interface)?;
        let delay = validate_delay(&spec.delay_ms)?;
        verify_interface_exists(self.probe.as_ref(), &spec.interface).await?;
        Ok(delay)
    }

    /// Remove the rule and forget the interface once it is gone.
    async fn release(&self, interface: &str) -> Result<CleanupOutcome, CleanupError> {
        let result = cleanup_network_rules(self.runner.as_ref(), interface, self.command_timeout).await;
        if result.is_ok() {
            self.active.remove(interface);
        }
        result
    }

    async fn apply(&self, interface: &str, delay_ms: f64) -> Result<(), CommandVerdict> {
        let output = self
            .runner
            .run(&add_delay_argv(interface, delay_ms), self.command_timeout)
            .await;
        match output.classify() {
            CommandVerdict::Succeeded => {
                self.active.insert(interface);
                Ok(())
            }
            other => Err(other),
        }
    }

    async fn run(&self, interface: &str, delay_ms: f64, hold: Duration, log: &LogContext<'_>) -> InjectionOutcome {
        let _active = self.metrics.begin(FailureKind::Network.as_str());

        if let Err(err) = self.release(interface).await {
            agent_warn!(context = log, interface, error = %err, "pre-injection cleanup failed");
        }

        let outcome = match self.apply(interface, delay_ms).await {
            Ok(()) => {
                agent_info!(
                    context = log,
                    interface,
                    delay_ms,
                    duration_s = hold.as_secs_f64(),
                    "latency applied"
                );
                tokio::time::sleep(hold).await;
                InjectionOutcome::Success
            }
            Err(verdict) => InjectionOutcome::failed(format!("failed to add delay: {verdict}")),
        };

        // Runs whether or not the rule was applied.
        match self.release(interface).await {
            Ok(_) => agent_info!(context = log, interface, "latency removed"),
            Err(err) => {
                agent_warn!(
                    context = log,
                    interface,
                    error = %err,
                    "post-injection cleanup failed; rule may still be active"
                );
                self.metrics.record_cleanup_failure(FailureKind::Network.as_str());
            }
        }
        outcome
    }
}

#[async_trait]
impl Injector for NetworkInjector {
    fn kind(&self) -> FailureKind {
        FailureKind::Network
    }

    async fn inject(&self, spec: &FailureSpec, ctx: &InjectionContext) -> Result<Dispatch, AgentError> {
        let log = ctx.log(FailureKind::Network);
        let interface = spec.interface.as_str();

        let delay_ms = match self.validate(spec).await {
            Ok(delay_ms) => delay_ms,
            Err(rejection) => {
                agent_warn!(context = log, interface, reason = %rejection, "network injection rejected");
                let outcome = InjectionOutcome::failed(format!("validation failed: {rejection}"));
                return Ok(Dispatch::Completed(conclude(&self.metrics, FailureKind::Network, ctx, outcome)));
            }
        };

        let outcome = if ctx.dry_run() {
            agent_info!(
                context = log,
                interface,
                delay_ms,
                duration_s = spec.duration.as_secs_f64(),
                "dry run: would add {}ms latency on {}",
                delay_ms,
                interface
            );
            InjectionOutcome::skipped("dry run")
        } else {
            agent_info!(context = log, interface, delay_ms, "adding network latency");
            self.run(interface, delay_ms, spec.duration, &log).await
        };
        Ok(Dispatch::Completed(conclude(&self.metrics, FailureKind::Network, ctx, outcome)))
    }
}
