//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use chaos_agent_common::FailureKind;
use chaos_agent_logging::{log_injection_event, EventOutcome};
use chaos_agent_metrics::{InjectionMetrics, InjectionStatus};

use crate::context::InjectionContext;
use crate::tasks::TaskId;

/// Terminal result of one injection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionOutcome {
    Success,
    /// Intentionally not carried out: dry run, nothing to target, or capacity reached.
    Skipped(String),
    /// Rejected by validation or failed while being applied.
    Failed(String),
}

impl InjectionOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        InjectionOutcome::Skipped(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        InjectionOutcome::Failed(reason.into())
    }

    pub fn status(&self) -> InjectionStatus {
        match self {
            InjectionOutcome::Success => InjectionStatus::Success,
            InjectionOutcome::Skipped(_) => InjectionStatus::Skipped,
            InjectionOutcome::Failed(_) => InjectionStatus::Failed,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            InjectionOutcome::Success => None,
            InjectionOutcome::Skipped(reason) | InjectionOutcome::Failed(reason) => Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InjectionOutcome::Success)
    }

    fn event_outcome(&self) -> EventOutcome {
        match self {
            InjectionOutcome::Success => EventOutcome::Success,
            InjectionOutcome::Skipped(_) => EventOutcome::Skipped,
            InjectionOutcome::Failed(_) => EventOutcome::Failed,
        }
    }
}

/// What an injector handed back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The injection ran to its terminal outcome before returning.
    Completed(InjectionOutcome),
    /// The injection continues in the background and reports on its own.
    Detached { task_id: TaskId },
}

impl Dispatch {
    pub fn outcome(&self) -> Option<&InjectionOutcome> {
        match self {
            Dispatch::Completed(outcome) => Some(outcome),
            Dispatch::Detached { .. } => None,
        }
    }
}

/// Record the outcome once in metrics and logs, then hand it back.
pub(crate) fn conclude(
    metrics: &InjectionMetrics,
    kind: FailureKind,
    ctx: &InjectionContext,
    outcome: InjectionOutcome,
) -> InjectionOutcome {
    metrics.record(kind.as_str(), outcome.status());
    let detail = outcome.reason().unwrap_or("injection completed");
    log_injection_event(
        &ctx.log(kind),
        "injection.completed",
        detail,
        outcome.event_outcome(),
    );
    outcome
}
