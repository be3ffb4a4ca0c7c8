//! ---
//! agent_section: "03-observability"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Structured logging adapters and sinks."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Cycle-scoped structured logging for the chaos agent.
//!
//! The correlation identifier of a cycle travels as an explicit [`LogContext`]
//! value; nothing here keeps ambient per-thread state.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

#[doc(hidden)]
pub use tracing;

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Correlation identifier shared by every event of one scheduler cycle.
    pub correlation_id: Option<&'a str>,
    /// Monotonic cycle counter.
    pub cycle: Option<u64>,
    /// Failure type the event relates to.
    pub failure_type: Option<&'a str>,
    /// Whether the cycle runs in validate-only mode.
    pub dry_run: bool,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a correlation identifier.
    pub fn with_correlation_id(mut self, correlation_id: &'a str) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach a cycle number.
    pub fn with_cycle(mut self, cycle: u64) -> Self {
        self.cycle = Some(cycle);
        self
    }

    /// Attach a failure type label.
    pub fn with_failure_type(mut self, failure_type: &'a str) -> Self {
        self.failure_type = Some(failure_type);
        self
    }

    /// Mark the context as dry-run.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Terminal status of an injection as seen by the log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The injection ran to completion.
    Success,
    /// The injection was intentionally not carried out.
    Skipped,
    /// The injection was attempted or rejected and did not succeed.
    Failed,
}

impl EventOutcome {
    /// Label used for the `outcome` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Success => "success",
            EventOutcome::Skipped => "skipped",
            EventOutcome::Failed => "failed",
        }
    }
}

/// Emit a standardized injection event carrying the cycle context.
pub fn log_injection_event(context: &LogContext, event: &str, detail: &str, outcome: EventOutcome) {
    let outcome_label = outcome.as_str();
    match outcome {
        EventOutcome::Success | EventOutcome::Skipped => {
            agent_info!(context = context, event, outcome = outcome_label, "{}", detail)
        }
        EventOutcome::Failed => {
            agent_error!(context = context, event, outcome = outcome_label, "{}", detail)
        }
    }
}
