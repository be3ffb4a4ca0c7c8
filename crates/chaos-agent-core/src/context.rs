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
use chaos_agent_logging::LogContext;
use uuid::Uuid;

/// Per-cycle context handed explicitly to every injector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionContext {
    correlation_id: String,
    cycle: u64,
    dry_run: bool,
}

impl InjectionContext {
    /// Fresh context for a scheduler cycle with a random correlation id.
    pub fn new(cycle: u64, dry_run: bool) -> Self {
        Self::with_correlation_id(Uuid::new_v4().simple().to_string(), cycle, dry_run)
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>, cycle: u64, dry_run: bool) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            cycle,
            dry_run,
        }
    }

    /// Context for a call made outside the scheduler loop (CLI, recovery).
    pub fn standalone(dry_run: bool) -> Self {
        Self::new(0, dry_run)
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Logging context tagged with the failure type being injected.
    pub fn log(&self, kind: FailureKind) -> LogContext<'_> {
        LogContext::new()
            .with_correlation_id(&self.correlation_id)
            .with_cycle(self.cycle)
            .with_failure_type(kind.as_str())
            .with_dry_run(self.dry_run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_get_distinct_correlation_ids() {
        let first = InjectionContext::new(1, false);
        let second = InjectionContext::new(2, false);
        assert_ne!(first.correlation_id(), second.correlation_id());
        assert_eq!(first.correlation_id().len(), 32);
    }

    #[test]
    fn log_context_carries_cycle_fields() {
        let ctx = InjectionContext::with_correlation_id("abc", 4, true);
        let log = ctx.log(FailureKind::Network);
        assert_eq!(log.correlation_id, Some("abc"));
        assert_eq!(log.cycle, Some(4));
        assert_eq!(log.failure_type, Some("network"));
        assert!(log.dry_run);
    }
}
