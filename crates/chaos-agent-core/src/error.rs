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
use thiserror::Error;

/// Conditions an injector cannot turn into an outcome itself.
///
/// The scheduler catches these at the cycle boundary, logs them and counts the
/// injection as failed; they never stop the loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("background task failed to complete: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("process table unavailable: {0}")]
    ProcessTable(String),
    #[error("no injector registered for failure type '{0}'")]
    MissingInjector(FailureKind),
    #[error("injector for '{kind}' panicked: {message}")]
    Panicked { kind: FailureKind, message: String },
}
