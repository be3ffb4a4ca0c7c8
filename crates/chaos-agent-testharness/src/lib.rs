//! ---
//! agent_section: "11-verification"
//! agent_subsection: "01-bootstrap"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Host test doubles and shared exports."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
//! Test doubles standing in for the host so injectors can be exercised
//! without touching real interfaces or processes.

pub mod commands;
pub mod processes;

pub use commands::{FakeLinkProbe, ScriptedCommandRunner};
pub use processes::{ExitBehaviour, FakeProcessTable};
