//! ---
//! agent_section: "01-core-functionality"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Shared primitives for the chaos agent runtime."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
//! Shared primitives for the chaos agent workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the injection engine and the daemon binary.

pub mod config;
pub mod logging;

pub use config::{
    AgentConfig, Config, ConfigError, DelayValue, FailureKind, FailureSpec, LoggingConfig,
    MetricsConfig, SafetyConfig,
};
pub use logging::{init_tracing, LogFormat};
