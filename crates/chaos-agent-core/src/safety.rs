//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
//! Gatekeeping for every externally supplied parameter before it reaches the host.
//!
//! All validators are pure except [`verify_interface_exists`], which consults a
//! [`LinkProbe`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chaos_agent_common::{DelayValue, SafetyConfig};
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::{CommandRunner, CommandVerdict};

/// Kernel limit on interface name length (IFNAMSIZ - 1).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;
/// Upper bound for injected latency in milliseconds.
pub const MAX_DELAY_MS: f64 = 10_000.0;
pub const MIN_TARGET_NAME_LEN: usize = 3;

const FORBIDDEN_CHARACTERS: [char; 15] = [
    ';', '&', '|', '$', '`', '(', ')', '<', '>', '\n', '\r', '\\', '"', '\'', ' ',
];

/// Processes that must never be signalled.
pub const CRITICAL_PROCESSES: [&str; 22] = [
    "systemd",
    "init",
    "launchd",
    "dockerd",
    "containerd",
    "containerd-shim",
    "runc",
    "crio",
    "podman",
    "kubelet",
    "kube-proxy",
    "kube-apiserver",
    "kube-controller",
    "kube-scheduler",
    "sshd",
    "networkd",
    "networkmanager",
    "dbus-daemon",
    "rsyslogd",
    "journald",
    "udevd",
    "pause",
];

/// Target names broad enough to hit interpreters or system daemons.
pub const PROHIBITED_TARGETS: [&str; 14] = [
    "python",
    "python3",
    "java",
    "node",
    "sh",
    "bash",
    "zsh",
    "ksh",
    "systemd",
    "init",
    "root",
    "kubelet",
    "dockerd",
    "containerd",
];

/// Command-line fragments that identify the agent itself.
pub const DEFAULT_SELF_MARKERS: [&str; 2] = ["chaos-agent", "chaos_agent"];

/// Why a parameter was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("interface name cannot be empty")]
    EmptyInterface,
    #[error("interface name is too long ({len} > {max} characters)", max = MAX_INTERFACE_NAME_LEN)]
    InterfaceTooLong { len: usize },
    #[error("interface name contains forbidden character {0:?}")]
    ForbiddenCharacter(char),
    #[error("interface name contains invalid character {0:?}; only letters, digits, '.', '_', ':' and '-' are allowed")]
    InvalidCharacter(char),
    #[error("delay must be a number, got {0}")]
    NonNumericDelay(String),
    #[error("delay cannot be negative: {0}ms")]
    NegativeDelay(f64),
    #[error("delay exceeds maximum of {}ms: {}ms", MAX_DELAY_MS, .0)]
    DelayTooLarge(f64),
    #[error("interface '{0}' does not exist")]
    InterfaceMissing(String),
    #[error("could not verify interface '{name}': {detail}")]
    InterfaceUnverified { name: String, detail: String },
    #[error("target name cannot be empty")]
    EmptyTarget,
    #[error("target name '{0}' is too broad and could kill critical processes; use a more specific application name")]
    TargetTooBroad(String),
    #[error("target name '{}' is too short (minimum {} characters); use a specific application name", .0, MIN_TARGET_NAME_LEN)]
    TargetTooShort(String),
}

/// Check an interface name against kernel and shell-safety rules.
pub fn validate_interface_name(name: &str) -> Result<(), Rejection> {
    if name.is_empty() {
        return Err(Rejection::EmptyInterface);
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_CHARACTERS.contains(c)) {
        return Err(Rejection::ForbiddenCharacter(c));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(Rejection::InterfaceTooLong { len: name.len() });
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
    {
        return Err(Rejection::InvalidCharacter(c));
    }
    Ok(())
}

/// Check a configured delay and return it in milliseconds.
pub fn validate_delay(value: &DelayValue) -> Result<f64, Rejection> {
    let delay = match value {
        DelayValue::Number(delay) if delay.is_finite() => *delay,
        other => return Err(Rejection::NonNumericDelay(other.to_string())),
    };
    if delay < 0.0 {
        return Err(Rejection::NegativeDelay(delay));
    }
    if delay > MAX_DELAY_MS {
        return Err(Rejection::DelayTooLarge(delay));
    }
    Ok(delay)
}

/// Answer from the host link table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Present,
    Absent,
    /// The platform offers no way to ask.
    Unsupported,
    Error(String),
}

/// Looks up network interfaces on the host.
#[async_trait]
pub trait LinkProbe: Send + Sync + fmt::Debug {
    async fn lookup(&self, name: &str) -> LinkStatus;
}

/// [`LinkProbe`] that asks `ip link show`.
#[derive(Debug, Clone)]
pub struct IpLinkProbe {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl IpLinkProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

#[async_trait]
impl LinkProbe for IpLinkProbe {
    async fn lookup(&self, name: &str) -> LinkStatus {
        let argv = ["ip", "link", "show", "dev", name].map(str::to_owned);
        match self.runner.run(&argv, self.timeout).await.classify() {
            CommandVerdict::Succeeded => LinkStatus::Present,
            CommandVerdict::NoSuchDevice | CommandVerdict::BenignAbsence => LinkStatus::Absent,
            CommandVerdict::ToolMissing => LinkStatus::Unsupported,
            other => LinkStatus::Error(other.to_string()),
        }
    }
}

/// Confirm the interface exists. Fails open when the host cannot be queried.
///
/// Call only after [`validate_interface_name`] has accepted `name`.
pub async fn verify_interface_exists(probe: &dyn LinkProbe, name: &str) -> Result<(), Rejection> {
    match probe.lookup(name).await {
        LinkStatus::Present => Ok(()),
        LinkStatus::Unsupported => {
            debug!(interface = name, "link table query unavailable; assuming interface exists");
            Ok(())
        }
        LinkStatus::Absent => Err(Rejection::InterfaceMissing(name.to_owned())),
        LinkStatus::Error(detail) => Err(Rejection::InterfaceUnverified {
            name: name.to_owned(),
            detail,
        }),
    }
}

/// Process-level safety lists: what may be targeted and what may never be touched.
#[derive(Debug, Clone)]
pub struct ProcessSafetyPolicy {
    critical: BTreeSet<String>,
    prohibited: BTreeSet<String>,
    self_markers: Vec<String>,
}

impl Default for ProcessSafetyPolicy {
    fn default() -> Self {
        Self {
            critical: CRITICAL_PROCESSES.iter().map(|s| s.to_string()).collect(),
            prohibited: PROHIBITED_TARGETS.iter().map(|s| s.to_string()).collect(),
            self_markers: DEFAULT_SELF_MARKERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProcessSafetyPolicy {
    /// Built-in lists extended with site-specific entries. Entries can only be added.
    pub fn from_config(config: &SafetyConfig) -> Self {
        let mut policy = Self::default();
        let normalize = |s: &String| s.trim().to_lowercase();
        policy.critical.extend(
            config
                .extra_critical_processes
                .iter()
                .map(normalize)
                .filter(|s| !s.is_empty()),
        );
        policy.prohibited.extend(
            config
                .extra_prohibited_targets
                .iter()
                .map(normalize)
                .filter(|s| !s.is_empty()),
        );
        for marker in config.self_markers.iter().map(normalize) {
            if !marker.is_empty() && !policy.self_markers.contains(&marker) {
                policy.self_markers.push(marker);
            }
        }
        policy
    }

    /// Validate a process-kill target and return its normalized (trimmed) form.
    pub fn validate_target_name(&self, name: &str) -> Result<String, Rejection> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(Rejection::EmptyTarget);
        }
        if self.prohibited.contains(&trimmed.to_lowercase()) {
            warn!(target_name = trimmed, "refusing overly broad process target");
            return Err(Rejection::TargetTooBroad(trimmed.to_owned()));
        }
        if trimmed.chars().count() < MIN_TARGET_NAME_LEN {
            return Err(Rejection::TargetTooShort(trimmed.to_owned()));
        }
        Ok(trimmed.to_owned())
    }

    /// True when the name equals, or the command line mentions, a critical process.
    ///
    /// Deliberately conservative: a substring hit anywhere in the command line
    /// protects the process.
    pub fn is_critical_process(&self, name: &str, cmdline: &[String]) -> bool {
        if self.critical.contains(&name.to_lowercase()) {
            return true;
        }
        if cmdline.is_empty() {
            return false;
        }
        let joined = cmdline.join(" ").to_lowercase();
        self.critical.iter().any(|entry| joined.contains(entry.as_str()))
    }

    /// True when a lowercased command line belongs to the agent.
    pub fn is_self_cmdline(&self, cmdline_lower: &str) -> bool {
        self.self_markers
            .iter()
            .any(|marker| cmdline_lower.contains(marker.as_str()))
    }
}
