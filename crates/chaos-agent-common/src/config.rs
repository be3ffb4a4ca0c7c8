//! ---
//! agent_section: "01-core-functionality"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Shared primitives for the chaos agent runtime."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;

const REQUIRED_SECTIONS: [&str; 2] = ["agent", "failures"];

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_state_file() -> PathBuf {
    std::env::temp_dir()
        .join("chaos-agent")
        .join("active-rules.json")
}

fn default_max_memory_tasks() -> usize {
    4
}

fn default_cores() -> usize {
    1
}

fn default_memory_mb() -> u64 {
    100
}

fn default_interface() -> String {
    "eth0".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

/// Structural problems that make a configuration unusable.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("configuration file is empty: {0}")]
    Empty(String),
    #[error("missing required '{0}' section in configuration")]
    MissingSection(&'static str),
    #[error("interval_seconds must be greater than zero")]
    NonPositiveInterval,
    #[error("failure '{kind}' probability {probability} is outside range [0, 1]")]
    ProbabilityOutOfRange { kind: FailureKind, probability: f64 },
    #[error("failure '{0}' must request at least one core")]
    ZeroCores(FailureKind),
}

/// Failure classes the agent knows how to inject.
///
/// The declaration order is the fixed order in which a cycle evaluates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Cpu,
    Memory,
    Process,
    Network,
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Cpu,
        FailureKind::Memory,
        FailureKind::Process,
        FailureKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Cpu => "cpu",
            FailureKind::Memory => "memory",
            FailureKind::Process => "process",
            FailureKind::Network => "network",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary configuration object for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub agent: AgentConfig,
    pub failures: IndexMap<FailureKind, FailureSpec>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl Config {
    pub const ENV_CONFIG_PATH: &'static str = "CHAOS_AGENT_CONFIG";
    pub const DEFAULT_PATH: &'static str = "config.yaml";

    /// Resolve the configuration path, respecting the `CHAOS_AGENT_CONFIG` override.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                return PathBuf::from(env_path);
            }
        }
        cli_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_PATH))
    }

    /// Load and validate a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        if contents.trim().is_empty() {
            return Err(ConfigError::Empty(path.display().to_string()).into());
        }
        contents
            .parse::<Self>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Look up the spec for a failure type.
    pub fn failure(&self, kind: FailureKind) -> Option<&FailureSpec> {
        self.failures.get(&kind)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.interval.is_zero() {
            return Err(ConfigError::NonPositiveInterval);
        }
        for (kind, spec) in &self.failures {
            if !(0.0..=1.0).contains(&spec.probability) {
                return Err(ConfigError::ProbabilityOutOfRange {
                    kind: *kind,
                    probability: spec.probability,
                });
            }
            if *kind == FailureKind::Cpu && spec.cores == 0 {
                return Err(ConfigError::ZeroCores(*kind));
            }
        }
        Ok(())
    }

    /// Non-fatal observations worth surfacing at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let interval = self.agent.interval.as_secs_f64();
        if interval < 1.0 {
            warnings.push(
                "interval_seconds is less than 1 second, which may cause high CPU usage".to_owned(),
            );
        }
        if interval > 300.0 {
            warnings.push(
                "interval_seconds is greater than 5 minutes, chaos may be infrequent".to_owned(),
            );
        }

        for (kind, spec) in &self.failures {
            if spec.enabled && spec.probability == 0.0 {
                warnings.push(format!("failure '{}' is enabled but probability is 0", kind));
            }
            match kind {
                FailureKind::Process if spec.enabled => {
                    let target = spec
                        .target_name
                        .as_deref()
                        .map(str::trim)
                        .unwrap_or_default()
                        .to_lowercase();
                    if target.is_empty() {
                        warnings.push(
                            "process killing is enabled but no target_name specified".to_owned(),
                        );
                    } else if GENERIC_TARGETS.contains(&target.as_str()) {
                        warnings.push(format!(
                            "process target_name '{}' is too generic and dangerous; use a more specific application name",
                            target
                        ));
                    }
                }
                FailureKind::Cpu if spec.enabled => {
                    if let Ok(available) = std::thread::available_parallelism() {
                        if spec.cores > available.get() {
                            warnings.push(format!(
                                "cpu injection requests {} cores but only {} are available",
                                spec.cores, available
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        warnings
    }
}

const GENERIC_TARGETS: [&str; 6] = ["python", "python3", "java", "node", "systemd", "init"];

impl std::str::FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let document: serde_yaml::Value =
            serde_yaml::from_str(input).context("configuration is not valid YAML")?;
        let Some(mapping) = document.as_mapping() else {
            return Err(ConfigError::Empty("<inline>".to_owned()).into());
        };
        for section in REQUIRED_SECTIONS {
            if !mapping.contains_key(section) {
                return Err(ConfigError::MissingSection(section).into());
            }
        }
        let config: Config =
            serde_yaml::from_value(document).context("malformed configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Agent-level settings, immutable after load.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(rename = "interval_seconds", default = "default_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub interval: Duration,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Slack granted to a blocking injector beyond its own duration.
    #[serde(rename = "injection_timeout_seconds")]
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub injection_timeout: Option<Duration>,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_max_memory_tasks")]
    pub max_memory_tasks: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            dry_run: false,
            seed: None,
            injection_timeout: None,
            state_file: default_state_file(),
            max_memory_tasks: default_max_memory_tasks(),
        }
    }
}

/// Raw delay value as written in the configuration.
///
/// Kept untyped until injection time so that non-numeric input is reported
/// as a validation rejection rather than a startup failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelayValue {
    Number(f64),
    Text(String),
}

impl Default for DelayValue {
    fn default() -> Self {
        DelayValue::Number(100.0)
    }
}

impl From<f64> for DelayValue {
    fn from(value: f64) -> Self {
        DelayValue::Number(value)
    }
}

impl fmt::Display for DelayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayValue::Number(value) => write!(f, "{}", value),
            DelayValue::Text(value) => write!(f, "{:?}", value),
        }
    }
}

/// Per failure-type settings. Type-specific fields are ignored by other injectors.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub probability: f64,
    #[serde(rename = "duration_seconds", default)]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub duration: Duration,
    #[serde(default = "default_cores")]
    pub cores: usize,
    #[serde(default = "default_memory_mb")]
    pub mb: u64,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default)]
    pub delay_ms: DelayValue,
}

impl Default for FailureSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.0,
            duration: Duration::ZERO,
            cores: default_cores(),
            mb: default_memory_mb(),
            target_name: None,
            interface: default_interface(),
            delay_ms: DelayValue::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Directory for the daily rolling JSON log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            directory: None,
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Site-specific additions to the built-in process safety lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default)]
    pub extra_critical_processes: Vec<String>,
    #[serde(default)]
    pub extra_prohibited_targets: Vec<String>,
    /// Command-line fragments identifying the agent's own processes.
    #[serde(default)]
    pub self_markers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
agent:
  interval_seconds: 15
  dry_run: true
failures:
  cpu:
    enabled: true
    probability: 0.4
    duration_seconds: 5
    cores: 2
  memory:
    enabled: true
    probability: 0.3
    duration_seconds: 8
    mb: 200
  process:
    enabled: false
    probability: 0.5
    target_name: "test-app"
  network:
    enabled: true
    probability: 0.25
    interface: "eth0"
    delay_ms: 300
    duration_seconds: 10
"#;

    #[test]
    fn parses_all_failure_types() {
        let config = FULL.parse::<Config>().unwrap();
        assert_eq!(config.agent.interval, Duration::from_secs(15));
        assert!(config.agent.dry_run);
        assert_eq!(config.failures.len(), 4);
        assert_eq!(config.failure(FailureKind::Cpu).unwrap().cores, 2);
        assert_eq!(config.failure(FailureKind::Memory).unwrap().mb, 200);
        assert!(!config.failure(FailureKind::Process).unwrap().enabled);
        let network = config.failure(FailureKind::Network).unwrap();
        assert_eq!(network.delay_ms, DelayValue::Number(300.0));
        assert_eq!(network.duration, Duration::from_secs(10));
    }

    #[test]
    fn applies_defaults() {
        let config = "agent: {}\nfailures:\n  memory:\n    enabled: true\n"
            .parse::<Config>()
            .unwrap();
        assert_eq!(config.agent.interval, Duration::from_secs(10));
        assert!(!config.agent.dry_run);
        assert!(config.agent.injection_timeout.is_none());
        let memory = config.failure(FailureKind::Memory).unwrap();
        assert_eq!(memory.mb, 100);
        assert_eq!(memory.interface, "eth0");
        assert_eq!(memory.duration, Duration::ZERO);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.listen.port(), 8000);
    }

    #[test]
    fn rejects_missing_sections() {
        let err = "failures: {}\n".parse::<Config>().unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MissingSection("agent"))
        );
        let err = "agent: {}\n".parse::<Config>().unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MissingSection("failures"))
        );
    }

    #[test]
    fn rejects_unknown_failure_type() {
        let err = "agent: {}\nfailures:\n  disk:\n    enabled: true\n"
            .parse::<Config>()
            .unwrap_err();
        assert!(format!("{:#}", err).contains("malformed configuration"));
    }

    #[test]
    fn rejects_out_of_range_probability() {
        let err = "agent: {}\nfailures:\n  cpu:\n    probability: 1.5\n"
            .parse::<Config>()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::ProbabilityOutOfRange { kind: FailureKind::Cpu, .. })
        ));
    }

    #[test]
    fn rejects_zero_interval_and_negative_duration() {
        let err = "agent:\n  interval_seconds: 0\nfailures: {}\n"
            .parse::<Config>()
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::NonPositiveInterval)
        );
        assert!("agent: {}\nfailures:\n  cpu:\n    duration_seconds: -1\n"
            .parse::<Config>()
            .is_err());
    }

    #[test]
    fn keeps_non_numeric_delay_for_later_validation() {
        let config = "agent: {}\nfailures:\n  network:\n    delay_ms: \"100ms\"\n"
            .parse::<Config>()
            .unwrap();
        assert_eq!(
            config.failure(FailureKind::Network).unwrap().delay_ms,
            DelayValue::Text("100ms".into())
        );
    }

    #[test]
    fn warns_about_risky_settings() {
        let config = r#"
agent:
  interval_seconds: 0.5
failures:
  cpu:
    enabled: true
    probability: 0
  process:
    enabled: true
    probability: 0.5
    target_name: "Python"
"#
        .parse::<Config>()
        .unwrap();
        let warnings = config.warnings();
        assert!(warnings.iter().any(|w| w.contains("less than 1 second")));
        assert!(warnings.iter().any(|w| w.contains("'cpu' is enabled but probability is 0")));
        assert!(warnings.iter().any(|w| w.contains("too generic")));
    }

    #[test]
    fn evaluation_order_is_fixed() {
        assert_eq!(
            FailureKind::ALL.map(|kind| kind.as_str()),
            ["cpu", "memory", "process", "network"]
        );
    }
}
