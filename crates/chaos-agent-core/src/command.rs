//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
//! Bounded execution of external tools with argument vectors only.

use std::fmt;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Stderr fragments meaning "there was nothing to remove".
const BENIGN_ABSENCE_PATTERNS: [&str; 3] = [
    "no such file or directory",
    "cannot delete qdisc with handle of zero",
    "cannot find specified qdisc",
];

const TOOL_MISSING_PATTERNS: [&str; 2] = ["command not found", ": not found"];
const PERMISSION_PATTERNS: [&str; 2] = ["operation not permitted", "permission denied"];
const NO_DEVICE_PATTERNS: [&str; 3] = ["cannot find device", "no such device", "does not exist"];

/// How an external command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Exited(i32),
    /// Terminated by a signal before reporting an exit code.
    Signalled,
    TimedOut,
    /// The executable could not be located.
    NotFound,
    SpawnFailed(String),
}

/// Captured result of one external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self::exited(0, "")
    }

    pub fn exited(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Exited(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn timed_out() -> Self {
        Self::from_status(CommandStatus::TimedOut)
    }

    pub fn not_found() -> Self {
        Self::from_status(CommandStatus::NotFound)
    }

    fn from_status(status: CommandStatus) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Exited(0)
    }

    /// Map the raw result onto the categories callers act on.
    ///
    /// This is the single place stderr text is interpreted.
    pub fn classify(&self) -> CommandVerdict {
        match &self.status {
            CommandStatus::Exited(0) => return CommandVerdict::Succeeded,
            CommandStatus::NotFound => return CommandVerdict::ToolMissing,
            CommandStatus::TimedOut => return CommandVerdict::TimedOut,
            CommandStatus::SpawnFailed(reason) => return CommandVerdict::Failed(reason.clone()),
            CommandStatus::Exited(_) | CommandStatus::Signalled => {}
        }

        let stderr = self.stderr.to_lowercase();
        let matches_any = |patterns: &[&str]| patterns.iter().any(|p| stderr.contains(p));
        if matches_any(&TOOL_MISSING_PATTERNS) {
            CommandVerdict::ToolMissing
        } else if matches_any(&BENIGN_ABSENCE_PATTERNS) {
            CommandVerdict::BenignAbsence
        } else if matches_any(&PERMISSION_PATTERNS) {
            CommandVerdict::PermissionDenied
        } else if matches_any(&NO_DEVICE_PATTERNS) {
            CommandVerdict::NoSuchDevice
        } else {
            let detail = self.stderr.trim();
            CommandVerdict::Failed(if detail.is_empty() {
                format!("command ended with {:?}", self.status)
            } else {
                detail.to_owned()
            })
        }
    }
}

/// Interpreted outcome of an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Succeeded,
    /// The object to remove was already absent.
    BenignAbsence,
    NoSuchDevice,
    PermissionDenied,
    ToolMissing,
    TimedOut,
    Failed(String),
}

impl fmt::Display for CommandVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandVerdict::Succeeded => f.write_str("succeeded"),
            CommandVerdict::BenignAbsence => f.write_str("nothing to remove"),
            CommandVerdict::NoSuchDevice => f.write_str("device does not exist"),
            CommandVerdict::PermissionDenied => {
                f.write_str("permission denied - NET_ADMIN capability required")
            }
            CommandVerdict::ToolMissing => f.write_str("command not found - install iproute2"),
            CommandVerdict::TimedOut => f.write_str("command timed out"),
            CommandVerdict::Failed(detail) => write!(f, "{}", detail),
        }
    }
}

/// Runs external commands. Implementations never pass arguments through a shell.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    async fn run(&self, argv: &[String], timeout: Duration) -> CommandOutput;
}

/// [`CommandRunner`] backed by real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> CommandOutput {
        let Some((program, args)) = argv.split_first() else {
            return CommandOutput::from_status(CommandStatus::SpawnFailed(
                "empty argument vector".to_owned(),
            ));
        };
        debug!(command = ?argv, timeout_ms = timeout.as_millis() as u64, "running command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) if err.kind() == ErrorKind::NotFound => return CommandOutput::not_found(),
            Err(err) => {
                return CommandOutput::from_status(CommandStatus::SpawnFailed(err.to_string()))
            }
        };

        // Dropping the pending future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandOutput {
                status: output
                    .status
                    .code()
                    .map_or(CommandStatus::Signalled, CommandStatus::Exited),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(err)) => CommandOutput::from_status(CommandStatus::SpawnFailed(err.to_string())),
            Err(_) => CommandOutput::timed_out(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_zero_wins_over_stderr_noise() {
        let output = CommandOutput::exited(0, "Warning: something odd");
        assert_eq!(output.classify(), CommandVerdict::Succeeded);
    }

    #[test]
    fn absent_qdisc_is_benign() {
        for stderr in [
            "RTNETLINK answers: No such file or directory",
            "Error: Cannot delete qdisc with handle of zero.",
        ] {
            assert_eq!(
                CommandOutput::exited(2, stderr).classify(),
                CommandVerdict::BenignAbsence,
                "{stderr}"
            );
        }
    }

    #[test]
    fn critical_failures_are_distinguished() {
        assert_eq!(
            CommandOutput::exited(1, "Cannot find device \"eth9\"").classify(),
            CommandVerdict::NoSuchDevice
        );
        assert_eq!(
            CommandOutput::exited(2, "RTNETLINK answers: Operation not permitted").classify(),
            CommandVerdict::PermissionDenied
        );
        assert_eq!(
            CommandOutput::exited(127, "sh: 1: tc: not found").classify(),
            CommandVerdict::ToolMissing
        );
        assert_eq!(CommandOutput::not_found().classify(), CommandVerdict::ToolMissing);
        assert_eq!(CommandOutput::timed_out().classify(), CommandVerdict::TimedOut);
        assert_eq!(
            CommandOutput::exited(1, "  weird failure \n").classify(),
            CommandVerdict::Failed("weird failure".into())
        );
    }

    #[tokio::test]
    async fn missing_executable_is_reported_not_raised() {
        let argv = vec!["definitely-not-a-real-binary-7d1f".to_owned()];
        let output = SystemCommandRunner.run(&argv, Duration::from_secs(5)).await;
        assert_eq!(output.status, CommandStatus::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let argv = vec!["sleep".to_owned(), "5".to_owned()];
        let output = SystemCommandRunner
            .run(&argv, Duration::from_millis(100))
            .await;
        assert_eq!(output.status, CommandStatus::TimedOut);
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let output = SystemCommandRunner.run(&[], Duration::from_secs(1)).await;
        assert!(matches!(output.status, CommandStatus::SpawnFailed(_)));
    }
}
