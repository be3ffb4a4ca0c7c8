//! ---
//! agent_section: "11-verification"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Host test doubles and shared exports."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chaos_agent_core::{CommandOutput, CommandRunner, LinkProbe, LinkStatus};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Rule {
    token: String,
    output: CommandOutput,
    remaining: Option<usize>,
}

/// Records every argument vector and answers from a script.
///
/// Rules match when any argument equals their token; the most recently added
/// matching rule wins. Unmatched commands succeed.
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    calls: Mutex<Vec<Vec<String>>>,
    rules: Mutex<Vec<Rule>>,
    latency: Option<Duration>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer, to emulate a slow tool.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer every command containing `token` with `output`.
    pub fn respond(self, token: &str, output: CommandOutput) -> Self {
        self.push_rule(token, output, None);
        self
    }

    /// Answer the next `times` commands containing `token` with `output`.
    pub fn respond_times(self, token: &str, output: CommandOutput, times: usize) -> Self {
        self.push_rule(token, output, Some(times));
        self
    }

    fn push_rule(&self, token: &str, output: CommandOutput, remaining: Option<usize>) {
        self.rules.lock().push(Rule {
            token: token.to_owned(),
            output,
            remaining,
        });
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Commands that contained `token` as one of their arguments.
    pub fn calls_with(&self, token: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|argv| argv.iter().any(|arg| arg == token))
            .cloned()
            .collect()
    }

    fn answer(&self, argv: &[String]) -> CommandOutput {
        let mut rules = self.rules.lock();
        let matched = rules.iter_mut().rev().find(|rule| {
            rule.remaining != Some(0) && argv.iter().any(|arg| *arg == rule.token)
        });
        match matched {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                rule.output.clone()
            }
            None => CommandOutput::success(),
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> CommandOutput {
        debug!(command = ?argv, "scripted command");
        self.calls.lock().push(argv.to_vec());
        if let Some(latency) = self.latency {
            if latency > timeout {
                tokio::time::sleep(timeout).await;
                return CommandOutput::timed_out();
            }
            tokio::time::sleep(latency).await;
        }
        self.answer(argv)
    }
}

/// Link table with a fixed set of interfaces.
#[derive(Debug)]
pub struct FakeLinkProbe {
    interfaces: Option<BTreeSet<String>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeLinkProbe {
    pub fn with_interfaces(names: &[&str]) -> Self {
        Self {
            interfaces: Some(names.iter().map(|name| name.to_string()).collect()),
            lookups: Mutex::new(Vec::new()),
        }
    }

    /// A host that cannot be queried at all.
    pub fn unsupported() -> Self {
        Self {
            interfaces: None,
            lookups: Mutex::new(Vec::new()),
        }
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl LinkProbe for FakeLinkProbe {
    async fn lookup(&self, name: &str) -> LinkStatus {
        self.lookups.lock().push(name.to_owned());
        match &self.interfaces {
            None => LinkStatus::Unsupported,
            Some(interfaces) if interfaces.contains(name) => LinkStatus::Present,
            Some(_) => LinkStatus::Absent,
        }
    }
}
