//! ---
//! agent_section: "01-core-functionality"
//! agent_subsection: "binary"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Binary entrypoint for the chaos agent daemon."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use chaos_agent_common::{init_tracing, AgentConfig, Config, LoggingConfig};
use chaos_agent_core::{
    configured_interface, ActiveResourceSet, AgentRuntime, CleanupSummary, CommandRunner,
    HostBindings, LifecycleManager, SystemCommandRunner,
};
use chaos_agent_metrics::{new_registry, spawn_http_server, InjectionMetrics};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "chaos-agentd";

#[derive(Debug, Parser)]
#[command(author, version, about = "Controlled fault-injection agent", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Log intended injections without touching the host")]
    dry_run: bool,

    #[arg(long, help = "Run a single cycle, then shut down cleanly")]
    once: bool,

    #[arg(long, value_name = "ADDR", help = "Override metrics.listen")]
    metrics_listen: Option<SocketAddr>,

    #[arg(long, value_name = "FILE", help = "Override agent.state_file")]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the injection scheduler")]
    Run,
    #[command(about = "Load the configuration, print warnings and exit")]
    Validate,
    #[command(about = "Remove injected latency and exit")]
    Cleanup {
        #[arg(long, value_name = "NAME", help = "Interface to clean in addition to the rule journal")]
        interface: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config.as_deref());

    let mut config = match Config::from_path(&config_path) {
        Ok(config) => config,
        Err(err) => {
            init_tracing(SERVICE_NAME, &LoggingConfig::default())?;
            error!(config_path = %config_path.display(), error = %format!("{err:#}"), "configuration rejected");
            if matches!(cli.command, None | Some(Commands::Run)) {
                let state_file = cli
                    .state_file
                    .clone()
                    .unwrap_or_else(|| AgentConfig::default().state_file);
                recover_after_fatal(&state_file).await;
            }
            return Err(err);
        }
    };
    apply_overrides(&mut config, &cli);
    init_tracing(SERVICE_NAME, &config.logging)?;
    info!(config_path = %config_path.display(), dry_run = config.agent.dry_run, "configuration loaded");
    for warning in config.warnings() {
        warn!(warning = %warning, "configuration warning");
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_agent(config, cli.once).await,
        Commands::Validate => {
            let warnings = config.warnings();
            println!("{}: ok ({} warning(s))", config_path.display(), warnings.len());
            for warning in warnings {
                println!("  warning: {warning}");
            }
            Ok(())
        }
        Commands::Cleanup { interface } => {
            let lifecycle = standalone_lifecycle(&config.agent.state_file);
            let summary = lifecycle.recover(interface.as_deref()).await;
            report_cleanup(&summary)
        }
    }
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if cli.dry_run {
        config.agent.dry_run = true;
    }
    if let Some(listen) = cli.metrics_listen {
        config.metrics.listen = listen;
    }
    if let Some(state_file) = &cli.state_file {
        config.agent.state_file = state_file.clone();
    }
}

async fn run_agent(config: Config, once: bool) -> Result<()> {
    let registry = new_registry();
    let metrics = InjectionMetrics::new(registry.clone())?;
    let host = HostBindings::system(&config, metrics);
    let tasks = host.tasks.clone();
    let AgentRuntime {
        mut scheduler,
        lifecycle,
    } = AgentRuntime::new(&config, host);

    // Registered before recovery so a signal arriving early still reaches us.
    let mut shutdown = ShutdownSignals::install();
    let recovered = lifecycle.recover(configured_interface(&config)).await;
    if !recovered.is_clean() {
        warn!(failed = recovered.failed.len(), "startup recovery incomplete; continuing");
    }

    let metrics_server = if config.metrics.enabled {
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    if once {
        tokio::select! {
            _ = shutdown.recv() => info!("termination signal received during cycle"),
            report = scheduler.run_cycle() => {
                info!(cycle = report.cycle, correlation_id = %report.correlation_id, "single cycle finished");
                tokio::select! {
                    _ = shutdown.recv() => {},
                    _ = tasks.drain() => {},
                }
            }
        }
    } else {
        info!("agent running; waiting for termination signal");
        scheduler.run_until(shutdown.recv()).await;
    }

    info!("shutting down");
    let summary = lifecycle.shutdown().await;
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    if !summary.is_clean() {
        error!(failed = summary.failed.len(), "host may still carry injected latency");
    }
    Ok(())
}

fn standalone_lifecycle(state_file: &Path) -> LifecycleManager {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
    LifecycleManager::new(Arc::new(ActiveResourceSet::open(state_file)), runner)
}

/// Best effort: a previous run may have left rules behind even though this one cannot start.
async fn recover_after_fatal(state_file: &Path) {
    let summary = standalone_lifecycle(state_file).recover(None).await;
    if !summary.cleaned.is_empty() || !summary.failed.is_empty() {
        warn!(
            cleaned = summary.cleaned.len(),
            failed = summary.failed.len(),
            "recovered rules left by a previous run"
        );
    }
}

fn report_cleanup(summary: &CleanupSummary) -> Result<()> {
    for interface in &summary.cleaned {
        println!("cleaned {interface}");
    }
    for (interface, err) in &summary.failed {
        println!("failed {interface}: {err}");
    }
    if summary.cleaned.is_empty() && summary.failed.is_empty() {
        println!("nothing to clean");
    }
    if !summary.is_clean() {
        bail!("{} interface(s) could not be cleaned", summary.failed.len());
    }
    Ok(())
}

/// SIGINT and SIGTERM streams, registered at construction rather than on first poll.
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: Option<signal::unix::Signal>,
    #[cfg(unix)]
    terminate: Option<signal::unix::Signal>,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn install() -> Self {
        use tokio::signal::unix::SignalKind;

        Self {
            interrupt: register(SignalKind::interrupt(), "SIGINT"),
            terminate: register(SignalKind::terminate(), "SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    fn install() -> Self {
        Self {}
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = wait_for(&mut self.interrupt) => info!("SIGINT received"),
                _ = wait_for(&mut self.terminate) => info!("SIGTERM received"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(err) = signal::ctrl_c().await {
                warn!(?err, "failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(unix)]
fn register(kind: signal::unix::SignalKind, name: &str) -> Option<signal::unix::Signal> {
    match signal::unix::signal(kind) {
        Ok(stream) => Some(stream),
        Err(err) => {
            warn!(?err, "failed to install {name} handler");
            None
        }
    }
}

/// Resolves on delivery; a handler that failed to install never fires.
#[cfg(unix)]
async fn wait_for(stream: &mut Option<signal::unix::Signal>) {
    match stream {
        Some(stream) => {
            stream.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}
