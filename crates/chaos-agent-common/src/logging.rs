//! ---
//! agent_section: "01-core-functionality"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Shared primitives for the chaos agent runtime."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "CHAOS_AGENT_LOG";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `CHAOS_AGENT_LOG` overrides the log filter (e.g. `info`, `debug,chaos_agent_core=trace`).
///   When unset the standard `RUST_LOG` variable is honoured, finally falling back to
///   the configured `logging.level`.
/// * Events go to stdout; when `logging.directory` is set a daily rolling JSON file is
///   written as well.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = STDOUT_GUARD.set(stdout_guard);

    let filter = build_filter(&config.level);

    let fmt_layer = match config.format {
        LogFormat::Json => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let prefix = config
                .file_prefix
                .clone()
                .unwrap_or_else(|| service_name.to_owned());
            let (file_writer, file_guard) =
                tracing_appender::non_blocking(daily(directory, format!("{}.log", prefix)));
            let _ = FILE_GUARD.set(file_guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(file_writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_dir = ?config.directory,
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}

fn build_filter(configured_level: &str) -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_ENV) {
        match EnvFilter::try_new(&directive) {
            Ok(filter) => return filter,
            Err(err) => eprintln!(
                "invalid {} directive ({}); falling back to configured level",
                LOG_ENV, err
            ),
        }
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(configured_level).unwrap_or_else(|err| {
            eprintln!(
                "invalid log level '{}' ({}); defaulting to info",
                configured_level, err
            );
            EnvFilter::new("info")
        })
    })
}
