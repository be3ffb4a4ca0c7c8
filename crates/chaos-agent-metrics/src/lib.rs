//! ---
//! agent_section: "03-observability"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Metrics collection and export utilities."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
    TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the agent.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Terminal status label of one injector invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionStatus {
    Success,
    Skipped,
    Failed,
}

impl InjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionStatus::Success => "success",
            InjectionStatus::Skipped => "skipped",
            InjectionStatus::Failed => "failed",
        }
    }
}

/// Metrics recorded by the injection engine.
#[derive(Clone)]
pub struct InjectionMetrics {
    registry: SharedRegistry,
    injections_total: IntCounterVec,
    injection_active: IntGaugeVec,
    cleanup_failures_total: IntCounterVec,
    cycles_total: IntCounter,
}

impl InjectionMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let injections_total = IntCounterVec::new(
            Opts::new(
                "chaos_injections_total",
                "Total number of chaos injections by failure type and status",
            ),
            &["failure_type", "status"],
        )?;
        registry.register(Box::new(injections_total.clone()))?;

        let injection_active = IntGaugeVec::new(
            Opts::new(
                "chaos_injection_active",
                "Injections of this failure type currently in progress",
            ),
            &["failure_type"],
        )?;
        registry.register(Box::new(injection_active.clone()))?;

        let cleanup_failures_total = IntCounterVec::new(
            Opts::new(
                "chaos_cleanup_failures_total",
                "Rollbacks that failed and may have left an injected fault in place",
            ),
            &["failure_type"],
        )?;
        registry.register(Box::new(cleanup_failures_total.clone()))?;

        let cycles_total = IntCounter::with_opts(Opts::new(
            "chaos_cycles_total",
            "Scheduler cycles evaluated since start",
        ))?;
        registry.register(Box::new(cycles_total.clone()))?;

        Ok(Self {
            registry,
            injections_total,
            injection_active,
            cleanup_failures_total,
            cycles_total,
        })
    }

    /// Build metrics against a private registry, for tests and one-off tooling.
    pub fn standalone() -> Result<Self> {
        Self::new(new_registry())
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record(&self, failure_type: &str, status: InjectionStatus) {
        self.injections_total
            .with_label_values(&[failure_type, status.as_str()])
            .inc();
    }

    pub fn count(&self, failure_type: &str, status: InjectionStatus) -> u64 {
        self.injections_total
            .with_label_values(&[failure_type, status.as_str()])
            .get()
    }

    /// Mark an injection as in progress until the returned guard is dropped.
    pub fn begin(&self, failure_type: &str) -> ActiveInjection {
        let gauge = self.injection_active.with_label_values(&[failure_type]);
        gauge.inc();
        ActiveInjection { gauge }
    }

    pub fn active(&self, failure_type: &str) -> i64 {
        self.injection_active
            .with_label_values(&[failure_type])
            .get()
    }

    pub fn record_cleanup_failure(&self, failure_type: &str) {
        self.cleanup_failures_total
            .with_label_values(&[failure_type])
            .inc();
    }

    pub fn cleanup_failures(&self, failure_type: &str) -> u64 {
        self.cleanup_failures_total
            .with_label_values(&[failure_type])
            .get()
    }

    pub fn inc_cycle(&self) {
        self.cycles_total.inc();
    }

    pub fn cycles(&self) -> u64 {
        self.cycles_total.get()
    }
}

impl std::fmt::Debug for InjectionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionMetrics").finish_non_exhaustive()
    }
}

/// In-progress marker for one injection; lowers the gauge on every exit path.
#[derive(Debug)]
pub struct ActiveInjection {
    gauge: IntGauge,
}

impl Drop for ActiveInjection {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn counters_are_keyed_by_type_and_status() {
        let metrics = InjectionMetrics::standalone().unwrap();
        metrics.record("cpu", InjectionStatus::Success);
        metrics.record("cpu", InjectionStatus::Success);
        metrics.record("cpu", InjectionStatus::Failed);
        assert_eq!(metrics.count("cpu", InjectionStatus::Success), 2);
        assert_eq!(metrics.count("cpu", InjectionStatus::Failed), 1);
        assert_eq!(metrics.count("memory", InjectionStatus::Success), 0);
    }

    #[test]
    fn active_guard_resets_gauge_on_drop() {
        let metrics = InjectionMetrics::standalone().unwrap();
        {
            let _outer = metrics.begin("memory");
            let _inner = metrics.begin("memory");
            assert_eq!(metrics.active("memory"), 2);
        }
        assert_eq!(metrics.active("memory"), 0);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = metrics.begin("cpu");
            panic!("injector blew up");
        }));
        assert!(result.is_err());
        assert_eq!(metrics.active("cpu"), 0);
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = new_registry();
        InjectionMetrics::new(registry.clone()).unwrap();
        assert!(InjectionMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_metrics() {
        let metrics = InjectionMetrics::standalone().unwrap();
        metrics.record("network", InjectionStatus::Skipped);
        metrics.inc_cycle();
        let server =
            spawn_http_server(metrics.registry(), "127.0.0.1:0".parse().unwrap()).unwrap();

        let mut stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.to_lowercase().contains("content-type: text/plain; version=0.0.4"));
        assert!(body.contains(r#"chaos_injections_total{failure_type="network",status="skipped"} 1"#));
        assert!(body.contains("chaos_cycles_total 1"));

        server.shutdown().await.unwrap();
    }
}
