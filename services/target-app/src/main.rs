//! Chaos target application
//!
//! A small HTTP service to point the agent at: it burns nothing by itself, but
//! its latency and availability make injected CPU, memory, process and network
//! faults visible from the outside.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

/// Default bind address for the target service.
const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const HEARTBEAT: Duration = Duration::from_secs(1);
const MAX_POLL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    started: Instant,
    heartbeat: watch::Receiver<u64>,
}

#[derive(Serialize)]
struct Greeting {
    service: &'static str,
    uptime_ms: u128,
}

#[derive(Debug, Deserialize)]
struct PollParams {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct PollResult {
    beat: u64,
    timed_out: bool,
    waited_ms: u128,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let addr: SocketAddr = std::env::var("CHAOS_TARGET_BIND")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()?;

    let (beat_tx, beat_rx) = watch::channel(0u64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT);
        let mut beat = 0u64;
        loop {
            ticker.tick().await;
            beat += 1;
            if beat_tx.send(beat).is_err() {
                break;
            }
        }
    });

    info!(%addr, "starting chaos target");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(beat_rx).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("chaos target stopped");
    Ok(())
}

fn router(heartbeat: watch::Receiver<u64>) -> Router {
    let state = AppState {
        started: Instant::now(),
        heartbeat,
    };
    Router::new()
        .route("/", get(greet))
        .route("/poll", get(poll))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn greet(State(state): State<AppState>) -> Json<Greeting> {
    Json(Greeting {
        service: "chaos-target",
        uptime_ms: state.started.elapsed().as_millis(),
    })
}

/// Resolve on the next heartbeat, or after `timeout_ms` (capped) without one.
async fn poll(State(state): State<AppState>, Query(params): Query<PollParams>) -> Json<PollResult> {
    let limit = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(MAX_POLL)
        .min(MAX_POLL);
    let mut heartbeat = state.heartbeat.clone();
    heartbeat.mark_unchanged();
    let started = Instant::now();
    let timed_out = !matches!(
        tokio::time::timeout(limit, heartbeat.changed()).await,
        Ok(Ok(()))
    );
    let beat = *heartbeat.borrow();
    Json(PollResult {
        beat,
        timed_out,
        waited_ms: started.elapsed().as_millis(),
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => warn!(?err, "failed to install SIGTERM handler"),
    }
}
