//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::hint::black_box;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chaos_agent_common::{FailureKind, FailureSpec};
use chaos_agent_logging::{agent_info, agent_warn};
use chaos_agent_metrics::InjectionMetrics;
use tracing::warn;

use super::Injector;
use crate::context::InjectionContext;
use crate::error::AgentError;
use crate::outcome::{conclude, Dispatch, InjectionOutcome};

/// How long stopped workers get to exit before they are detached.
pub const WORKER_GRACE: Duration = Duration::from_secs(2);

/// Saturates CPU cores with busy-looping worker threads.
#[derive(Debug)]
pub struct CpuInjector {
    metrics: InjectionMetrics,
    grace: Duration,
    live_workers: Arc<AtomicUsize>,
}

impl CpuInjector {
    pub fn new(metrics: InjectionMetrics) -> Self {
        Self {
            metrics,
            grace: WORKER_GRACE,
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Worker threads that have not yet returned.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Injector for CpuInjector {
    fn kind(&self) -> FailureKind {
        FailureKind::Cpu
    }

    async fn inject(&self, spec: &FailureSpec, ctx: &InjectionContext) -> Result<Dispatch, AgentError> {
        let log = ctx.log(FailureKind::Cpu);
        let cores = spec.cores;
        let duration = spec.duration;

        if ctx.dry_run() {
            agent_info!(
                context = log,
                cores,
                duration_s = duration.as_secs_f64(),
                "dry run: would saturate {} core(s)",
                cores
            );
            let outcome = InjectionOutcome::skipped("dry run");
            return Ok(Dispatch::Completed(conclude(&self.metrics, FailureKind::Cpu, ctx, outcome)));
        }

        agent_info!(
            context = log,
            cores,
            duration_s = duration.as_secs_f64(),
            "saturating {} core(s)",
            cores
        );
        let _active = self.metrics.begin(FailureKind::Cpu.as_str());

        let stop = Arc::new(AtomicBool::new(false));
        // Cancellation of this future stops the workers as well.
        let _halt = HaltOnDrop(stop.clone());
        let grace = self.grace;
        let live = self.live_workers.clone();
        let supervised = tokio::task::spawn_blocking(move || {
            WorkerPool::spawn(cores, duration, stop, live, grace).map(WorkerPool::supervise)
        })
        .await?;

        let outcome = match supervised {
            Ok(report) => {
                if report.panicked > 0 || report.detached > 0 {
                    agent_warn!(
                        context = log,
                        panicked = report.panicked,
                        detached = report.detached,
                        "some cpu workers did not finish cleanly"
                    );
                }
                InjectionOutcome::Success
            }
            Err(err) => InjectionOutcome::failed(format!("failed to start cpu workers: {err}")),
        };
        Ok(Dispatch::Completed(conclude(&self.metrics, FailureKind::Cpu, ctx, outcome)))
    }
}

struct HaltOnDrop(Arc<AtomicBool>);

impl Drop for HaltOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SupervisionReport {
    panicked: usize,
    detached: usize,
}

/// Worker threads plus the flag that stops them. Dropping the pool stops every
/// worker, so a failed or interrupted run leaves nothing spinning.
struct WorkerPool {
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    grace: Duration,
    detached: usize,
}

impl WorkerPool {
    fn spawn(
        cores: usize,
        duration: Duration,
        stop: Arc<AtomicBool>,
        live: Arc<AtomicUsize>,
        grace: Duration,
    ) -> io::Result<Self> {
        // An unrepresentable deadline leaves only the stop flag.
        let deadline = Instant::now().checked_add(duration);
        let mut pool = Self {
            stop,
            workers: Vec::with_capacity(cores),
            grace,
            detached: 0,
        };
        for index in 0..cores {
            let stop = pool.stop.clone();
            let worker_live = live.clone();
            live.fetch_add(1, Ordering::SeqCst);
            let spawned = thread::Builder::new()
                .name(format!("cpu-hog-{index}"))
                .spawn(move || {
                    let _live = LiveWorker(worker_live);
                    spin_until(deadline, &stop);
                });
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    live.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        Ok(pool)
    }

    /// Block until every worker reached the deadline, then stop the rest.
    fn supervise(mut self) -> SupervisionReport {
        let mut report = SupervisionReport::default();
        for handle in std::mem::take(&mut self.workers) {
            if handle.join().is_err() {
                report.panicked += 1;
            }
        }
        self.halt();
        report.detached = self.detached;
        report
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.grace;
        for handle in std::mem::take(&mut self.workers) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // Threads cannot be killed; a worker ignoring the flag is left behind.
                warn!(worker = ?handle.thread().name(), "cpu worker did not stop within grace period");
                self.detached += 1;
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.halt();
    }
}

struct LiveWorker(Arc<AtomicUsize>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spin_until(deadline: Option<Instant>, stop: &AtomicBool) {
    let mut state = 0x9E37_79B9_7F4A_7C15_u64;
    while !stop.load(Ordering::Relaxed) && deadline.map_or(true, |deadline| Instant::now() < deadline) {
        for _ in 0..10_000 {
            state = black_box(state.rotate_left(5) ^ state.wrapping_mul(31));
        }
    }
}
