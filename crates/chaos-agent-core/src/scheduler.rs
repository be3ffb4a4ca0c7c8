//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
//! Periodic, probabilistic selection of failures to inject.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chaos_agent_common::{AgentConfig, Config, FailureKind, FailureSpec};
use chaos_agent_logging::{agent_debug, agent_error, agent_info, LogContext};
use chaos_agent_metrics::{InjectionMetrics, InjectionStatus};
use futures::FutureExt;
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::context::InjectionContext;
use crate::error::AgentError;
use crate::injectors::InjectorSet;
use crate::lifecycle::LifecycleManager;
use crate::outcome::Dispatch;

/// What happened to one failure type within a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleEntry {
    /// The probability roll did not select this failure type.
    NotSelected { roll: f64, probability: f64 },
    Dispatched(Dispatch),
    /// The injector reported an error or panicked; counted as failed.
    Errored(String),
    /// The watchdog abandoned the call after this long.
    TimedOut(Duration),
}

/// Per-cycle record, mostly for tests and `--once` runs.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub correlation_id: String,
    pub entries: Vec<(FailureKind, CycleEntry)>,
}

impl CycleReport {
    pub fn entry(&self, kind: FailureKind) -> Option<&CycleEntry> {
        self.entries
            .iter()
            .find(|(entry_kind, _)| *entry_kind == kind)
            .map(|(_, entry)| entry)
    }
}

/// Drives cycles: for each enabled failure type in fixed order, roll and maybe inject.
#[derive(Debug)]
pub struct Scheduler {
    agent: AgentConfig,
    failures: IndexMap<FailureKind, FailureSpec>,
    injectors: InjectorSet,
    metrics: InjectionMetrics,
    lifecycle: Option<Arc<LifecycleManager>>,
    rng: StdRng,
    cycle: u64,
}

impl Scheduler {
    pub fn new(config: &Config, injectors: InjectorSet, metrics: InjectionMetrics) -> Self {
        let rng = match config.agent.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            agent: config.agent.clone(),
            failures: config.failures.clone(),
            injectors,
            metrics,
            lifecycle: None,
            rng,
            cycle: 0,
        }
    }

    /// Restore the host through `lifecycle` when the watchdog abandons a network injection.
    pub fn with_lifecycle(mut self, lifecycle: Arc<LifecycleManager>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycle
    }

    /// Evaluate every enabled failure type once. Never fails.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let ctx = InjectionContext::new(self.cycle, self.agent.dry_run);
        agent_info!(
            context = LogContext::new()
                .with_correlation_id(ctx.correlation_id())
                .with_cycle(ctx.cycle())
                .with_dry_run(ctx.dry_run()),
            "cycle started"
        );

        let mut entries = Vec::new();
        for kind in FailureKind::ALL {
            let Some(spec) = self.failures.get(&kind) else {
                continue;
            };
            if !spec.enabled {
                continue;
            }
            let roll: f64 = self.rng.gen();
            if roll > spec.probability {
                agent_debug!(context = ctx.log(kind), roll, probability = spec.probability, "not selected this cycle");
                entries.push((
                    kind,
                    CycleEntry::NotSelected {
                        roll,
                        probability: spec.probability,
                    },
                ));
                continue;
            }
            let entry = self.dispatch(kind, spec, &ctx).await;
            entries.push((kind, entry));
        }

        self.metrics.inc_cycle();
        CycleReport {
            cycle: self.cycle,
            correlation_id: ctx.correlation_id().to_owned(),
            entries,
        }
    }

    async fn dispatch(&self, kind: FailureKind, spec: &FailureSpec, ctx: &InjectionContext) -> CycleEntry {
        let log = ctx.log(kind);
        let Some(injector) = self.injectors.get(kind) else {
            let err = AgentError::MissingInjector(kind);
            agent_error!(context = log, error = %err, "cannot inject");
            self.metrics.record(kind.as_str(), InjectionStatus::Failed);
            return CycleEntry::Errored(err.to_string());
        };

        let call = AssertUnwindSafe(injector.inject(spec, ctx)).catch_unwind();
        let result = match self.watchdog(kind, spec) {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    agent_error!(context = log, limit_s = limit.as_secs_f64(), "injection exceeded its time limit; abandoned");
                    self.metrics.record(kind.as_str(), InjectionStatus::Failed);
                    if kind == FailureKind::Network {
                        if let Some(lifecycle) = &self.lifecycle {
                            lifecycle.cleanup_all().await;
                        }
                    }
                    return CycleEntry::TimedOut(limit);
                }
            },
            None => call.await,
        };

        let err = match result {
            Ok(Ok(dispatch)) => return CycleEntry::Dispatched(dispatch),
            Ok(Err(err)) => err,
            Err(panic) => AgentError::Panicked {
                kind,
                message: panic_message(panic.as_ref()),
            },
        };
        agent_error!(context = log, error = %err, "injector error; continuing with next failure type");
        self.metrics.record(kind.as_str(), InjectionStatus::Failed);
        CycleEntry::Errored(err.to_string())
    }

    /// Upper bound for a blocking injector; detached memory injections are not bounded.
    fn watchdog(&self, kind: FailureKind, spec: &FailureSpec) -> Option<Duration> {
        if kind == FailureKind::Memory {
            return None;
        }
        self.agent.injection_timeout.map(|slack| spec.duration.saturating_add(slack))
    }

    /// Run cycles separated by the configured interval until `shutdown` resolves.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let interval = self.agent.interval;
        info!(
            interval_s = interval.as_secs_f64(),
            dry_run = self.agent.dry_run,
            "scheduler started"
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                report = self.run_cycle() => {
                    let dispatched = report
                        .entries
                        .iter()
                        .filter(|(_, entry)| !matches!(entry, CycleEntry::NotSelected { .. }))
                        .count();
                    agent_debug!(cycle = report.cycle, dispatched, "cycle finished");
                }
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!(cycles = self.cycle, "scheduler stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injectors::Injector;
    use crate::outcome::InjectionOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Behaviour {
        Succeed,
        Error,
        Panic,
        Hang,
    }

    #[derive(Debug)]
    struct Stub {
        kind: FailureKind,
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Injector for Stub {
        fn kind(&self) -> FailureKind {
            self.kind
        }

        async fn inject(&self, _spec: &FailureSpec, _ctx: &InjectionContext) -> Result<Dispatch, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(Dispatch::Completed(InjectionOutcome::Success)),
                Behaviour::Error => Err(AgentError::ProcessTable("table exploded".into())),
                Behaviour::Panic => panic!("injector bug"),
                Behaviour::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn stub(kind: FailureKind, behaviour: Behaviour) -> (Arc<dyn Injector>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Stub {
                kind,
                behaviour,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn config(yaml: &str) -> Config {
        yaml.parse().unwrap()
    }

    #[tokio::test]
    async fn probability_extremes_are_respected() {
        let config = config(
            "agent:\n  seed: 7\nfailures:\n  cpu:\n    enabled: true\n    probability: 1.0\n  memory:\n    enabled: true\n    probability: 0.0\n  process:\n    enabled: false\n    probability: 1.0\n",
        );
        let (cpu, cpu_calls) = stub(FailureKind::Cpu, Behaviour::Succeed);
        let (memory, memory_calls) = stub(FailureKind::Memory, Behaviour::Succeed);
        let (process, process_calls) = stub(FailureKind::Process, Behaviour::Succeed);
        let metrics = InjectionMetrics::standalone().unwrap();
        let injectors = InjectorSet::new().with(cpu).with(memory).with(process);
        let mut scheduler = Scheduler::new(&config, injectors, metrics.clone());

        for _ in 0..50 {
            scheduler.run_cycle().await;
        }
        assert_eq!(cpu_calls.load(Ordering::SeqCst), 50);
        assert_eq!(memory_calls.load(Ordering::SeqCst), 0);
        assert_eq!(process_calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.cycles(), 50);
        assert_eq!(scheduler.cycles_completed(), 50);
    }

    #[tokio::test]
    async fn seeded_rolls_are_reproducible() {
        let yaml = "agent:\n  seed: 42\nfailures:\n  cpu:\n    enabled: true\n    probability: 0.5\n";
        let mut picks = Vec::new();
        for _ in 0..2 {
            let (cpu, _) = stub(FailureKind::Cpu, Behaviour::Succeed);
            let mut scheduler = Scheduler::new(
                &config(yaml),
                InjectorSet::new().with(cpu),
                InjectionMetrics::standalone().unwrap(),
            );
            let mut run = Vec::new();
            for _ in 0..20 {
                let report = scheduler.run_cycle().await;
                run.push(matches!(report.entry(FailureKind::Cpu), Some(CycleEntry::Dispatched(_))));
            }
            picks.push(run);
        }
        assert_eq!(picks[0], picks[1]);
    }

    #[tokio::test]
    async fn failing_injectors_do_not_stop_the_cycle() {
        let config = config(
            "agent: {}\nfailures:\n  cpu:\n    enabled: true\n    probability: 1.0\n  memory:\n    enabled: true\n    probability: 1.0\n  process:\n    enabled: true\n    probability: 1.0\n  network:\n    enabled: true\n    probability: 1.0\n",
        );
        let (cpu, _) = stub(FailureKind::Cpu, Behaviour::Error);
        let (memory, _) = stub(FailureKind::Memory, Behaviour::Panic);
        let (network, network_calls) = stub(FailureKind::Network, Behaviour::Succeed);
        let metrics = InjectionMetrics::standalone().unwrap();
        let mut scheduler = Scheduler::new(
            &config,
            InjectorSet::new().with(cpu).with(memory).with(network),
            metrics.clone(),
        );

        let report = scheduler.run_cycle().await;
        let order: Vec<_> = report.entries.iter().map(|(kind, _)| *kind).collect();
        assert_eq!(order, FailureKind::ALL.to_vec());
        assert!(matches!(report.entry(FailureKind::Cpu), Some(CycleEntry::Errored(msg)) if msg.contains("table exploded")));
        assert!(matches!(report.entry(FailureKind::Memory), Some(CycleEntry::Errored(msg)) if msg.contains("injector bug")));
        assert!(matches!(report.entry(FailureKind::Process), Some(CycleEntry::Errored(msg)) if msg.contains("no injector")));
        assert_eq!(network_calls.load(Ordering::SeqCst), 1);
        for kind in ["cpu", "memory", "process"] {
            assert_eq!(metrics.count(kind, InjectionStatus::Failed), 1, "{kind}");
        }

        scheduler.run_cycle().await;
        assert_eq!(network_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn watchdog_abandons_hung_injectors() {
        let config = config(
            "agent:\n  injection_timeout_seconds: 0.1\nfailures:\n  cpu:\n    enabled: true\n    probability: 1.0\n    duration_seconds: 0.1\n",
        );
        let (cpu, _) = stub(FailureKind::Cpu, Behaviour::Hang);
        let metrics = InjectionMetrics::standalone().unwrap();
        let mut scheduler = Scheduler::new(&config, InjectorSet::new().with(cpu), metrics.clone());

        let report = tokio::time::timeout(Duration::from_secs(5), scheduler.run_cycle())
            .await
            .unwrap();
        assert!(matches!(
            report.entry(FailureKind::Cpu),
            Some(CycleEntry::TimedOut(limit)) if *limit < Duration::from_secs(1)
        ));
        assert_eq!(metrics.count("cpu", InjectionStatus::Failed), 1);
    }

    #[tokio::test]
    async fn oversized_watchdog_limit_saturates() {
        let config = config(
            "agent:\n  injection_timeout_seconds: 1.0e19\nfailures:\n  cpu:\n    enabled: true\n    probability: 1.0\n    duration_seconds: 1.0e19\n",
        );
        let (cpu, calls) = stub(FailureKind::Cpu, Behaviour::Succeed);
        let metrics = InjectionMetrics::standalone().unwrap();
        let mut scheduler = Scheduler::new(&config, InjectorSet::new().with(cpu), metrics.clone());

        assert_eq!(
            scheduler.watchdog(FailureKind::Cpu, config.failure(FailureKind::Cpu).unwrap()),
            Some(Duration::MAX)
        );
        let report = scheduler.run_cycle().await;
        assert!(matches!(report.entry(FailureKind::Cpu), Some(CycleEntry::Dispatched(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_until_stops_on_shutdown() {
        let config = config(
            "agent:\n  interval_seconds: 0.05\nfailures:\n  cpu:\n    enabled: true\n    probability: 1.0\n",
        );
        let (cpu, calls) = stub(FailureKind::Cpu, Behaviour::Succeed);
        let mut scheduler = Scheduler::new(
            &config,
            InjectorSet::new().with(cpu),
            InjectionMetrics::standalone().unwrap(),
        );
        scheduler
            .run_until(tokio::time::sleep(Duration::from_millis(300)))
            .await;
        let cycles = calls.load(Ordering::SeqCst);
        assert!(cycles >= 2, "only {cycles} cycles ran");
        assert_eq!(scheduler.cycles_completed() as usize, cycles);
    }
}
