//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "tests"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Scheduler cycles wired to the built-in injectors."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use chaos_agent_common::{Config, FailureKind};
use chaos_agent_core::{
    ActiveResourceSet, AgentRuntime, CycleEntry, Dispatch, HostBindings, InjectionOutcome,
    InjectorSet, ProcessInfo, ProcessSafetyPolicy, Scheduler, TaskRegistry,
};
use chaos_agent_metrics::{InjectionMetrics, InjectionStatus};
use chaos_agent_testharness::{FakeLinkProbe, FakeProcessTable, ScriptedCommandRunner};

struct Host {
    bindings: HostBindings,
    runner: Arc<ScriptedCommandRunner>,
    processes: Arc<FakeProcessTable>,
}

fn host(config: &Config, runner: ScriptedCommandRunner) -> Host {
    let runner = Arc::new(runner);
    let processes = Arc::new(
        FakeProcessTable::new(500, Some(1))
            .with_process(ProcessInfo::new(1, None, "systemd", &["/sbin/init"]))
            .with_process(ProcessInfo::new(500, Some(1), "chaos-agentd", &["chaos-agentd"]))
            .with_process(ProcessInfo::new(800, Some(1), "test-app", &["test-app"])),
    );
    let bindings = HostBindings {
        metrics: InjectionMetrics::standalone().unwrap(),
        runner: runner.clone(),
        probe: Arc::new(FakeLinkProbe::with_interfaces(&["eth0"])),
        processes: processes.clone(),
        policy: Arc::new(ProcessSafetyPolicy::from_config(&config.safety)),
        active: Arc::new(ActiveResourceSet::new()),
        tasks: Arc::new(TaskRegistry::new(config.agent.max_memory_tasks)),
        command_timeout: Duration::from_secs(1),
    };
    Host {
        bindings,
        runner,
        processes,
    }
}

fn scheduler(config: &Config, host: &Host) -> Scheduler {
    Scheduler::new(
        config,
        InjectorSet::standard(&host.bindings),
        host.bindings.metrics.clone(),
    )
}

async fn wait_for(metrics: &InjectionMetrics, kind: &str, status: InjectionStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while metrics.count(kind, status) == 0 {
        assert!(Instant::now() < deadline, "{kind} never reached {status:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cpu_only_cycle_records_one_success() {
    let config: Config = r#"
agent:
  interval_seconds: 1
  seed: 7
failures:
  cpu: { enabled: true, probability: 1.0, duration_seconds: 1, cores: 1 }
  memory: { enabled: false }
  process: { enabled: false }
  network: { enabled: false }
"#
    .parse()
    .unwrap();
    let host = host(&config, ScriptedCommandRunner::new());
    let mut scheduler = scheduler(&config, &host);
    let metrics = &host.bindings.metrics;

    let started = Instant::now();
    let report = scheduler.run_cycle().await;
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(report.entries.len(), 1);
    assert_eq!(
        report.entry(FailureKind::Cpu),
        Some(&CycleEntry::Dispatched(Dispatch::Completed(InjectionOutcome::Success)))
    );
    assert_eq!(metrics.count("cpu", InjectionStatus::Success), 1);
    assert_eq!(metrics.active("cpu"), 0);
    assert_eq!(metrics.cycles(), 1);
    assert_eq!(host.runner.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_pressure_does_not_block_the_cycle() {
    let config: Config = r#"
agent:
  interval_seconds: 1
failures:
  memory: { enabled: true, probability: 1.0, duration_seconds: 0.3, mb: 2 }
"#
    .parse()
    .unwrap();
    let host = host(&config, ScriptedCommandRunner::new());
    let mut scheduler = scheduler(&config, &host);
    let metrics = host.bindings.metrics.clone();

    let started = Instant::now();
    let report = scheduler.run_cycle().await;
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(matches!(
        report.entry(FailureKind::Memory),
        Some(CycleEntry::Dispatched(Dispatch::Detached { .. }))
    ));
    assert_eq!(metrics.count("memory", InjectionStatus::Success), 0);

    wait_for(&metrics, "memory", InjectionStatus::Success).await;
    assert_eq!(metrics.count("memory", InjectionStatus::Success), 1);
    host.bindings.tasks.drain().await;
    assert_eq!(metrics.active("memory"), 0);
    assert_eq!(host.bindings.tasks.outstanding(), 0);
}

#[tokio::test]
async fn memory_pressure_is_capped_by_the_task_registry() {
    let config: Config = r#"
agent:
  interval_seconds: 1
  max_memory_tasks: 1
failures:
  memory: { enabled: true, probability: 1.0, duration_seconds: 30, mb: 1 }
"#
    .parse()
    .unwrap();
    let host = host(&config, ScriptedCommandRunner::new());
    let mut scheduler = scheduler(&config, &host);

    let first = scheduler.run_cycle().await;
    assert!(matches!(
        first.entry(FailureKind::Memory),
        Some(CycleEntry::Dispatched(Dispatch::Detached { .. }))
    ));
    let second = scheduler.run_cycle().await;
    assert!(matches!(
        second.entry(FailureKind::Memory),
        Some(CycleEntry::Dispatched(Dispatch::Completed(InjectionOutcome::Skipped(_))))
    ));
    assert_eq!(host.bindings.metrics.count("memory", InjectionStatus::Skipped), 1);
    assert_eq!(host.bindings.tasks.abort_all(), 1);
}

#[tokio::test]
async fn dry_run_cycle_touches_nothing() {
    let config: Config = r#"
agent:
  interval_seconds: 1
  dry_run: true
failures:
  cpu: { enabled: true, probability: 1.0, duration_seconds: 5, cores: 2 }
  memory: { enabled: true, probability: 1.0, duration_seconds: 5, mb: 64 }
  process: { enabled: true, probability: 1.0, target_name: test-app }
  network: { enabled: true, probability: 1.0, duration_seconds: 5, interface: eth0, delay_ms: 250 }
"#
    .parse()
    .unwrap();
    let host = host(&config, ScriptedCommandRunner::new());
    let runtime = AgentRuntime::new(&config, host.bindings.clone());
    let mut scheduler = runtime.scheduler;

    let started = Instant::now();
    let report = scheduler.run_cycle().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let kinds: Vec<_> = report.entries.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, FailureKind::ALL.to_vec());
    for (kind, entry) in &report.entries {
        assert_eq!(
            entry,
            &CycleEntry::Dispatched(Dispatch::Completed(InjectionOutcome::skipped("dry run"))),
            "{kind}"
        );
        assert_eq!(host.bindings.metrics.count(kind.as_str(), InjectionStatus::Skipped), 1);
    }
    assert_eq!(host.runner.call_count(), 0);
    assert!(host.processes.signals().is_empty());
    assert!(host.processes.is_alive(800));
    assert!(host.bindings.active.is_empty());
    assert_eq!(host.bindings.tasks.outstanding(), 0);
}

#[tokio::test]
async fn abandoned_network_injection_triggers_cleanup() {
    let config: Config = r#"
agent:
  interval_seconds: 1
  injection_timeout_seconds: 0.05
failures:
  network: { enabled: true, probability: 1.0, duration_seconds: 0.05, interface: eth0, delay_ms: 100 }
"#
    .parse()
    .unwrap();
    let host = host(
        &config,
        ScriptedCommandRunner::new().with_latency(Duration::from_millis(150)),
    );
    host.bindings.active.insert("eth0");
    let runtime = AgentRuntime::new(&config, host.bindings.clone());
    let mut scheduler = runtime.scheduler;

    let report = scheduler.run_cycle().await;
    assert!(matches!(report.entry(FailureKind::Network), Some(CycleEntry::TimedOut(_))));
    assert_eq!(host.bindings.metrics.count("network", InjectionStatus::Failed), 1);
    assert_eq!(host.bindings.metrics.active("network"), 0);

    // One interrupted pre-release, then the lifecycle rollback.
    let deletes = host.runner.calls_with("del");
    assert_eq!(deletes.len(), 2);
    assert!(host.runner.calls_with("add").is_empty());
    assert!(host.bindings.active.is_empty());
}
