//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "tests"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Process termination against a fake process table."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chaos_agent_common::FailureSpec;
use chaos_agent_core::{
    AgentError, Dispatch, InjectionContext, InjectionOutcome, Injector, ProcessInfo,
    ProcessInjector, ProcessSafetyPolicy, ProcessSignal,
};
use chaos_agent_logging::LogContext;
use chaos_agent_metrics::{InjectionMetrics, InjectionStatus};
use chaos_agent_testharness::{ExitBehaviour, FakeProcessTable};

const AGENT_PID: u32 = 500;
const SHELL_PID: u32 = 400;

/// Agent running as `chaos-agentd` under a shell, with a child and grandchild.
fn host() -> FakeProcessTable {
    FakeProcessTable::new(AGENT_PID, Some(SHELL_PID))
        .with_process(ProcessInfo::new(1, None, "systemd", &["/sbin/init"]))
        .with_process(ProcessInfo::new(200, Some(1), "sshd", &["/usr/sbin/sshd", "-D"]))
        .with_process(ProcessInfo::new(SHELL_PID, Some(200), "chaos-agentd", &["chaos-agentd", "--supervise"]))
        .with_process(ProcessInfo::new(AGENT_PID, Some(SHELL_PID), "chaos-agentd", &["chaos-agentd", "run"]))
        .with_process(ProcessInfo::new(501, Some(AGENT_PID), "chaos-agentd", &["chaos-agentd", "helper"]))
        .with_process(ProcessInfo::new(502, Some(501), "test-app-worker", &["test-app-worker"]))
}

fn injector(table: Arc<FakeProcessTable>, metrics: &InjectionMetrics) -> ProcessInjector {
    ProcessInjector::new(metrics.clone(), table, Arc::new(ProcessSafetyPolicy::default()))
        .with_waits(Duration::from_millis(50), Duration::from_millis(50))
}

fn target(name: Option<&str>) -> FailureSpec {
    FailureSpec {
        enabled: true,
        probability: 1.0,
        target_name: name.map(str::to_owned),
        ..FailureSpec::default()
    }
}

fn outcome(dispatch: Dispatch) -> InjectionOutcome {
    dispatch.outcome().cloned().expect("process injections complete inline")
}

#[tokio::test]
async fn broad_target_fails_without_scanning() {
    let table = Arc::new(host());
    let metrics = InjectionMetrics::standalone().unwrap();
    let injector = injector(table.clone(), &metrics);
    let result = injector
        .inject(&target(Some("python")), &InjectionContext::standalone(false))
        .await
        .unwrap();
    match outcome(result) {
        InjectionOutcome::Failed(reason) => assert!(reason.contains("too broad"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(table.snapshot_count(), 0);
    assert!(table.signals().is_empty());
    assert_eq!(metrics.count("process", InjectionStatus::Failed), 1);

    let short = injector
        .inject(&target(Some(" ab ")), &InjectionContext::standalone(false))
        .await
        .unwrap();
    assert!(matches!(outcome(short), InjectionOutcome::Failed(reason) if reason.contains("too short")));
    assert_eq!(table.snapshot_count(), 0);
}

#[tokio::test]
async fn missing_target_is_a_counted_no_op() {
    let table = Arc::new(host());
    let metrics = InjectionMetrics::standalone().unwrap();
    let injector = injector(table.clone(), &metrics);
    for name in [None, Some("")] {
        let result = injector
            .inject(&target(name), &InjectionContext::standalone(false))
            .await
            .unwrap();
        assert!(matches!(outcome(result), InjectionOutcome::Skipped(_)));
    }
    assert_eq!(table.snapshot_count(), 0);
    assert_eq!(metrics.count("process", InjectionStatus::Skipped), 2);
}

#[tokio::test]
async fn never_targets_itself_its_parent_or_descendants() {
    let table = Arc::new(host());
    let metrics = InjectionMetrics::standalone().unwrap();
    let injector = injector(table.clone(), &metrics);
    let log = LogContext::default();

    assert!(injector.find_targets("chaos-agentd", &log).unwrap().is_empty());
    assert!(injector.find_targets("test-app-worker", &log).unwrap().is_empty());

    let result = injector
        .inject(&target(Some("chaos-agentd")), &InjectionContext::standalone(false))
        .await
        .unwrap();
    assert!(matches!(outcome(result), InjectionOutcome::Skipped(_)));
    assert!(table.signals().is_empty());
    for pid in [SHELL_PID, AGENT_PID, 501, 502] {
        assert!(table.is_alive(pid));
    }
}

#[test]
fn own_children_are_spared_even_with_plain_names() {
    let table = Arc::new(
        host()
            .with_process(ProcessInfo::new(510, Some(AGENT_PID), "billing-worker", &["billing-worker"]))
            .with_process(ProcessInfo::new(511, Some(510), "billing-worker", &["billing-worker"]))
            .with_process(ProcessInfo::new(800, Some(1), "billing-worker", &["billing-worker"])),
    );
    let metrics = InjectionMetrics::standalone().unwrap();
    let injector = injector(table, &metrics);

    let pids: Vec<u32> = injector
        .find_targets("billing-worker", &LogContext::default())
        .unwrap()
        .iter()
        .map(|process| process.pid)
        .collect();
    assert_eq!(pids, vec![800]);
}

#[tokio::test]
async fn critical_processes_and_agent_cmdlines_are_excluded() {
    let table = Arc::new(
        host()
            .with_process(ProcessInfo::new(
                700,
                Some(1),
                "runner",
                &["/usr/bin/containerd-shim", "--id", "billing"],
            ))
            .with_process(ProcessInfo::new(
                701,
                Some(1),
                "wrapper",
                &["/opt/chaos-agent/bin/wrap", "billing"],
            ))
            .with_process(ProcessInfo::new(702, Some(1), "billing-worker", &["billing-worker"])),
    );
    let metrics = InjectionMetrics::standalone().unwrap();
    let injector = injector(table.clone(), &metrics);

    let found = injector.find_targets("BILLING", &LogContext::default()).unwrap();
    let pids: Vec<_> = found.iter().map(|p| p.pid).collect();
    assert_eq!(pids, vec![702]);
    assert!(injector.find_targets("sshd", &LogContext::default()).unwrap().is_empty());
}

#[tokio::test]
async fn kills_exactly_one_matching_process() {
    let table = Arc::new(
        host()
            .with_process(ProcessInfo::new(800, Some(1), "test-app", &["test-app", "--port", "8080"]))
            .with_process(ProcessInfo::new(801, Some(1), "test-app", &["test-app", "--port", "8081"])),
    );
    let metrics = InjectionMetrics::standalone().unwrap();
    let injector = injector(table.clone(), &metrics);

    let result = injector
        .inject(&target(Some("test-app")), &InjectionContext::standalone(false))
        .await
        .unwrap();
    assert_eq!(outcome(result), InjectionOutcome::Success);
    assert_eq!(table.signals(), vec![(800, ProcessSignal::Terminate)]);
    assert!(!table.is_alive(800));
    assert!(table.is_alive(801));
    assert_eq!(metrics.count("process", InjectionStatus::Success), 1);
    assert_eq!(metrics.active("process"), 0);
}

#[tokio::test]
async fn stubborn_process_is_escalated_to_kill() {
    let table = Arc::new(
        host()
            .with_process(ProcessInfo::new(900, Some(1), "test-app", &[]))
            .with_behaviour(900, ExitBehaviour::Stubborn),
    );
    let metrics = InjectionMetrics::standalone().unwrap();
    let result = injector(table.clone(), &metrics)
        .inject(&target(Some("test-app")), &InjectionContext::standalone(false))
        .await
        .unwrap();
    assert_eq!(outcome(result), InjectionOutcome::Success);
    assert_eq!(
        table.signals(),
        vec![(900, ProcessSignal::Terminate), (900, ProcessSignal::Kill)]
    );
}

#[tokio::test]
async fn signal_races_and_denials_map_to_outcomes() {
    let cases = [
        (ExitBehaviour::Vanishes, "skipped"),
        (ExitBehaviour::Protected, "failed"),
        (ExitBehaviour::Unkillable, "failed"),
    ];
    for (behaviour, expected) in cases {
        let table = Arc::new(
            host()
                .with_process(ProcessInfo::new(910, Some(1), "test-app", &[]))
                .with_behaviour(910, behaviour),
        );
        let metrics = InjectionMetrics::standalone().unwrap();
        let result = injector(table, &metrics)
            .inject(&target(Some("test-app")), &InjectionContext::standalone(false))
            .await
            .unwrap();
        assert_eq!(outcome(result).status().as_str(), expected, "{behaviour:?}");
    }
}

#[tokio::test]
async fn dry_run_reports_without_signalling() {
    let table = Arc::new(host().with_process(ProcessInfo::new(800, Some(1), "test-app", &[])));
    let metrics = InjectionMetrics::standalone().unwrap();
    let result = injector(table.clone(), &metrics)
        .inject(&target(Some("test-app")), &InjectionContext::standalone(true))
        .await
        .unwrap();
    assert_eq!(outcome(result), InjectionOutcome::skipped("dry run"));
    assert_eq!(table.snapshot_count(), 1);
    assert!(table.signals().is_empty());
    assert!(table.is_alive(800));
}

#[tokio::test]
async fn unavailable_process_table_surfaces_as_error() {
    let table = Arc::new(host());
    table.set_unavailable(true);
    let metrics = InjectionMetrics::standalone().unwrap();
    let result = injector(table, &metrics)
        .inject(&target(Some("test-app")), &InjectionContext::standalone(false))
        .await;
    assert!(matches!(result, Err(AgentError::ProcessTable(_))));
}
