#![forbid(unsafe_code)]

use fxt_harness::{ScenarioReport, WorkloadConfig, run_workload, scenario_names};

#[test]
fn every_scenario_passes() {
    let report = ScenarioReport::run(None).expect("run");
    assert_eq!(report.scenarios.len(), scenario_names().len());
    for outcome in &report.scenarios {
        assert!(outcome.passed, "{}: {}", outcome.name, outcome.detail);
    }
    assert_eq!(report.failed, 0);
}

#[test]
fn a_single_scenario_can_be_selected() {
    let report = ScenarioReport::run(Some("s6_cross_ref_check")).expect("run");
    assert_eq!(report.scenarios.len(), 1);
    assert!(report.scenarios[0].passed, "{}", report.scenarios[0].detail);
}

#[test]
fn workload_keeps_the_model_in_sync() {
    let config = WorkloadConfig {
        operations: 400,
        commit_every: 25,
        ..WorkloadConfig::default()
    };
    let report = run_workload(&config).expect("workload");
    assert!(report.passed, "{:?}", report.failure);
    assert_eq!(report.operations_executed, 400);
    assert_eq!(report.commits, 400 / 25 + 1);
    assert!(report.operation_mix.get("alloc").copied().unwrap_or(0) > 0);
}

#[test]
fn workload_is_reproducible_from_its_seed() {
    let config = WorkloadConfig {
        seed: 42,
        operations: 200,
        commit_every: 16,
        ..WorkloadConfig::default()
    };
    let first = run_workload(&config).expect("first");
    let second = run_workload(&config).expect("second");
    assert_eq!(first.operation_mix, second.operation_mix);
    assert_eq!(first.live_extents, second.live_extents);
    assert_eq!(first.live_refs, second.live_refs);
    assert!(first.passed && second.passed);
}
