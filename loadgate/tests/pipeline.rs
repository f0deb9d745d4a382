use std::time::Duration;

use loadgate::{
    config::{Document, Format},
    executor::ReplayExecutor,
    gate::{RuleStatus, Verdict},
    metric::{Outcome, Sample},
    pipeline::{self, ExitStatus, Plan, RunOptions},
};

const CONFIG: &str = r#"
load:
  host: http://service.test
  users: 5
  spawn_rate: 5
  run_time: 10s
scenario:
  requests:
    - {name: List, path: /items, weight: 3}
    - {name: Create, method: POST, path: /items, json: {id: "${random}"}}
analysis:
  rules:
    - {metric: p95_ms, mode: relative, direction: increase, warn: 10, fail: 25}
  gate:
    mode: acceptance
    min_requests: 50
    warmup_seconds: 2
    thresholds:
      error_rate: {warn: 1, fail: 5}
"#;

fn plan(storage: &std::path::Path) -> Plan {
    let mut doc = Document::parse(CONFIG, Format::Yaml).unwrap();
    doc.artifacts.storage = Some(storage.to_string_lossy().into_owned());
    Plan::prepare(&doc).unwrap()
}

/// 300 samples, one every 20 ms; the first 100 fall inside the warmup.
fn recording(latency_ms: u64) -> Vec<Sample> {
    (0..300u64)
        .map(|i| {
            let name = if i % 4 == 0 { "Create" } else { "List" };
            Sample::new(
                name,
                Duration::from_millis(i * 20),
                Duration::from_millis(latency_ms),
                Outcome::Status(200),
            )
        })
        .collect()
}

#[tokio::test]
async fn promote_then_catch_a_regression() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(dir.path());
    let store = &plan.analysis.store;

    // first run: nothing to compare against, gate passes, becomes the baseline
    let opts = RunOptions::builder().run_id("base").promote(true).build();
    let mut executor = ReplayExecutor::new(recording(100));
    let first = pipeline::execute(&plan, &mut executor, &opts).await.unwrap();

    assert_eq!(first.metrics.requests, 200);
    assert_eq!(first.metrics.p95_ms, 100.0);
    let analysis = first.analysis.as_ref().unwrap();
    assert_eq!(analysis.status, Verdict::Pass);
    assert!(!analysis.inconclusive);
    assert!(analysis.annotations[0].contains("baseline unavailable"));
    assert!(first.promoted);
    assert_eq!(first.exit, ExitStatus::Success);
    assert_eq!(plan.analysis.baseline_store().load().unwrap().run_id, "base");

    // second run: p95 up 40%, fails and must not replace the baseline
    let opts = RunOptions::builder().run_id("slow").promote(true).build();
    let mut executor = ReplayExecutor::new(recording(140));
    let second = pipeline::execute(&plan, &mut executor, &opts).await.unwrap();

    let analysis = second.analysis.as_ref().unwrap();
    assert_eq!(analysis.status, Verdict::Degradation);
    assert_eq!(analysis.baseline_id.as_deref(), Some("base"));
    let p95 = analysis.fired().next().unwrap();
    assert_eq!(p95.status, RuleStatus::Degradation);
    assert!(!second.promoted);
    assert_eq!(second.exit, ExitStatus::GateFailed);
    assert_eq!(plan.analysis.baseline_store().load().unwrap().run_id, "base");

    for file in [
        store.run_path("slow"),
        store.metrics_path("slow"),
        store.analysis_path("slow"),
        store.program_path("slow"),
        store.samples_path("slow"),
    ] {
        assert!(file.exists(), "{} missing", file.display());
    }
    let meta = store.load_run("slow").unwrap();
    assert_eq!(meta.verdict, Some(Verdict::Degradation));
    assert_eq!(meta.promoted, Some(false));

    let history = store.load_history();
    let ids: Vec<_> = history.runs.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, ["base", "slow"]);
}

#[tokio::test]
async fn reanalyze_a_stored_run() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(dir.path());

    for (id, latency) in [("base", 100), ("slow", 140)] {
        let opts = RunOptions::builder().run_id(id).analyze(false).build();
        let mut executor = ReplayExecutor::new(recording(latency));
        let outcome = pipeline::execute(&plan, &mut executor, &opts).await.unwrap();
        assert!(outcome.analysis.is_none());
        assert_eq!(outcome.exit, ExitStatus::Success);
    }

    // an explicit baseline run instead of baseline.json
    let opts = RunOptions::builder().baseline_run("base").build();
    let outcome = pipeline::analyze(&plan.analysis, "slow", &opts).await.unwrap();
    assert_eq!(outcome.metrics.requests, 200);
    assert_eq!(outcome.analysis.unwrap().status, Verdict::Degradation);
    assert_eq!(outcome.exit, ExitStatus::GateFailed);

    // an unknown baseline run only skips the comparison
    let opts = RunOptions::builder().baseline_run("never-ran").build();
    let outcome = pipeline::analyze(&plan.analysis, "slow", &opts).await.unwrap();
    let analysis = outcome.analysis.unwrap();
    assert_eq!(analysis.status, Verdict::Pass);
    assert_eq!(analysis.summary.skip, 1);
    assert_eq!(outcome.exit, ExitStatus::Success);
}

#[tokio::test]
async fn reanalysis_keeps_samples_recorded_while_draining() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(dir.path());
    let store = &plan.analysis.store;

    let opts = RunOptions::builder().run_id("drain").analyze(false).build();
    let mut executor = ReplayExecutor::new(recording(100));
    pipeline::execute(&plan, &mut executor, &opts).await.unwrap();

    // requests that started after the 10s run time, during the stop grace period
    let mut samples = recording(100);
    samples.extend((0..50u64).map(|i| {
        Sample::new(
            "List",
            Duration::from_millis(10_500 + i),
            Duration::from_millis(100),
            Outcome::Status(200),
        )
    }));
    store.save_samples("drain", &samples).unwrap();

    let opts = RunOptions::builder().build();
    let outcome = pipeline::analyze(&plan.analysis, "drain", &opts).await.unwrap();
    assert_eq!(outcome.metrics.requests, 250);
}

#[tokio::test]
async fn too_few_requests_is_inconclusive() {
    let dir = tempfile::tempdir().unwrap();
    let plan = plan(dir.path());

    // only 20 samples survive the warmup
    let samples: Vec<Sample> = recording(100).into_iter().take(120).collect();
    let opts = RunOptions::builder().run_id("short").promote(true).build();
    let mut executor = ReplayExecutor::new(samples);
    let outcome = pipeline::execute(&plan, &mut executor, &opts).await.unwrap();

    let analysis = outcome.analysis.unwrap();
    assert_eq!(analysis.status, Verdict::Pass);
    assert!(analysis.inconclusive);
    assert!(!analysis.gate.unwrap().applied);
    assert_eq!(outcome.exit, ExitStatus::Success);
}
