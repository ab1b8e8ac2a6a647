//! End-to-end orchestration scenarios over deterministic stub adapters.

use std::sync::Arc;
use std::time::Duration;

use ai3::config::Settings;
use ai3::engine::{Engine, RunOutcome};
use ai3::events::RunEvent;
use ai3::graph::TaskKind;
use ai3::planner::PlanOptions;
use ai3::providers::{AdapterSet, ProviderAdapter, StubAdapter};
use ai3::registry::CapabilityRegistry;
use ai3::telemetry::TelemetryRecorder;
use ai3::RunError;
use tokio_util::sync::CancellationToken;

/// Two worker models on different providers, plus the planner's model.
/// `alpha` outranks `beta` on every kind used here; `planner-model`
/// declares no skills and lands last.
const TWO_PROVIDER_MODELS: &str = r#"
models:
  - model_id: alpha
    provider_id: p1
    context_window: 100000
    cost_per_1k_input: 0.003
    cost_per_1k_output: 0.015
    supported_features: [streaming]
    skills:
      general: 0.9
      data_analysis: 0.9
      summarization: 0.9
  - model_id: beta
    provider_id: p2
    context_window: 100000
    cost_per_1k_input: 0.001
    cost_per_1k_output: 0.002
    supported_features: [streaming]
    skills:
      general: 0.6
      data_analysis: 0.6
      summarization: 0.6
  - model_id: planner-model
    provider_id: p1
    context_window: 200000
    cost_per_1k_input: 0.003
    cost_per_1k_output: 0.015
    supported_features: [streaming]
"#;

/// Every model on one provider, for the per-provider cap scenario.
const SINGLE_PROVIDER_MODELS: &str = r#"
models:
  - model_id: alpha
    provider_id: p1
    context_window: 100000
    cost_per_1k_input: 0.003
    cost_per_1k_output: 0.015
    supported_features: [streaming]
    skills:
      general: 0.9
  - model_id: planner-model
    provider_id: p1
    context_window: 200000
    cost_per_1k_input: 0.003
    cost_per_1k_output: 0.015
    supported_features: [streaming]
"#;

struct Harness {
    engine: Arc<Engine>,
    telemetry: Arc<TelemetryRecorder>,
    p1: Arc<StubAdapter>,
    p2: Arc<StubAdapter>,
    _dir: tempfile::TempDir,
}

fn harness(models: &str, tune: impl FnOnce(&mut Settings), p1_delay: Option<Duration>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::default();
    settings.planner_model = "planner-model".to_string();
    settings.data_dir = dir.path().to_path_buf();
    tune(&mut settings);

    let telemetry = Arc::new(TelemetryRecorder::new());
    let registry =
        CapabilityRegistry::from_yaml(models, Arc::clone(&telemetry)).expect("valid table");

    let mut p1 = StubAdapter::new("p1");
    if let Some(delay) = p1_delay {
        p1 = p1.with_delay(delay);
    }
    let p1 = Arc::new(p1);
    let p2 = Arc::new(StubAdapter::new("p2"));
    let mut adapters = AdapterSet::new();
    adapters.insert(Arc::clone(&p1) as Arc<dyn ProviderAdapter>);
    adapters.insert(Arc::clone(&p2) as Arc<dyn ProviderAdapter>);

    let engine = Engine::with_adapters(settings, registry, adapters).expect("engine builds");
    Harness {
        engine: Arc::new(engine),
        telemetry,
        p1,
        p2,
        _dir: dir,
    }
}

async fn run_collect(
    harness: &Harness,
    prompt: &str,
) -> (Result<RunOutcome, RunError>, Vec<RunEvent>) {
    let (mut rx, handle) = harness.engine.run_stream(
        prompt.to_string(),
        PlanOptions::default(),
        CancellationToken::new(),
    );
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (handle.await.expect("run task joins"), events)
}

fn assembled(events: &[RunEvent], task_id: &str) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskArtifact {
                task_id: id,
                fragment,
            } if id == task_id => Some(fragment.as_str()),
            _ => None,
        })
        .collect()
}

const S1_PLAN: &str = r#"{"tasks": [
    {"id": "t1", "kind": "general", "prompt": "What is 2+2?", "terminal": true}
]}"#;

#[tokio::test]
async fn s1_single_task_success() {
    let h = harness(TWO_PROVIDER_MODELS, |_| {}, None);
    h.p1.push_response("planner-model", Ok(S1_PLAN.to_string()));
    h.p1.push_response("alpha", Ok("4".to_string()));

    let (outcome, events) = run_collect(&h, "What is 2+2?").await;
    let outcome = outcome.expect("run succeeds");

    assert_eq!(outcome.content, "4");
    assert_eq!(outcome.stats.tasks_executed, 1);
    assert_eq!(outcome.stats.tasks_repaired, 0);
    assert_eq!(outcome.stats.tasks_failed, 0);

    let verified: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, RunEvent::TaskVerified { .. }))
        .collect();
    assert_eq!(verified.len(), 1);
    assert!(matches!(
        verified[0],
        RunEvent::TaskVerified { passed: true, .. }
    ));
}

const S2_PLAN: &str = r#"{"tasks": [
    {"id": "t1", "kind": "data_analysis",
     "prompt": "count words in: the quick brown fox"},
    {"id": "t2", "kind": "summarization", "prompt": "one-line summary",
     "inputs": ["t1"], "terminal": true}
]}"#;

#[tokio::test]
async fn s2_linear_dependency() {
    let h = harness(TWO_PROVIDER_MODELS, |_| {}, None);
    h.p1.push_response("planner-model", Ok(S2_PLAN.to_string()));
    h.p1.push_response("alpha", Ok("4".to_string()));
    h.p1.push_response("alpha", Ok("Four words.".to_string()));

    let (outcome, events) = run_collect(&h, "summarize a count").await;
    let outcome = outcome.expect("run succeeds");

    assert_eq!(outcome.content, "Four words.");
    assert_eq!(outcome.stats.tasks_executed, 2);

    // t2 starts only after t1 is done.
    let t1_verified = events
        .iter()
        .position(|e| {
            matches!(e, RunEvent::TaskVerified { task_id, .. } if task_id == "t1")
        })
        .expect("t1 verified");
    let t2_start = events
        .iter()
        .position(|e| matches!(e, RunEvent::TaskStart { task_id, .. } if task_id == "t2"))
        .expect("t2 started");
    assert!(t1_verified < t2_start);

    assert_eq!(assembled(&events, "t2"), "Four words.");
}

fn independent_plan(count: usize) -> String {
    let tasks: Vec<String> = (1..=count)
        .map(|i| {
            format!(
                r#"{{"id": "t{}", "kind": "general", "prompt": "part {}", "terminal": true}}"#,
                i, i
            )
        })
        .collect();
    format!(r#"{{"tasks": [{}]}}"#, tasks.join(","))
}

#[tokio::test]
async fn s3_global_concurrency_cap() {
    let h = harness(
        TWO_PROVIDER_MODELS,
        |s| s.max_concurrency = 2,
        Some(Duration::from_millis(40)),
    );
    h.p1.push_response("planner-model", Ok(independent_plan(5)));

    let (outcome, _) = run_collect(&h, "five parts").await;
    let outcome = outcome.expect("run succeeds");

    assert_eq!(outcome.stats.tasks_executed, 5);
    assert_eq!(outcome.stats.tasks_failed, 0);
    // The planner call runs alone before the scheduler; worker attempts
    // never exceed the global cap.
    assert!(
        h.p1.peak_in_flight() <= 2,
        "observed {} concurrent calls",
        h.p1.peak_in_flight()
    );
}

#[tokio::test]
async fn s4_per_provider_cap_serializes() {
    let h = harness(
        SINGLE_PROVIDER_MODELS,
        |s| {
            s.max_concurrency = 5;
            s.max_concurrency_per_provider = 1;
        },
        Some(Duration::from_millis(30)),
    );
    h.p1.push_response("planner-model", Ok(independent_plan(3)));

    let (outcome, _) = run_collect(&h, "three parts").await;
    let outcome = outcome.expect("run succeeds");

    assert_eq!(outcome.stats.tasks_executed, 3);
    // Serial on p1 despite free global slots (the planner call finished
    // before any worker started).
    assert_eq!(h.p1.peak_in_flight(), 1);
}

const S5_PLAN: &str = r#"{"tasks": [
    {"id": "t1", "kind": "general", "prompt": "say foo",
     "criteria": ["must contain the word FOO"], "repair_budget": 1,
     "terminal": true}
]}"#;

#[tokio::test]
async fn s5_repair_succeeds() {
    let h = harness(TWO_PROVIDER_MODELS, |_| {}, None);
    h.p1.push_response("planner-model", Ok(S5_PLAN.to_string()));
    h.p1.push_response("alpha", Ok("bar".to_string()));
    h.p1.push_response("alpha", Ok("bar FOO".to_string()));

    let (outcome, events) = run_collect(&h, "say foo").await;
    let outcome = outcome.expect("run succeeds");

    assert_eq!(outcome.content, "bar FOO");
    assert_eq!(outcome.stats.tasks_repaired, 1);
    assert_eq!(outcome.stats.tasks_failed, 0);

    let repaired: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, RunEvent::TaskRepaired { .. }))
        .collect();
    assert_eq!(repaired.len(), 1);

    // The verdict passes on the second attempt.
    let verdicts: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::TaskVerified { passed, .. } => Some(*passed),
            _ => None,
        })
        .collect();
    assert_eq!(verdicts, vec![false, true]);

    // Single task id across both attempts.
    for event in &events {
        if let Some(id) = event.task_id() {
            assert_eq!(id, "t1");
        }
    }
}

const S6_PLAN: &str = r#"{"tasks": [
    {"id": "t1", "kind": "general", "prompt": "help me",
     "repair_budget": 0, "terminal": true}
]}"#;

#[tokio::test]
async fn s6_fallback_after_repair_exhaustion() {
    let h = harness(TWO_PROVIDER_MODELS, |_| {}, None);
    h.p1.push_response("planner-model", Ok(S6_PLAN.to_string()));
    h.p1.push_response("alpha", Ok("I cannot help with that".to_string()));
    h.p2.push_response("beta", Ok("ok".to_string()));

    let (outcome, events) = run_collect(&h, "help me").await;
    let outcome = outcome.expect("run succeeds");

    assert_eq!(outcome.content, "ok");
    assert_eq!(outcome.stats.tasks_repaired, 0);
    assert!(!events
        .iter()
        .any(|e| matches!(e, RunEvent::TaskRepaired { .. })));

    // One rebind: decisions go alpha then beta.
    let decisions: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Decision { model_id, .. } => Some(model_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(decisions, vec!["alpha", "beta"]);

    // Telemetry: one failure against alpha, one success against beta.
    let alpha = h.telemetry.window("alpha");
    assert_eq!((alpha.attempts, alpha.errors), (1, 1));
    let beta = h.telemetry.window("beta");
    assert_eq!((beta.attempts, beta.successes), (1, 1));
}

#[tokio::test]
async fn replay_reconstructs_identical_trace() {
    let h = harness(TWO_PROVIDER_MODELS, |_| {}, None);
    h.p1.push_response("planner-model", Ok(S1_PLAN.to_string()));
    h.p1.push_response("alpha", Ok("4".to_string()));

    let (outcome, _) = run_collect(&h, "What is 2+2?").await;
    let outcome = outcome.expect("run succeeds");

    let calls_before = h.p1.call_count() + h.p2.call_count();
    let first = h.engine.replay(&outcome.run_id).await.expect("replay");
    let second = h.engine.replay(&outcome.run_id).await.expect("replay again");

    assert_eq!(first, second);
    assert_eq!(first.run_id, outcome.run_id);
    assert_eq!(
        first.response.as_ref().map(|r| r.content.as_str()),
        Some("4")
    );
    // Replay makes no LLM calls.
    assert_eq!(h.p1.call_count() + h.p2.call_count(), calls_before);
}

#[tokio::test]
async fn routing_override_to_chosen_model_is_idempotent() {
    // Baseline: alpha is chosen for `general` on merit.
    let baseline = harness(TWO_PROVIDER_MODELS, |_| {}, None);
    baseline
        .p1
        .push_response("planner-model", Ok(S1_PLAN.to_string()));
    baseline.p1.push_response("alpha", Ok("4".to_string()));
    let (outcome, events) = run_collect(&baseline, "What is 2+2?").await;
    let baseline_outcome = outcome.expect("baseline succeeds");
    let baseline_decision = events.iter().find_map(|e| match e {
        RunEvent::Decision { model_id, .. } => Some(model_id.clone()),
        _ => None,
    });

    // Pinning the override to that same model changes nothing.
    let pinned = harness(
        TWO_PROVIDER_MODELS,
        |s| {
            s.routing_overrides
                .insert(TaskKind::General, "alpha".to_string());
        },
        None,
    );
    pinned
        .p1
        .push_response("planner-model", Ok(S1_PLAN.to_string()));
    pinned.p1.push_response("alpha", Ok("4".to_string()));
    let (outcome, events) = run_collect(&pinned, "What is 2+2?").await;
    let pinned_outcome = outcome.expect("pinned run succeeds");
    let pinned_decision = events.iter().find_map(|e| match e {
        RunEvent::Decision { model_id, .. } => Some(model_id.clone()),
        _ => None,
    });

    assert_eq!(baseline_decision.as_deref(), Some("alpha"));
    assert_eq!(pinned_decision, baseline_decision);
    assert_eq!(pinned_outcome.content, baseline_outcome.content);
    assert_eq!(
        pinned_outcome.stats.tasks_executed,
        baseline_outcome.stats.tasks_executed
    );
}

#[tokio::test]
async fn partial_failure_assembles_with_warnings() {
    // Serial execution keeps the per-model response queues deterministic.
    let h = harness(TWO_PROVIDER_MODELS, |s| s.max_concurrency = 1, None);
    let plan = r#"{"tasks": [
        {"id": "t1", "kind": "general", "prompt": "works", "terminal": true},
        {"id": "t2", "kind": "general", "prompt": "breaks", "terminal": true}
    ]}"#;
    h.p1.push_response("planner-model", Ok(plan.to_string()));
    // t1 succeeds; t2 fails on both candidates.
    h.p1.push_response("alpha", Ok("fine".to_string()));
    h.p1.push_response(
        "alpha",
        Err(ai3::ProviderError::Permanent("down".to_string())),
    );
    h.p2.push_response(
        "beta",
        Err(ai3::ProviderError::Permanent("down".to_string())),
    );

    let (outcome, _) = run_collect(&h, "two parts").await;
    let outcome = outcome.expect("partial run still assembles");

    assert_eq!(outcome.content, "fine");
    assert_eq!(outcome.stats.tasks_failed, 1);
    assert!(!outcome.warnings.is_empty());
    assert!(outcome.confidence < 1.0);
}
