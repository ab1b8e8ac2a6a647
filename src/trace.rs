//! Run-trace data model: bindings, artifacts, verdicts and aggregates.
//!
//! Every record type here is owned by the run's `RunTrace`, which the
//! engine holds exclusively for the run's duration. Components append to
//! their sub-collections through the scheduler's single run-scoped lock;
//! the trace is sealed before it is persisted to the journal.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{TaskGraph, TaskId, TaskNode};

/// Concrete (task, model, provider, attempt) association used for one
/// execution. Immutable once created; new attempts create new bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub task_id: TaskId,
    pub model_id: String,
    pub provider_id: String,
    pub attempt_index: u32,
}

impl Binding {
    pub fn new(
        task_id: impl Into<TaskId>,
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
        attempt_index: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            model_id: model_id.into(),
            provider_id: provider_id.into(),
            attempt_index,
        }
    }

    /// The same (task, model, provider) with the next attempt index.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_index: self.attempt_index + 1,
            ..self.clone()
        }
    }
}

/// Lifecycle status of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Produced,
    Verified,
    Rejected,
    Repaired,
}

/// Text produced by executing one binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: Uuid,
    pub task_id: TaskId,
    pub binding: Binding,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub produced_at: DateTime<Utc>,
    pub status: ArtifactStatus,
}

impl Artifact {
    pub fn new(binding: Binding, content: impl Into<String>) -> Self {
        Self {
            artifact_id: Uuid::new_v4(),
            task_id: binding.task_id.clone(),
            binding,
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            produced_at: Utc::now(),
            status: ArtifactStatus::Produced,
        }
    }

    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32, latency_ms: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self.latency_ms = latency_ms;
        self
    }
}

/// A partial graph fragment synthesized to correct a rejected artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairDirective {
    /// New nodes to insert; their inputs edge into the original task.
    pub nodes: Vec<TaskNode>,
}

/// The verifier's structured judgement over one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub artifact_id: Uuid,
    /// Confidence in [0, 1].
    pub score: f64,
    pub passed: bool,
    pub failure_reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub repair_directive: Option<RepairDirective>,
}

/// The assembler's merged output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledResponse {
    pub content: String,
    /// Mean of constituent verdict scores.
    pub confidence: f64,
    pub source_artifacts: Vec<Uuid>,
    /// Non-fatal problems surfaced to the caller (partial failure).
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Aggregate statistics for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub wall_time_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub tasks_executed: u64,
    pub tasks_repaired: u64,
    pub tasks_failed: u64,
}

/// A task that ended in the `failed` state, with its reason string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub reason: String,
}

/// The full, sealed record of one invocation, suitable for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    pub run_id: String,
    pub prompt: String,
    /// Final graph, including repair-generated nodes.
    pub graph: TaskGraph,
    pub bindings: Vec<Binding>,
    pub artifacts: Vec<Artifact>,
    pub verdicts: Vec<Verdict>,
    pub failures: Vec<TaskFailure>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<AssembledResponse>,
    pub stats: RunStats,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunTrace {
    /// Creates an open trace at engine entry.
    pub fn open(run_id: impl Into<String>, prompt: impl Into<String>, graph: TaskGraph) -> Self {
        Self {
            run_id: run_id.into(),
            prompt: prompt.into(),
            graph,
            bindings: Vec::new(),
            artifacts: Vec::new(),
            verdicts: Vec::new(),
            failures: Vec::new(),
            response: None,
            stats: RunStats::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Looks up the artifact for an id.
    pub fn artifact(&self, artifact_id: Uuid) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.artifact_id == artifact_id)
    }

    /// Latest artifact recorded for a task, if any.
    pub fn latest_artifact_for(&self, task_id: &str) -> Option<&Artifact> {
        self.artifacts.iter().rev().find(|a| a.task_id == task_id)
    }

    /// Latest verdict for a task's artifacts, if any.
    pub fn latest_verdict_for(&self, task_id: &str) -> Option<&Verdict> {
        self.verdicts.iter().rev().find(|v| {
            self.artifact(v.artifact_id)
                .map(|a| a.task_id == task_id)
                .unwrap_or(false)
        })
    }

    /// Seals the trace: stamps the finish time and wall-clock stat.
    /// The trace is read-only after this point.
    pub fn seal(&mut self) {
        let now = Utc::now();
        self.stats.wall_time_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
    }

    pub fn is_sealed(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Generates a time-sortable run identifier: `YYYYMMDD_HHMMSS_<6-hex>`.
pub fn generate_run_id() -> String {
    let now = Utc::now();
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}_{:06x}", now.format("%Y%m%d_%H%M%S"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskKind;

    fn one_node_graph() -> TaskGraph {
        TaskGraph::new(vec![TaskNode::new("t1", TaskKind::General, "hi")]).expect("valid")
    }

    #[test]
    fn test_binding_next_attempt() {
        let b = Binding::new("t1", "claude-sonnet", "anthropic", 0);
        let next = b.next_attempt();
        assert_eq!(next.attempt_index, 1);
        assert_eq!(next.task_id, "t1");
        assert_eq!(next.model_id, "claude-sonnet");
    }

    #[test]
    fn test_artifact_builder() {
        let binding = Binding::new("t1", "m", "p", 0);
        let artifact = Artifact::new(binding, "4").with_usage(10, 1, 250);
        assert_eq!(artifact.task_id, "t1");
        assert_eq!(artifact.status, ArtifactStatus::Produced);
        assert_eq!(artifact.input_tokens, 10);
        assert_eq!(artifact.latency_ms, 250);
    }

    #[test]
    fn test_run_id_shape() {
        let id = generate_run_id();
        // YYYYMMDD_HHMMSS_xxxxxx
        assert_eq!(id.len(), 8 + 1 + 6 + 1 + 6);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].chars().all(|c| c.is_ascii_digit()));
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_run_ids_time_sortable() {
        let a = generate_run_id();
        let b = generate_run_id();
        // Same-second ids differ only in suffix; lexicographic order still
        // never places a later second before an earlier one.
        assert!(a[..15] <= b[..15]);
    }

    #[test]
    fn test_trace_seal() {
        let mut trace = RunTrace::open("20260801_120000_abc123", "hi", one_node_graph());
        assert!(!trace.is_sealed());
        trace.seal();
        assert!(trace.is_sealed());
        assert!(trace.finished_at.is_some());
    }

    #[test]
    fn test_trace_lookups() {
        let mut trace = RunTrace::open("r", "p", one_node_graph());
        let b = Binding::new("t1", "m", "p", 0);
        let first = Artifact::new(b.clone(), "first");
        let second = Artifact::new(b.next_attempt(), "second");
        let second_id = second.artifact_id;
        trace.artifacts.push(first);
        trace.artifacts.push(second);
        trace.verdicts.push(Verdict {
            artifact_id: second_id,
            score: 1.0,
            passed: true,
            failure_reasons: Vec::new(),
            repair_directive: None,
        });

        assert_eq!(trace.latest_artifact_for("t1").unwrap().content, "second");
        assert!(trace.latest_verdict_for("t1").unwrap().passed);
        assert!(trace.latest_artifact_for("missing").is_none());
    }

    #[test]
    fn test_trace_serde_round_trip() {
        let mut trace = RunTrace::open("r1", "prompt", one_node_graph());
        let b = Binding::new("t1", "m", "p", 0);
        trace.bindings.push(b.clone());
        trace.artifacts.push(Artifact::new(b, "out"));
        trace.seal();

        let json = serde_json::to_string(&trace).expect("serialize");
        let back: RunTrace = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, trace);
    }
}
