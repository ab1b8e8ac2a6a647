//! Run event vocabulary shared by the scheduler, SSE surface and CLI.
//!
//! Events are emitted on a bounded channel; a full channel blocks the
//! emitting task rather than dropping events, which couples consumer
//! latency to producer rate for streaming clients.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::TaskId;
use crate::trace::RunStats;

/// One event in a run's stream.
///
/// The serde tag doubles as the SSE event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// Graph summary, emitted once after planning.
    Plan {
        run_id: String,
        task_count: usize,
        task_ids: Vec<TaskId>,
    },
    /// Routing decision for one attempt; precedes `task_start`.
    Decision {
        task_id: TaskId,
        model_id: String,
        provider_id: String,
        /// Position of the chosen binding in the router's ranked list.
        rank: usize,
        attempt: u32,
    },
    /// Adapter call dispatched.
    TaskStart { task_id: TaskId, model_id: String },
    /// Text fragment; partial output is permitted and ordered per task.
    TaskArtifact { task_id: TaskId, fragment: String },
    /// Terminal verdict for the current artifact.
    TaskVerified {
        task_id: TaskId,
        score: f64,
        passed: bool,
    },
    /// Repair nodes inserted; precedes any later `decision` for the task.
    TaskRepaired {
        task_id: TaskId,
        new_node_ids: Vec<TaskId>,
    },
    /// Terminal failure for the task.
    TaskFailed { task_id: TaskId, reason: String },
    /// All terminal tasks settled; assembly begins.
    AssembleStart {
        strategy: String,
        artifact_count: usize,
    },
    /// Full assembled content.
    Final {
        content: String,
        confidence: f64,
        source_artifacts: Vec<Uuid>,
    },
    /// Aggregate numbers, emitted last.
    Stats { stats: RunStats },
}

impl RunEvent {
    /// The SSE event name for this payload.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Plan { .. } => "plan",
            RunEvent::Decision { .. } => "decision",
            RunEvent::TaskStart { .. } => "task_start",
            RunEvent::TaskArtifact { .. } => "task_artifact",
            RunEvent::TaskVerified { .. } => "task_verified",
            RunEvent::TaskRepaired { .. } => "task_repaired",
            RunEvent::TaskFailed { .. } => "task_failed",
            RunEvent::AssembleStart { .. } => "assemble_start",
            RunEvent::Final { .. } => "final",
            RunEvent::Stats { .. } => "stats",
        }
    }

    /// Task id this event concerns, when per-task.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            RunEvent::Decision { task_id, .. }
            | RunEvent::TaskStart { task_id, .. }
            | RunEvent::TaskArtifact { task_id, .. }
            | RunEvent::TaskVerified { task_id, .. }
            | RunEvent::TaskRepaired { task_id, .. }
            | RunEvent::TaskFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_match_tags() {
        let event = RunEvent::TaskVerified {
            task_id: "t1".into(),
            score: 0.9,
            passed: true,
        };
        assert_eq!(event.name(), "task_verified");

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["event"], "task_verified");
        assert_eq!(json["task_id"], "t1");
    }

    #[test]
    fn test_task_id_extraction() {
        let event = RunEvent::TaskFailed {
            task_id: "t2".into(),
            reason: "Cancelled".into(),
        };
        assert_eq!(event.task_id(), Some("t2"));

        let event = RunEvent::Stats {
            stats: RunStats::default(),
        };
        assert_eq!(event.task_id(), None);
    }

    #[test]
    fn test_event_round_trip() {
        let event = RunEvent::Decision {
            task_id: "t1".into(),
            model_id: "claude-sonnet-4".into(),
            provider_id: "anthropic".into(),
            rank: 0,
            attempt: 1,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: RunEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }
}
