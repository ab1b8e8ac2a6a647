//! Task graph model: nodes, validation and topological expansion.
//!
//! A `TaskGraph` is the planner's output and the scheduler's input: a
//! finite DAG of subtasks whose edges are encoded by each node's `inputs`
//! list. Construction validates id uniqueness, referential integrity and
//! acyclicity; repair nodes synthesized at run time are inserted through
//! [`TaskGraph::insert_node`] so the same invariants hold for the final
//! graph recorded in the run trace.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Node identifier, unique within one graph.
pub type TaskId = String;

/// Errors produced by graph parsing and validation.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Schema violation: {0}")]
    Schema(String),

    #[error("Cycle detected: {0}")]
    Cycle(String),
}

/// Stable task categories used in task graphs, routing overrides and
/// telemetry indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Coding,
    CreativeWriting,
    ProfessionalWriting,
    DocumentProcessing,
    Automation,
    Summarization,
    DataAnalysis,
    Multimodal,
    Integration,
    MathematicalReasoning,
    RealtimeSocial,
    CreativeInsight,
    General,
}

impl TaskKind {
    /// The stable identifier for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Coding => "coding",
            TaskKind::CreativeWriting => "creative_writing",
            TaskKind::ProfessionalWriting => "professional_writing",
            TaskKind::DocumentProcessing => "document_processing",
            TaskKind::Automation => "automation",
            TaskKind::Summarization => "summarization",
            TaskKind::DataAnalysis => "data_analysis",
            TaskKind::Multimodal => "multimodal",
            TaskKind::Integration => "integration",
            TaskKind::MathematicalReasoning => "mathematical_reasoning",
            TaskKind::RealtimeSocial => "realtime_social",
            TaskKind::CreativeInsight => "creative_insight",
            TaskKind::General => "general",
        }
    }

    /// All kinds, in declaration order.
    pub fn all() -> &'static [TaskKind] {
        &[
            TaskKind::Coding,
            TaskKind::CreativeWriting,
            TaskKind::ProfessionalWriting,
            TaskKind::DocumentProcessing,
            TaskKind::Automation,
            TaskKind::Summarization,
            TaskKind::DataAnalysis,
            TaskKind::Multimodal,
            TaskKind::Integration,
            TaskKind::MathematicalReasoning,
            TaskKind::RealtimeSocial,
            TaskKind::CreativeInsight,
            TaskKind::General,
        ]
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| GraphError::Schema(format!("unknown task kind '{}'", s)))
    }
}

/// Model capabilities a task may require.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Streaming,
    LongContext,
    Vision,
    FunctionCalling,
}

/// One subtask in a task graph.
///
/// Serde field names follow the canonical JSON shape emitted by the
/// planner LLM; unknown inbound fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Unique node id within the graph.
    pub id: TaskId,
    /// Task category, used for routing and telemetry.
    pub kind: TaskKind,
    /// Prompt text executed against the chosen model.
    #[serde(rename = "prompt")]
    pub prompt_text: String,
    /// Upstream node ids whose artifacts are concatenated as context.
    #[serde(default)]
    pub inputs: Vec<TaskId>,
    /// Free-form checkable statements the verifier renders into checks.
    #[serde(rename = "criteria", default)]
    pub success_criteria: Vec<String>,
    /// Capabilities the chosen model must support.
    #[serde(rename = "features", default)]
    pub required_features: BTreeSet<Feature>,
    /// Minimum context window the chosen model must offer.
    #[serde(rename = "min_context", default)]
    pub min_context_tokens: u32,
    /// How many repair attempts this task may consume; the run-level
    /// repair limit applies when unset.
    #[serde(default)]
    pub repair_budget: Option<u32>,
    /// Whether this node's artifact feeds the assembler even if it has
    /// downstream consumers.
    #[serde(default)]
    pub terminal: bool,
}

impl TaskNode {
    /// Creates a minimal node; tests and repair synthesis build on this.
    pub fn new(id: impl Into<TaskId>, kind: TaskKind, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            prompt_text: prompt.into(),
            inputs: Vec::new(),
            success_criteria: Vec::new(),
            required_features: BTreeSet::new(),
            min_context_tokens: 0,
            repair_budget: None,
            terminal: false,
        }
    }

    /// Adds an upstream dependency.
    pub fn with_input(mut self, input: impl Into<TaskId>) -> Self {
        self.inputs.push(input.into());
        self
    }

    /// Adds a success criterion.
    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.success_criteria.push(criterion.into());
        self
    }

    /// Marks the node as terminal.
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Sets the repair budget.
    pub fn with_repair_budget(mut self, budget: u32) -> Self {
        self.repair_budget = Some(budget);
        self
    }

    /// Repair budget, falling back to the run-level default when unset.
    pub fn repair_budget_or(&self, default: u32) -> u32 {
        self.repair_budget.unwrap_or(default)
    }

    /// Sets the minimum context requirement.
    pub fn with_min_context(mut self, tokens: u32) -> Self {
        self.min_context_tokens = tokens;
        self
    }

    /// Adds a required feature.
    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.required_features.insert(feature);
        self
    }
}

/// A validated DAG of subtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    tasks: Vec<TaskNode>,
}

impl TaskGraph {
    /// Builds a graph from nodes, validating all structural invariants.
    pub fn new(tasks: Vec<TaskNode>) -> Result<Self, GraphError> {
        let graph = Self { tasks };
        graph.validate()?;
        Ok(graph)
    }

    /// Parses the canonical `{"tasks": [...]}` JSON document.
    pub fn parse(json: &str) -> Result<Self, GraphError> {
        #[derive(Deserialize)]
        struct Wire {
            tasks: Vec<TaskNode>,
        }

        let wire: Wire = serde_json::from_str(json)
            .map_err(|e| GraphError::Schema(format!("invalid task graph JSON: {}", e)))?;
        Self::new(wire.tasks)
    }

    /// All nodes, in planner order.
    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Looks up a node by id.
    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Node ids that `id` depends on.
    pub fn dependencies(&self, id: &str) -> Vec<TaskId> {
        self.node(id).map(|n| n.inputs.clone()).unwrap_or_default()
    }

    /// Node ids that consume `id` as an input.
    pub fn dependents(&self, id: &str) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.inputs.iter().any(|i| i == id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Terminal task ids: the explicitly flagged set when any flag is
    /// present, otherwise the sink set (nodes with no downstream consumer).
    pub fn terminal_ids(&self) -> Vec<TaskId> {
        let flagged: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.terminal)
            .map(|t| t.id.clone())
            .collect();
        if !flagged.is_empty() {
            return flagged;
        }

        let consumed: HashSet<&TaskId> = self.tasks.iter().flat_map(|t| t.inputs.iter()).collect();
        self.tasks
            .iter()
            .filter(|t| !consumed.contains(&t.id))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Topological order of node ids (Kahn's algorithm).
    ///
    /// Validation guarantees acyclicity, so the result always covers every
    /// node.
    pub fn topo_order(&self) -> Vec<TaskId> {
        let mut in_degree: HashMap<&TaskId, usize> =
            self.tasks.iter().map(|t| (&t.id, t.inputs.len())).collect();
        let mut queue: VecDeque<&TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.inputs.is_empty())
            .map(|t| &t.id)
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            for dependent in self.dependents(id) {
                if let Some(deg) = self
                    .tasks
                    .iter()
                    .find(|t| t.id == dependent)
                    .and_then(|t| in_degree.get_mut(&t.id))
                {
                    *deg -= 1;
                    if *deg == 0 {
                        if let Some(node) = self.tasks.iter().find(|t| t.id == dependent) {
                            queue.push_back(&node.id);
                        }
                    }
                }
            }
        }
        order
    }

    /// Inserts a node synthesized at run time (repair directives).
    ///
    /// The node's inputs must reference existing ids, which keeps the
    /// graph acyclic by construction.
    pub fn insert_node(&mut self, node: TaskNode) -> Result<(), GraphError> {
        if self.node(&node.id).is_some() {
            return Err(GraphError::Schema(format!(
                "duplicate task id '{}'",
                node.id
            )));
        }
        for input in &node.inputs {
            if self.node(input).is_none() {
                return Err(GraphError::Schema(format!(
                    "task '{}' references unknown input '{}'",
                    node.id, input
                )));
            }
        }
        self.tasks.push(node);
        Ok(())
    }

    fn validate(&self) -> Result<(), GraphError> {
        if self.tasks.is_empty() {
            return Err(GraphError::Schema("task graph has no tasks".to_string()));
        }

        let mut seen: HashSet<&TaskId> = HashSet::new();
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(GraphError::Schema("empty task id".to_string()));
            }
            if !seen.insert(&task.id) {
                return Err(GraphError::Schema(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }

        for task in &self.tasks {
            for input in &task.inputs {
                if !seen.contains(input) {
                    return Err(GraphError::Schema(format!(
                        "task '{}' references unknown input '{}'",
                        task.id, input
                    )));
                }
                if *input == task.id {
                    return Err(GraphError::Cycle(format!(
                        "task '{}' depends on itself",
                        task.id
                    )));
                }
            }
        }

        // Kahn expansion; leftover nodes sit on a cycle.
        let order = self.topo_order();
        if order.len() != self.tasks.len() {
            let on_cycle: Vec<&str> = self
                .tasks
                .iter()
                .filter(|t| !order.contains(&t.id))
                .map(|t| t.id.as_str())
                .collect();
            return Err(GraphError::Cycle(format!(
                "tasks form a cycle: {}",
                on_cycle.join(", ")
            )));
        }

        if self.terminal_ids().is_empty() {
            return Err(GraphError::Schema(
                "no terminal task: every node is consumed and none is flagged".to_string(),
            ));
        }

        Ok(())
    }
}
