//! Capability registry: static model descriptors merged with live telemetry.
//!
//! Descriptors are loaded once from a declarative YAML document (a built-in
//! table, overridable by a file) and are immutable afterwards. Every
//! `candidates` query re-merges the current telemetry window, so scores are
//! never cached. The registry never blocks execution: models without any
//! samples get a neutral prior instead of being penalized during bring-up.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{Feature, TaskKind, TaskNode};
use crate::telemetry::{ExecutionOutcome, TelemetryRecorder};

/// Neutral latency used when no model has any samples yet.
const NEUTRAL_LATENCY_MS: f64 = 1_000.0;

/// Errors that can occur while loading the descriptor table.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid descriptor table: {0}")]
    Invalid(String),
}

/// Static description of one model offered by one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub provider_id: String,
    /// Task-kind skill scores in [0, 1]; unknown kinds default to 0.5.
    #[serde(default)]
    pub skills: HashMap<TaskKind, f64>,
    /// Context window in tokens.
    pub context_window: u32,
    pub cost_per_1k_input: f64,
    pub cost_per_1k_output: f64,
    #[serde(default)]
    pub supported_features: BTreeSet<Feature>,
    /// Optional multiplier applied to the final routing score.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub weight_override: Option<f64>,
}

impl ModelDescriptor {
    /// Skill for a task kind, defaulting to 0.5 when unknown.
    pub fn skill(&self, kind: TaskKind) -> f64 {
        self.skills.get(&kind).copied().unwrap_or(0.5)
    }

    /// Blended per-1k cost used for tie-breaking and cost efficiency.
    pub fn cost_per_1k(&self) -> f64 {
        (self.cost_per_1k_input + self.cost_per_1k_output) / 2.0
    }

    /// Whether this model covers every required feature.
    pub fn covers(&self, required: &BTreeSet<Feature>) -> bool {
        required.iter().all(|f| self.supported_features.contains(f))
    }

    /// Estimated dollar cost of one execution.
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 / 1_000.0) * self.cost_per_1k_input
            + (output_tokens as f64 / 1_000.0) * self.cost_per_1k_output
    }
}

/// A descriptor merged with its current telemetry view.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub descriptor: ModelDescriptor,
    /// Laplace-smoothed success rate, or the neutral 1.0 prior when the
    /// model has zero samples.
    pub success_rate: f64,
    /// Windowed mean latency, or the median of sampled models when absent.
    pub avg_latency_ms: f64,
}

#[derive(Debug, Deserialize)]
struct DescriptorTable {
    models: Vec<ModelDescriptor>,
}

/// Built-in descriptor table for the three first-party provider families.
const DEFAULT_MODELS_YAML: &str = r#"
models:
  - model_id: claude-opus-4-1
    provider_id: anthropic
    context_window: 200000
    cost_per_1k_input: 0.015
    cost_per_1k_output: 0.075
    supported_features: [streaming, long_context, vision, function_calling]
    skills:
      coding: 0.95
      creative_writing: 0.92
      professional_writing: 0.93
      document_processing: 0.90
      automation: 0.88
      summarization: 0.90
      data_analysis: 0.91
      mathematical_reasoning: 0.92
      creative_insight: 0.90
      integration: 0.87
      general: 0.93
  - model_id: claude-sonnet-4-5
    provider_id: anthropic
    context_window: 200000
    cost_per_1k_input: 0.003
    cost_per_1k_output: 0.015
    supported_features: [streaming, long_context, vision, function_calling]
    skills:
      coding: 0.93
      creative_writing: 0.88
      professional_writing: 0.90
      document_processing: 0.89
      automation: 0.87
      summarization: 0.89
      data_analysis: 0.88
      mathematical_reasoning: 0.88
      creative_insight: 0.85
      integration: 0.86
      general: 0.90
  - model_id: claude-haiku-3-5
    provider_id: anthropic
    context_window: 200000
    cost_per_1k_input: 0.0008
    cost_per_1k_output: 0.004
    supported_features: [streaming, long_context, function_calling]
    skills:
      coding: 0.78
      summarization: 0.84
      document_processing: 0.80
      realtime_social: 0.82
      general: 0.80
  - model_id: gpt-4o
    provider_id: openai
    context_window: 128000
    cost_per_1k_input: 0.0025
    cost_per_1k_output: 0.01
    supported_features: [streaming, long_context, vision, function_calling]
    skills:
      coding: 0.88
      creative_writing: 0.86
      professional_writing: 0.88
      document_processing: 0.86
      automation: 0.85
      summarization: 0.87
      data_analysis: 0.87
      mathematical_reasoning: 0.86
      multimodal: 0.88
      general: 0.88
  - model_id: gpt-4o-mini
    provider_id: openai
    context_window: 128000
    cost_per_1k_input: 0.00015
    cost_per_1k_output: 0.0006
    supported_features: [streaming, long_context, function_calling]
    skills:
      coding: 0.75
      summarization: 0.80
      realtime_social: 0.78
      general: 0.78
  - model_id: o3-mini
    provider_id: openai
    context_window: 200000
    cost_per_1k_input: 0.0011
    cost_per_1k_output: 0.0044
    supported_features: [streaming, long_context, function_calling]
    skills:
      coding: 0.90
      mathematical_reasoning: 0.93
      data_analysis: 0.89
      general: 0.84
  - model_id: grok-3
    provider_id: xai
    context_window: 131072
    cost_per_1k_input: 0.003
    cost_per_1k_output: 0.015
    supported_features: [streaming, long_context, function_calling]
    skills:
      coding: 0.85
      creative_writing: 0.84
      realtime_social: 0.92
      creative_insight: 0.88
      data_analysis: 0.84
      general: 0.85
  - model_id: grok-3-mini
    provider_id: xai
    context_window: 131072
    cost_per_1k_input: 0.0003
    cost_per_1k_output: 0.0005
    supported_features: [streaming, function_calling]
    skills:
      realtime_social: 0.86
      summarization: 0.78
      general: 0.76
"#;

/// Process-wide registry of model descriptors.
pub struct CapabilityRegistry {
    descriptors: Vec<ModelDescriptor>,
    telemetry: Arc<TelemetryRecorder>,
}

impl CapabilityRegistry {
    /// Loads the built-in descriptor table.
    pub fn builtin(telemetry: Arc<TelemetryRecorder>) -> Self {
        Self::from_yaml(DEFAULT_MODELS_YAML, telemetry)
            .expect("built-in descriptor table must parse")
    }

    /// Loads descriptors from a YAML document.
    pub fn from_yaml(
        yaml: &str,
        telemetry: Arc<TelemetryRecorder>,
    ) -> Result<Self, RegistryError> {
        let table: DescriptorTable = serde_yaml::from_str(yaml)?;
        if table.models.is_empty() {
            return Err(RegistryError::Invalid("no models in table".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for descriptor in &table.models {
            if !seen.insert(descriptor.model_id.clone()) {
                return Err(RegistryError::Invalid(format!(
                    "duplicate model id '{}'",
                    descriptor.model_id
                )));
            }
            for (kind, skill) in &descriptor.skills {
                if !(0.0..=1.0).contains(skill) {
                    return Err(RegistryError::Invalid(format!(
                        "skill {} for '{}' outside [0, 1]",
                        kind, descriptor.model_id
                    )));
                }
            }
        }
        Ok(Self {
            descriptors: table.models,
            telemetry,
        })
    }

    /// Loads descriptors from a YAML file.
    pub fn from_file(
        path: &Path,
        telemetry: Arc<TelemetryRecorder>,
    ) -> Result<Self, RegistryError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml, telemetry)
    }

    /// Restricts the table to the given provider ids (those with keys).
    pub fn retain_providers(&mut self, providers: &[&str]) {
        self.descriptors
            .retain(|d| providers.contains(&d.provider_id.as_str()));
    }

    /// The full static table.
    pub fn descriptors(&self) -> &[ModelDescriptor] {
        &self.descriptors
    }

    /// Looks up a descriptor by model id.
    pub fn descriptor(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.descriptors.iter().find(|d| d.model_id == model_id)
    }

    /// Forwards an execution outcome to telemetry.
    pub fn update(&self, outcome: ExecutionOutcome) {
        self.telemetry.record(outcome);
    }

    /// Eligible candidates for a task, merged with live telemetry on every
    /// call. Ordered by descending static skill; the router's scored
    /// ordering is authoritative.
    pub fn candidates(&self, task: &TaskNode) -> Vec<Candidate> {
        let now = chrono::Utc::now();
        let windows = self.telemetry.windows_at(now);

        // Median latency across sampled models backs the neutral prior.
        let mut sampled: Vec<f64> = windows
            .values()
            .filter_map(|w| w.avg_latency_ms)
            .collect();
        sampled.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median_latency = if sampled.is_empty() {
            NEUTRAL_LATENCY_MS
        } else {
            sampled[sampled.len() / 2]
        };

        let mut candidates: Vec<Candidate> = self
            .descriptors
            .iter()
            .filter(|d| d.covers(&task.required_features))
            .filter(|d| d.context_window >= task.min_context_tokens)
            .map(|d| {
                let stats = windows.get(&d.model_id);
                let (success_rate, avg_latency_ms) = match stats {
                    Some(w) if w.has_samples() => (
                        w.success_rate(),
                        w.avg_latency_ms.unwrap_or(median_latency),
                    ),
                    // Zero samples: neutral prior so unseen models are not
                    // penalized during bring-up.
                    _ => (1.0, median_latency),
                };
                Candidate {
                    descriptor: d.clone(),
                    success_rate,
                    avg_latency_ms,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.descriptor
                .skill(task.kind)
                .partial_cmp(&a.descriptor.skill(task.kind))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskNode;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::builtin(Arc::new(TelemetryRecorder::new()))
    }

    fn task(kind: TaskKind) -> TaskNode {
        TaskNode::new("t1", kind, "prompt")
    }

    #[test]
    fn test_builtin_table_parses() {
        let registry = registry();
        assert!(registry.descriptors().len() >= 6);
        assert!(registry.descriptor("claude-sonnet-4-5").is_some());
        assert!(registry.descriptor("grok-3").is_some());
        assert!(registry.descriptor("nonexistent").is_none());
    }

    #[test]
    fn test_candidates_filter_features() {
        let registry = registry();
        let mut task = task(TaskKind::Multimodal);
        task.required_features.insert(Feature::Vision);

        let candidates = registry.candidates(&task);
        assert!(!candidates.is_empty());
        for c in &candidates {
            assert!(c.descriptor.supported_features.contains(&Feature::Vision));
        }
    }

    #[test]
    fn test_candidates_filter_context_window() {
        let registry = registry();
        let mut task = task(TaskKind::General);
        task.min_context_tokens = 150_000;

        let candidates = registry.candidates(&task);
        assert!(!candidates.is_empty());
        for c in &candidates {
            assert!(c.descriptor.context_window >= 150_000);
        }
    }

    #[test]
    fn test_unsampled_models_get_neutral_prior() {
        let registry = registry();
        let candidates = registry.candidates(&task(TaskKind::General));
        for c in &candidates {
            assert!((c.success_rate - 1.0).abs() < f64::EPSILON);
            assert!((c.avg_latency_ms - NEUTRAL_LATENCY_MS).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_telemetry_merged_on_query() {
        let telemetry = Arc::new(TelemetryRecorder::new());
        let registry = CapabilityRegistry::builtin(Arc::clone(&telemetry));

        registry.update(ExecutionOutcome {
            model_id: "gpt-4o".to_string(),
            success: false,
            latency_ms: 400,
            tokens_in: 10,
            tokens_out: 10,
            cost: 0.001,
        });

        let candidates = registry.candidates(&task(TaskKind::General));
        let gpt = candidates
            .iter()
            .find(|c| c.descriptor.model_id == "gpt-4o")
            .expect("gpt-4o eligible");
        // Laplace over one failure: (0 + 1) / (1 + 2).
        assert!((gpt.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((gpt.avg_latency_ms - 400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_candidates_ordered_by_skill() {
        let registry = registry();
        let candidates = registry.candidates(&task(TaskKind::Coding));
        let skills: Vec<f64> = candidates
            .iter()
            .map(|c| c.descriptor.skill(TaskKind::Coding))
            .collect();
        for pair in skills.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }

    #[test]
    fn test_retain_providers() {
        let mut registry = registry();
        registry.retain_providers(&["anthropic"]);
        assert!(registry
            .descriptors()
            .iter()
            .all(|d| d.provider_id == "anthropic"));
        assert!(registry.descriptor("gpt-4o").is_none());
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let telemetry = Arc::new(TelemetryRecorder::new());
        assert!(CapabilityRegistry::from_yaml("models: []", telemetry.clone()).is_err());

        let duplicate = r#"
models:
  - model_id: m
    provider_id: p
    context_window: 1000
    cost_per_1k_input: 0.001
    cost_per_1k_output: 0.002
  - model_id: m
    provider_id: p
    context_window: 1000
    cost_per_1k_input: 0.001
    cost_per_1k_output: 0.002
"#;
        assert!(CapabilityRegistry::from_yaml(duplicate, telemetry).is_err());
    }

    #[test]
    fn test_skill_default() {
        let registry = registry();
        let descriptor = registry.descriptor("grok-3-mini").expect("present");
        // grok-3-mini declares no coding skill; default applies.
        assert!((descriptor.skill(TaskKind::Coding) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_estimate_cost() {
        let registry = registry();
        let descriptor = registry.descriptor("claude-sonnet-4-5").expect("present");
        // 1000 input at 0.003/1k + 1000 output at 0.015/1k.
        let cost = descriptor.estimate_cost(1000, 1000);
        assert!((cost - 0.018).abs() < 1e-9);
    }
}
