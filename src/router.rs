//! Scored provider selection over registry candidates.
//!
//! The router ranks every eligible (model, provider) pair for a task by a
//! weighted blend of static skill, rolling performance, cost efficiency,
//! context fit and feature coverage. The returned list is consumed in
//! order across repair/fallback cycles, so rank 0 is the first binding and
//! later ranks are the fallback chain.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RouteError;
use crate::graph::{TaskKind, TaskNode};
use crate::registry::{CapabilityRegistry, ModelDescriptor};

/// Scoring weights; they sum to 1.0.
const W_SKILL: f64 = 0.50;
const W_PERF: f64 = 0.20;
const W_COST: f64 = 0.15;
const W_CONTEXT: f64 = 0.10;
const W_FEAT: f64 = 0.05;

/// One ranked routing choice.
#[derive(Debug, Clone)]
pub struct RoutedCandidate {
    pub descriptor: ModelDescriptor,
    pub score: f64,
}

impl RoutedCandidate {
    pub fn model_id(&self) -> &str {
        &self.descriptor.model_id
    }

    pub fn provider_id(&self) -> &str {
        &self.descriptor.provider_id
    }
}

/// Task router over a capability registry.
pub struct Router {
    registry: Arc<CapabilityRegistry>,
    /// Pinning table: kind -> model id moved to rank 0 when eligible.
    overrides: HashMap<TaskKind, String>,
}

impl Router {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            overrides: HashMap::new(),
        }
    }

    pub fn with_overrides(
        registry: Arc<CapabilityRegistry>,
        overrides: HashMap<TaskKind, String>,
    ) -> Self {
        Self {
            registry,
            overrides,
        }
    }

    /// Ranks every eligible candidate for the task, best first.
    ///
    /// An override pin reorders the list; it never removes candidates, so
    /// the fallback chain behind a pinned model stays intact.
    pub fn route(&self, task: &TaskNode) -> Result<Vec<RoutedCandidate>, RouteError> {
        let candidates = self.registry.candidates(task);
        if candidates.is_empty() {
            return Err(RouteError::NoCandidate {
                task_id: task.id.clone(),
                reason: format!(
                    "no model covers features {:?} with context >= {}",
                    task.required_features, task.min_context_tokens
                ),
            });
        }

        let max_cost = candidates
            .iter()
            .map(|c| c.descriptor.cost_per_1k())
            .fold(f64::MIN, f64::max);
        let max_latency = candidates
            .iter()
            .map(|c| c.avg_latency_ms)
            .fold(f64::MIN, f64::max);

        let mut ranked: Vec<RoutedCandidate> = candidates
            .into_iter()
            .map(|c| {
                let skill = c.descriptor.skill(task.kind);

                let lat_norm = if max_latency > 0.0 {
                    (c.avg_latency_ms / max_latency).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let perf = 0.7 * c.success_rate + 0.3 * (1.0 - lat_norm);

                let cost_eff = if max_cost > 0.0 {
                    1.0 - (c.descriptor.cost_per_1k() / max_cost).clamp(0.0, 1.0)
                } else {
                    1.0
                };

                let context_fit = (c.descriptor.context_window as f64
                    / task.min_context_tokens.max(1) as f64)
                    .min(1.0);

                let required = task.required_features.len();
                let covered = task
                    .required_features
                    .iter()
                    .filter(|f| c.descriptor.supported_features.contains(f))
                    .count();
                let feat = covered as f64 / required.max(1) as f64;

                let mut score = W_SKILL * skill
                    + W_PERF * perf
                    + W_COST * cost_eff
                    + W_CONTEXT * context_fit
                    + W_FEAT * feat;
                if let Some(weight) = c.descriptor.weight_override {
                    score *= weight;
                }

                RoutedCandidate {
                    descriptor: c.descriptor,
                    score,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.descriptor
                        .cost_per_1k()
                        .partial_cmp(&b.descriptor.cost_per_1k())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.descriptor.model_id.cmp(&b.descriptor.model_id))
        });

        if let Some(pinned) = self.overrides.get(&task.kind) {
            if let Some(pos) = ranked.iter().position(|c| c.model_id() == pinned) {
                let candidate = ranked.remove(pos);
                ranked.insert(0, candidate);
            }
        }

        tracing::debug!(
            task_id = %task.id,
            kind = %task.kind,
            top = %ranked[0].model_id(),
            candidates = ranked.len(),
            "Routed task"
        );

        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Feature;
    use crate::telemetry::{ExecutionOutcome, TelemetryRecorder};

    const TEST_MODELS: &str = r#"
models:
  - model_id: alpha
    provider_id: p1
    context_window: 100000
    cost_per_1k_input: 0.010
    cost_per_1k_output: 0.030
    supported_features: [streaming, long_context]
    skills:
      coding: 0.9
      general: 0.8
  - model_id: beta
    provider_id: p2
    context_window: 32000
    cost_per_1k_input: 0.001
    cost_per_1k_output: 0.002
    supported_features: [streaming]
    skills:
      coding: 0.6
      general: 0.7
  - model_id: gamma
    provider_id: p1
    context_window: 100000
    cost_per_1k_input: 0.010
    cost_per_1k_output: 0.030
    supported_features: [streaming, long_context]
    skills:
      coding: 0.9
      general: 0.8
"#;

    fn router_with(
        overrides: HashMap<TaskKind, String>,
    ) -> (Router, Arc<TelemetryRecorder>) {
        let telemetry = Arc::new(TelemetryRecorder::new());
        let registry = Arc::new(
            CapabilityRegistry::from_yaml(TEST_MODELS, Arc::clone(&telemetry)).expect("valid"),
        );
        (Router::with_overrides(registry, overrides), telemetry)
    }

    fn coding_task() -> TaskNode {
        TaskNode::new("t1", TaskKind::Coding, "write code")
    }

    #[test]
    fn test_route_ranks_by_skill() {
        let (router, _) = router_with(HashMap::new());
        let ranked = router.route(&coding_task()).expect("candidates");
        assert_eq!(ranked.len(), 3);
        // alpha and gamma tie on score; beta's lower skill loses despite
        // being cheapest.
        assert_ne!(ranked[2].model_id(), "alpha");
        assert_ne!(ranked[2].model_id(), "gamma");
    }

    #[test]
    fn test_tie_breaks_lexicographic() {
        let (router, _) = router_with(HashMap::new());
        let ranked = router.route(&coding_task()).expect("candidates");
        // alpha and gamma are identical except for id.
        let alpha_pos = ranked.iter().position(|c| c.model_id() == "alpha").unwrap();
        let gamma_pos = ranked.iter().position(|c| c.model_id() == "gamma").unwrap();
        assert!(alpha_pos < gamma_pos);
    }

    #[test]
    fn test_feature_filter_yields_no_candidate() {
        let (router, _) = router_with(HashMap::new());
        let mut task = coding_task();
        task.required_features.insert(Feature::Vision);
        assert!(matches!(
            router.route(&task),
            Err(RouteError::NoCandidate { .. })
        ));
    }

    #[test]
    fn test_context_filter() {
        let (router, _) = router_with(HashMap::new());
        let mut task = coding_task();
        task.min_context_tokens = 50_000;
        let ranked = router.route(&task).expect("candidates");
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|c| c.model_id() != "beta"));
    }

    #[test]
    fn test_override_reorders_without_removing() {
        let mut overrides = HashMap::new();
        overrides.insert(TaskKind::Coding, "beta".to_string());
        let (router, _) = router_with(overrides);

        let ranked = router.route(&coding_task()).expect("candidates");
        assert_eq!(ranked[0].model_id(), "beta");
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn test_override_for_absent_model_is_inert() {
        let mut overrides = HashMap::new();
        overrides.insert(TaskKind::Coding, "ghost".to_string());
        let (router, _) = router_with(overrides);

        let ranked = router.route(&coding_task()).expect("candidates");
        assert_eq!(ranked.len(), 3);
        assert_ne!(ranked[0].model_id(), "ghost");
    }

    #[test]
    fn test_telemetry_shifts_ranking() {
        let (router, telemetry) = router_with(HashMap::new());

        // Hammer alpha with failures; gamma stays on the neutral prior.
        for _ in 0..20 {
            telemetry.record(ExecutionOutcome {
                model_id: "alpha".to_string(),
                success: false,
                latency_ms: 2_000,
                tokens_in: 10,
                tokens_out: 10,
                cost: 0.001,
            });
        }

        let ranked = router.route(&coding_task()).expect("candidates");
        let alpha_pos = ranked.iter().position(|c| c.model_id() == "alpha").unwrap();
        let gamma_pos = ranked.iter().position(|c| c.model_id() == "gamma").unwrap();
        assert!(gamma_pos < alpha_pos);
    }

    #[test]
    fn test_scores_within_unit_interval() {
        let (router, _) = router_with(HashMap::new());
        let ranked = router.route(&coding_task()).expect("candidates");
        for c in &ranked {
            assert!(c.score >= 0.0 && c.score <= 1.0, "score {}", c.score);
        }
    }
}
