//! LLM planner: turns a user prompt into a validated task graph.
//!
//! One designated model is asked for a JSON document in the canonical
//! task-graph shape. The budget is two attempts: the second attempt
//! includes a corrective message listing the first attempt's violations.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::{PlanError, ProviderError};
use crate::graph::{GraphError, TaskGraph, TaskKind};
use crate::providers::{CompletionRequest, ProviderAdapter};

/// Attempt budget for one planning call.
const MAX_PLAN_ATTEMPTS: u32 = 2;

/// Fixed system prompt demanding the canonical JSON shape.
const PLANNER_SYSTEM_PROMPT: &str = r#"You are a task planner. Decompose the user's request into a directed acyclic graph of subtasks and output ONLY a JSON document of this exact shape:

{
  "tasks": [
    { "id": "t1", "kind": "<task-kind>", "prompt": "string",
      "inputs": ["t0"], "criteria": ["checkable statement"],
      "features": ["streaming"|"long_context"|"vision"|"function_calling"],
      "min_context": 0, "repair_budget": 1, "terminal": false }
  ]
}

Rules:
- "kind" must be one of: coding, creative_writing, professional_writing, document_processing, automation, summarization, data_analysis, multimodal, integration, mathematical_reasoning, realtime_social, creative_insight, general.
- "inputs" may only reference ids of other tasks; no cycles.
- Mark the task(s) whose output answers the user with "terminal": true, or leave exactly one sink task.
- A single-task graph is fine for simple requests.
- Output the JSON document and nothing else."#;

/// Per-call planning options.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Overrides the configured planner temperature.
    pub temperature: Option<f64>,
    /// Overrides the configured planner token ceiling.
    pub max_tokens: Option<u32>,
}

/// Prompt-to-graph planner backed by one LLM.
pub struct Planner {
    adapter: Arc<dyn ProviderAdapter>,
    model_id: String,
    temperature: f64,
    max_tokens: u32,
}

impl Planner {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        model_id: impl Into<String>,
        temperature: f64,
        max_tokens: u32,
    ) -> Self {
        Self {
            adapter,
            model_id: model_id.into(),
            temperature,
            max_tokens,
        }
    }

    /// Plans a task graph for the prompt.
    pub async fn plan(
        &self,
        prompt: &str,
        options: &PlanOptions,
        cancel: CancellationToken,
    ) -> Result<TaskGraph, PlanError> {
        let mut violation: Option<String> = None;

        for attempt in 1..=MAX_PLAN_ATTEMPTS {
            let user_message = match &violation {
                None => prompt.to_string(),
                Some(problem) => format!(
                    "{}\n\nYour previous task graph was rejected for the following \
                     violations:\n- {}\nEmit a corrected JSON document.",
                    prompt, problem
                ),
            };

            let request = CompletionRequest::new(&self.model_id, user_message)
                .with_system(PLANNER_SYSTEM_PROMPT)
                .with_temperature(options.temperature.unwrap_or(self.temperature))
                .with_max_tokens(options.max_tokens.unwrap_or(self.max_tokens));

            let completion = self
                .adapter
                .execute(request, cancel.clone())
                .await
                .map_err(|e: ProviderError| PlanError::UpstreamLlm(e.to_string()))?;

            let json = unfence(&completion.content);
            match TaskGraph::parse(json) {
                Ok(graph) => {
                    tracing::info!(
                        attempt,
                        tasks = graph.len(),
                        model = %self.model_id,
                        "Planned task graph"
                    );
                    return Ok(graph);
                }
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "Planner output rejected"
                    );
                    if attempt == MAX_PLAN_ATTEMPTS {
                        return Err(match err {
                            GraphError::Schema(msg) => PlanError::Schema(msg),
                            GraphError::Cycle(msg) => PlanError::Cycle(msg),
                        });
                    }
                    violation = Some(err.to_string());
                }
            }
        }

        unreachable!("plan attempt loop always returns")
    }

    /// Kinds advertised to the planner; exposed for prompt tests.
    pub fn known_kinds() -> &'static [TaskKind] {
        TaskKind::all()
    }
}

/// Strips a Markdown code fence and leading chatter around the JSON body.
fn unfence(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    // Fall back to the outermost braces.
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(open), Some(close)) if close > open => &trimmed[open..=close],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StubAdapter;

    const VALID_GRAPH: &str = r#"{"tasks": [
        {"id": "t1", "kind": "general", "prompt": "answer", "terminal": true}
    ]}"#;

    fn planner(adapter: Arc<StubAdapter>) -> Planner {
        Planner::new(adapter, "planner-model", 0.0, 4096)
    }

    #[tokio::test]
    async fn test_plan_accepts_valid_graph() {
        let adapter = Arc::new(StubAdapter::new("stub"));
        adapter.push_response("planner-model", Ok(VALID_GRAPH.to_string()));

        let graph = planner(Arc::clone(&adapter))
            .plan("What is 2+2?", &PlanOptions::default(), CancellationToken::new())
            .await
            .expect("valid graph");
        assert_eq!(graph.len(), 1);
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_plan_accepts_fenced_json() {
        let adapter = Arc::new(StubAdapter::new("stub"));
        adapter.push_response(
            "planner-model",
            Ok(format!("Here is the plan:\n```json\n{}\n```", VALID_GRAPH)),
        );

        let graph = planner(adapter)
            .plan("hi", &PlanOptions::default(), CancellationToken::new())
            .await
            .expect("fenced graph parses");
        assert_eq!(graph.len(), 1);
    }

    #[tokio::test]
    async fn test_plan_retries_with_corrective_message() {
        let adapter = Arc::new(StubAdapter::new("stub"));
        adapter.push_response("planner-model", Ok("not json at all".to_string()));
        adapter.push_response("planner-model", Ok(VALID_GRAPH.to_string()));

        let graph = planner(Arc::clone(&adapter))
            .plan("hi", &PlanOptions::default(), CancellationToken::new())
            .await
            .expect("second attempt succeeds");
        assert_eq!(graph.len(), 1);

        let calls = adapter.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1.contains("rejected for the following violations"));
    }

    #[tokio::test]
    async fn test_plan_fails_after_two_attempts() {
        let adapter = Arc::new(StubAdapter::new("stub"));
        adapter.push_response("planner-model", Ok("garbage".to_string()));
        adapter.push_response("planner-model", Ok("more garbage".to_string()));

        let result = planner(Arc::clone(&adapter))
            .plan("hi", &PlanOptions::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PlanError::Schema(_))));
        assert_eq!(adapter.call_count(), 2);
    }

    #[tokio::test]
    async fn test_plan_surfaces_cycles() {
        let cyclic = r#"{"tasks": [
            {"id": "a", "kind": "general", "prompt": "x", "inputs": ["b"]},
            {"id": "b", "kind": "general", "prompt": "y", "inputs": ["a"]}
        ]}"#;
        let adapter = Arc::new(StubAdapter::new("stub"));
        adapter.push_response("planner-model", Ok(cyclic.to_string()));
        adapter.push_response("planner-model", Ok(cyclic.to_string()));

        let result = planner(adapter)
            .plan("hi", &PlanOptions::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PlanError::Cycle(_))));
    }

    #[tokio::test]
    async fn test_plan_maps_provider_failure() {
        let adapter = Arc::new(StubAdapter::new("stub"));
        adapter.push_response(
            "planner-model",
            Err(crate::error::ProviderError::Permanent("down".to_string())),
        );

        let result = planner(adapter)
            .plan("hi", &PlanOptions::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PlanError::UpstreamLlm(_))));
    }

    #[test]
    fn test_unfence_variants() {
        assert_eq!(unfence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(unfence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(unfence("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(unfence("Sure thing: {\"a\":1} done"), "{\"a\":1}");
    }
}
