//! Assembles terminal artifacts into a single response.
//!
//! Strategy selection: one terminal artifact takes `best_single`; several
//! of the same kind concatenate in topological post-order; mixed kinds are
//! merged with one synthesis LLM call.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::graph::TaskKind;
use crate::providers::{CompletionRequest, ProviderAdapter};
use crate::trace::{Artifact, AssembledResponse};

/// Assembly strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStrategy {
    Concatenate,
    BestSingle,
    Synthesize,
}

impl AssemblyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyStrategy::Concatenate => "concatenate",
            AssemblyStrategy::BestSingle => "best_single",
            AssemblyStrategy::Synthesize => "synthesize",
        }
    }
}

/// One terminal artifact with its verdict score.
#[derive(Debug, Clone)]
pub struct TerminalArtifact {
    pub artifact: Artifact,
    pub kind: TaskKind,
    /// Verdict score; 1.0 when verification is disabled.
    pub score: f64,
}

/// Terminal-artifact merger.
pub struct Assembler {
    /// Adapter + model for the synthesis strategy; absent in offline
    /// setups, where synthesis degrades to concatenation.
    synth: Option<(Arc<dyn ProviderAdapter>, String)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self { synth: None }
    }

    pub fn with_synthesizer(adapter: Arc<dyn ProviderAdapter>, model_id: impl Into<String>) -> Self {
        Self {
            synth: Some((adapter, model_id.into())),
        }
    }

    /// Picks the strategy for a terminal set.
    pub fn select_strategy(inputs: &[TerminalArtifact]) -> AssemblyStrategy {
        if inputs.len() <= 1 {
            return AssemblyStrategy::BestSingle;
        }
        let first_kind = inputs[0].kind;
        if inputs.iter().all(|i| i.kind == first_kind) {
            AssemblyStrategy::Concatenate
        } else {
            AssemblyStrategy::Synthesize
        }
    }

    /// Merges terminal artifacts; `inputs` must already be in topological
    /// post-order.
    pub async fn assemble(
        &self,
        inputs: &[TerminalArtifact],
        cancel: CancellationToken,
    ) -> AssembledResponse {
        let strategy = Self::select_strategy(inputs);
        let source_artifacts = inputs.iter().map(|i| i.artifact.artifact_id).collect();
        let confidence = if inputs.is_empty() {
            0.0
        } else {
            inputs.iter().map(|i| i.score).sum::<f64>() / inputs.len() as f64
        };

        match strategy {
            AssemblyStrategy::BestSingle => {
                let best = inputs.iter().max_by(|a, b| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                AssembledResponse {
                    content: best.map(|b| b.artifact.content.clone()).unwrap_or_default(),
                    confidence: best.map(|b| b.score).unwrap_or(0.0),
                    source_artifacts: best.map(|b| vec![b.artifact.artifact_id]).unwrap_or_default(),
                    warnings: Vec::new(),
                }
            }
            AssemblyStrategy::Concatenate => AssembledResponse {
                content: concatenate(inputs),
                confidence,
                source_artifacts,
                warnings: Vec::new(),
            },
            AssemblyStrategy::Synthesize => match self.synthesize(inputs, cancel).await {
                Ok(content) => AssembledResponse {
                    content,
                    confidence,
                    source_artifacts,
                    warnings: Vec::new(),
                },
                Err(warning) => {
                    tracing::warn!(warning = %warning, "Synthesis unavailable, concatenating");
                    AssembledResponse {
                        content: concatenate(inputs),
                        confidence,
                        source_artifacts,
                        warnings: vec![warning],
                    }
                }
            },
        }
    }

    async fn synthesize(
        &self,
        inputs: &[TerminalArtifact],
        cancel: CancellationToken,
    ) -> Result<String, String> {
        let (adapter, model_id) = self
            .synth
            .as_ref()
            .ok_or_else(|| "no synthesis model configured".to_string())?;

        let mut prompt = String::from(
            "Merge the following partial results into one coherent response. \
             Preserve all substantive content; do not mention the merging.\n",
        );
        for (i, input) in inputs.iter().enumerate() {
            prompt.push_str(&format!(
                "\n--- Part {} ({}) ---\n{}\n",
                i + 1,
                input.kind,
                input.artifact.content
            ));
        }

        let request = CompletionRequest::new(model_id, prompt).with_temperature(0.2);
        adapter
            .execute(request, cancel)
            .await
            .map(|c| c.content)
            .map_err(|e| format!("synthesis call failed: {}", e))
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

fn concatenate(inputs: &[TerminalArtifact]) -> String {
    inputs
        .iter()
        .map(|i| i.artifact.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
