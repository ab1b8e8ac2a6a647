//! Engine: glue between the interface layer and the run machinery.
//!
//! `run` executes a prompt to completion and returns the assembled
//! response; `run_stream` returns the live event channel instead. Either
//! way the sealed run trace is persisted to the journal before the engine
//! returns.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembler::{Assembler, TerminalArtifact};
use crate::config::Settings;
use crate::error::RunError;
use crate::events::RunEvent;
use crate::journal::Journal;
use crate::planner::{PlanOptions, Planner};
use crate::providers::AdapterSet;
use crate::registry::CapabilityRegistry;
use crate::router::Router;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::telemetry::TelemetryRecorder;
use crate::trace::{generate_run_id, RunStats, RunTrace};
use crate::verifier::Verifier;

/// Result of one completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub content: String,
    pub confidence: f64,
    pub source_artifacts: Vec<uuid::Uuid>,
    pub warnings: Vec<String>,
    pub stats: RunStats,
}

/// The orchestration engine.
pub struct Engine {
    settings: Settings,
    planner: Planner,
    scheduler: Scheduler,
    assembler: Assembler,
    journal: Journal,
}

impl Engine {
    /// Builds an engine with production adapters derived from the
    /// configured API keys.
    pub fn from_settings(settings: Settings) -> Result<Self, RunError> {
        settings
            .validate()
            .map_err(|e| RunError::Configuration(e.to_string()))?;
        let adapters = AdapterSet::from_settings(&settings);

        let telemetry = Arc::new(TelemetryRecorder::new());
        let mut registry = match &settings.models_file {
            Some(path) => CapabilityRegistry::from_file(path, Arc::clone(&telemetry))
                .map_err(|e| RunError::Configuration(e.to_string()))?,
            None => CapabilityRegistry::builtin(Arc::clone(&telemetry)),
        };
        registry.retain_providers(&settings.configured_providers());

        Self::with_adapters(settings, registry, adapters)
    }

    /// Builds an engine over an explicit registry and adapter set; tests
    /// and offline runs inject stubs here.
    pub fn with_adapters(
        settings: Settings,
        registry: CapabilityRegistry,
        adapters: AdapterSet,
    ) -> Result<Self, RunError> {
        if adapters.is_empty() {
            return Err(RunError::Configuration(
                "no provider adapters available".to_string(),
            ));
        }
        if registry.descriptors().is_empty() {
            return Err(RunError::Configuration(
                "no models available for the configured providers".to_string(),
            ));
        }
        let registry = Arc::new(registry);

        // The planner model must resolve to an adapter; fall back to the
        // strongest available general model when the configured one is not
        // in the retained table.
        let planner_model = match registry.descriptor(&settings.planner_model) {
            Some(descriptor) => descriptor.clone(),
            None => {
                let fallback = registry
                    .descriptors()
                    .iter()
                    .max_by(|a, b| {
                        a.skill(crate::graph::TaskKind::General)
                            .partial_cmp(&b.skill(crate::graph::TaskKind::General))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned()
                    .ok_or_else(|| {
                        RunError::Configuration("registry has no models".to_string())
                    })?;
                tracing::warn!(
                    configured = %settings.planner_model,
                    using = %fallback.model_id,
                    "Planner model not available, substituting"
                );
                fallback
            }
        };
        let planner_adapter = adapters.get(&planner_model.provider_id).ok_or_else(|| {
            RunError::Configuration(format!(
                "no adapter for planner provider '{}'",
                planner_model.provider_id
            ))
        })?;

        let planner = Planner::new(
            Arc::clone(&planner_adapter),
            planner_model.model_id.clone(),
            settings.planner_temperature,
            settings.planner_max_tokens,
        );
        let assembler =
            Assembler::with_synthesizer(planner_adapter, planner_model.model_id.clone());

        let router = Router::with_overrides(
            Arc::clone(&registry),
            settings.routing_overrides.clone(),
        );
        let verifier = settings.verify.then(Verifier::heuristic);
        let scheduler = Scheduler::new(
            router,
            adapters,
            Arc::clone(&registry),
            verifier,
            SchedulerConfig::from_settings(&settings),
        );
        let journal = Journal::new(settings.data_dir.clone());

        Ok(Self {
            settings,
            planner,
            scheduler,
            assembler,
            journal,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs a prompt to completion, discarding the event stream.
    pub async fn run(&self, prompt: &str, options: PlanOptions) -> Result<RunOutcome, RunError> {
        self.run_cancellable(prompt, options, CancellationToken::new())
            .await
    }

    /// Like [`run`], with an external cancellation token.
    ///
    /// [`run`]: Engine::run
    pub async fn run_cancellable(
        &self,
        prompt: &str,
        options: PlanOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let (tx, mut rx) = mpsc::channel(self.settings.event_buffer);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = self.run_inner(prompt, options, tx, cancel).await;
        let _ = drain.await;
        result
    }

    /// Starts a run and returns its live event stream plus a handle to the
    /// final outcome. The channel is bounded; a slow consumer backpressures
    /// the run.
    pub fn run_stream(
        self: &Arc<Self>,
        prompt: String,
        options: PlanOptions,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<RunEvent>,
        JoinHandle<Result<RunOutcome, RunError>>,
    ) {
        let (tx, rx) = mpsc::channel(self.settings.event_buffer);
        let engine = Arc::clone(self);
        let handle =
            tokio::spawn(async move { engine.run_inner(&prompt, options, tx, cancel).await });
        (rx, handle)
    }

    /// Rehydrates a persisted run trace; no LLM calls are made.
    pub async fn replay(&self, run_id: &str) -> Result<RunTrace, RunError> {
        Ok(self.journal.get_trace(run_id).await?)
    }

    async fn run_inner(
        &self,
        prompt: &str,
        options: PlanOptions,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let graph = self.planner.plan(prompt, &options, cancel.clone()).await?;

        let run_id = generate_run_id();
        let trace = RunTrace::open(&run_id, prompt, graph);
        // Terminal set fixed before any repair nodes join the graph.
        let terminals = trace.graph.terminal_ids();

        let _ = events
            .send(RunEvent::Plan {
                run_id: run_id.clone(),
                task_count: trace.graph.len(),
                task_ids: trace.graph.tasks().iter().map(|t| t.id.clone()).collect(),
            })
            .await;

        tracing::info!(
            run_id = %run_id,
            tasks = trace.graph.len(),
            terminals = terminals.len(),
            "Run started"
        );

        let scheduled = self
            .scheduler
            .execute(trace, events.clone(), cancel.clone())
            .await;
        let mut trace = scheduled.trace;

        if let Some(fatal) = scheduled.fatal {
            trace.seal();
            self.journal.persist(&trace).await?;
            return Err(RunError::Configuration(fatal));
        }

        // Terminal artifacts in topological post-order.
        let order = trace.graph.topo_order();
        let done_terminals: Vec<TerminalArtifact> = order
            .iter()
            .filter(|id| terminals.contains(*id))
            .filter(|id| !trace.failures.iter().any(|f| &f.task_id == *id))
            .filter_map(|id| {
                let artifact = trace.latest_artifact_for(id)?.clone();
                let kind = trace.graph.node(id)?.kind;
                let score = trace
                    .latest_verdict_for(id)
                    .map(|v| v.score)
                    .unwrap_or(1.0);
                Some(TerminalArtifact {
                    artifact,
                    kind,
                    score,
                })
            })
            .collect();

        if cancel.is_cancelled() && done_terminals.len() < terminals.len() {
            trace.seal();
            self.journal.persist(&trace).await?;
            return Err(RunError::Cancelled);
        }

        if done_terminals.is_empty() {
            let summary = trace
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.task_id, f.reason))
                .collect::<Vec<_>>()
                .join("; ");
            trace.seal();
            self.journal.persist(&trace).await?;
            return Err(RunError::AllCandidatesFailed { summary });
        }

        let strategy = Assembler::select_strategy(&done_terminals);
        let _ = events
            .send(RunEvent::AssembleStart {
                strategy: strategy.as_str().to_string(),
                artifact_count: done_terminals.len(),
            })
            .await;

        let mut response = self.assembler.assemble(&done_terminals, cancel).await;

        // Partial failure: surface per-task warnings and scale confidence
        // by terminal coverage.
        if !trace.failures.is_empty() {
            for failure in &trace.failures {
                response
                    .warnings
                    .push(format!("task '{}' failed: {}", failure.task_id, failure.reason));
            }
            response.confidence *= done_terminals.len() as f64 / terminals.len().max(1) as f64;
        }

        let _ = events
            .send(RunEvent::Final {
                content: response.content.clone(),
                confidence: response.confidence,
                source_artifacts: response.source_artifacts.clone(),
            })
            .await;

        trace.response = Some(response.clone());
        trace.seal();

        let _ = events
            .send(RunEvent::Stats {
                stats: trace.stats.clone(),
            })
            .await;

        self.journal.persist(&trace).await?;

        tracing::info!(
            run_id = %run_id,
            wall_time_ms = trace.stats.wall_time_ms,
            executed = trace.stats.tasks_executed,
            repaired = trace.stats.tasks_repaired,
            failed = trace.stats.tasks_failed,
            "Run finished"
        );

        Ok(RunOutcome {
            run_id,
            content: response.content,
            confidence: response.confidence,
            source_artifacts: response.source_artifacts,
            warnings: response.warnings,
            stats: trace.stats,
        })
    }
}
