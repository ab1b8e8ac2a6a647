//! Task-graph scheduler: dependency-aware parallel execution.
//!
//! The scheduler drives every task through the state machine
//! `pending -> ready -> running -> verifying -> {done, repairing,
//! fallback} -> ... -> {done, failed}` under two admission caps (global
//! and per-provider). A dispatch loop wakes whenever a task becomes
//! ready, an attempt settles, a slot frees, or the run is cancelled; each
//! wake promotes ready tasks and admits as many as the caps allow.
//!
//! Repair directives insert new nodes into the run's graph under the run
//! lock. The repair execution is presented as the next attempt of the
//! original task (same task id in every event) and runs on the original
//! task's slots while it sits in `repairing`, so the admission invariants
//! hold even at `global_max = 1`.

mod slots;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::ProviderError;
use crate::events::RunEvent;
use crate::graph::{TaskId, TaskNode};
use crate::providers::{AdapterSet, Completion, CompletionRequest};
use crate::registry::CapabilityRegistry;
use crate::router::{RoutedCandidate, Router};
use crate::telemetry::ExecutionOutcome;
use crate::trace::{Artifact, ArtifactStatus, Binding, RunTrace, TaskFailure, Verdict};
use crate::verifier::{synthesize_repair_directive, Verifier};

use slots::SlotTable;

/// Per-task scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Verifying,
    Repairing,
    Fallback,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

/// Scheduler limits and knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub global_max: usize,
    pub per_provider_max: usize,
    /// Per-attempt deadline for one adapter call.
    pub attempt_timeout: Duration,
    /// Repair budget for nodes that do not set their own.
    pub default_repair_budget: u32,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            global_max: settings.max_concurrency,
            per_provider_max: settings.max_concurrency_per_provider,
            attempt_timeout: settings.attempt_timeout,
            default_repair_budget: settings.repair_limit,
        }
    }
}

/// Result of one scheduled run.
pub struct SchedulerRun {
    pub trace: RunTrace,
    /// Set when an authentication failure aborted the run.
    pub fatal: Option<String>,
}

struct CurrentAttempt {
    candidate: RoutedCandidate,
    rank: usize,
}

struct TaskRuntime {
    state: TaskState,
    /// Remaining fallback chain, each with its rank in the routed list.
    chain: VecDeque<(usize, RoutedCandidate)>,
    current: Option<CurrentAttempt>,
    attempts_used: u32,
    max_attempts: u32,
    initial_budget: u32,
    remaining_budget: u32,
    repaired: bool,
    holds_global: bool,
    held_provider: Option<String>,
}

impl TaskRuntime {
    fn new(initial_budget: u32) -> Self {
        Self {
            state: TaskState::Pending,
            chain: VecDeque::new(),
            current: None,
            attempts_used: 0,
            max_attempts: 0,
            initial_budget,
            remaining_budget: initial_budget,
            repaired: false,
            holds_global: false,
            held_provider: None,
        }
    }
}

struct RunShared {
    trace: RunTrace,
    runtime: HashMap<TaskId, TaskRuntime>,
    /// Original nodes in topological order; repair nodes never join it.
    topo: Vec<TaskId>,
    slots: SlotTable,
    fatal: Option<String>,
}

impl RunShared {
    fn all_terminal(&self) -> bool {
        self.runtime.values().all(|rt| rt.state.is_terminal())
    }

    fn release_slots(&mut self, task_id: &str) {
        if let Some(rt) = self.runtime.get_mut(task_id) {
            if rt.holds_global {
                rt.holds_global = false;
                self.slots.release_global();
            }
            if let Some(provider) = rt.held_provider.take() {
                self.slots.release_provider(&provider);
            }
        }
    }

    fn fail_task(&mut self, task_id: &str, reason: String) {
        self.release_slots(task_id);
        if let Some(rt) = self.runtime.get_mut(task_id) {
            if !rt.state.is_terminal() {
                rt.state = TaskState::Failed;
                self.trace.stats.tasks_failed += 1;
                self.trace.failures.push(TaskFailure {
                    task_id: task_id.to_string(),
                    reason,
                });
            }
        }
    }
}

struct Inner {
    router: Router,
    adapters: AdapterSet,
    registry: Arc<CapabilityRegistry>,
    verifier: Option<Verifier>,
    config: SchedulerConfig,
}

/// The scheduler; cheap to clone into workers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Everything an attempt worker needs, one clone per spawn.
#[derive(Clone)]
struct WorkerCtx {
    inner: Arc<Inner>,
    shared: Arc<Mutex<RunShared>>,
    wake_tx: watch::Sender<u64>,
    wake_rx: watch::Receiver<u64>,
    events: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
}

impl WorkerCtx {
    /// Wakes the dispatch loop and any slot waiters.
    fn poke(&self) {
        self.wake_tx.send_modify(|v| *v = v.wrapping_add(1));
    }

    async fn emit(&self, event: RunEvent) {
        // A dropped receiver means the consumer is gone; the run continues.
        let _ = self.events.send(event).await;
    }
}

impl Scheduler {
    pub fn new(
        router: Router,
        adapters: AdapterSet,
        registry: Arc<CapabilityRegistry>,
        verifier: Option<Verifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                router,
                adapters,
                registry,
                verifier,
                config,
            }),
        }
    }

    /// Executes the trace's graph to quiescence and returns the trace with
    /// all bindings, artifacts, verdicts and failures recorded.
    pub async fn execute(
        &self,
        trace: RunTrace,
        events: mpsc::Sender<RunEvent>,
        cancel: CancellationToken,
    ) -> SchedulerRun {
        let topo = trace.graph.topo_order();
        let mut runtime = HashMap::new();
        for node in trace.graph.tasks() {
            let budget = node.repair_budget_or(self.inner.config.default_repair_budget);
            runtime.insert(node.id.clone(), TaskRuntime::new(budget));
        }

        let shared = Arc::new(Mutex::new(RunShared {
            trace,
            runtime,
            topo,
            slots: SlotTable::new(
                self.inner.config.global_max,
                self.inner.config.per_provider_max,
            ),
            fatal: None,
        }));

        let (wake_tx, wake_rx) = watch::channel(0u64);
        let ctx = WorkerCtx {
            inner: Arc::clone(&self.inner),
            shared: Arc::clone(&shared),
            wake_tx,
            wake_rx,
            events,
            cancel,
        };

        let mut handles = Vec::new();
        let mut wake_rx = ctx.wake_rx.clone();

        loop {
            let mut deferred = Vec::new();
            let mut to_spawn = Vec::new();
            let finished = {
                let mut s = shared.lock().await;
                if ctx.cancel.is_cancelled() || s.fatal.is_some() {
                    self.cancel_unstarted(&mut s, &mut deferred);
                } else {
                    self.promote(&mut s, &mut deferred);
                    self.admit(&mut s, &mut to_spawn);
                }
                s.all_terminal()
            };

            for event in deferred {
                ctx.emit(event).await;
            }
            for task_id in to_spawn {
                handles.push(tokio::spawn(run_attempts(ctx.clone(), task_id)));
            }
            if finished {
                break;
            }

            if ctx.cancel.is_cancelled() {
                // Cancellation already folded in; wait for the in-flight
                // attempts to settle.
                let _ = wake_rx.changed().await;
            } else {
                tokio::select! {
                    _ = wake_rx.changed() => {}
                    _ = ctx.cancel.cancelled() => {}
                }
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
        drop(ctx);

        let shared = Arc::try_unwrap(shared)
            .unwrap_or_else(|_| panic!("scheduler workers still hold run state"));
        let RunShared { trace, fatal, .. } = shared.into_inner();
        SchedulerRun { trace, fatal }
    }

    /// Moves `pending` tasks whose dependencies are all `done` to `ready`,
    /// routing them on first entry; cascades upstream failures.
    fn promote(&self, s: &mut RunShared, deferred: &mut Vec<RunEvent>) {
        let order = s.topo.clone();
        for task_id in order {
            let state = match s.runtime.get(&task_id) {
                Some(rt) => rt.state,
                None => continue,
            };
            if state != TaskState::Pending {
                continue;
            }

            let node = match s.trace.graph.node(&task_id) {
                Some(node) => node.clone(),
                None => continue,
            };

            let failed_dep = node.inputs.iter().find(|dep| {
                s.runtime
                    .get(*dep)
                    .map(|rt| rt.state == TaskState::Failed)
                    .unwrap_or(false)
            });
            if let Some(dep) = failed_dep {
                let reason = format!("upstream task '{}' failed", dep);
                s.fail_task(&task_id, reason.clone());
                deferred.push(RunEvent::TaskFailed {
                    task_id: task_id.clone(),
                    reason,
                });
                continue;
            }

            let deps_done = node.inputs.iter().all(|dep| {
                s.runtime
                    .get(dep)
                    .map(|rt| rt.state == TaskState::Done)
                    .unwrap_or(false)
            });
            if !deps_done {
                continue;
            }

            match self.inner.router.route(&node) {
                Ok(ranked) => {
                    let rt = s
                        .runtime
                        .get_mut(&task_id)
                        .expect("runtime entry for routed task");
                    rt.max_attempts = ranked.len() as u32 + rt.initial_budget;
                    rt.chain = ranked.into_iter().enumerate().collect();
                    rt.state = TaskState::Ready;
                }
                Err(e) => {
                    let reason = e.to_string();
                    s.fail_task(&task_id, reason.clone());
                    deferred.push(RunEvent::TaskFailed {
                        task_id: task_id.clone(),
                        reason,
                    });
                }
            }
        }
    }

    /// Admits `ready` tasks while both caps have room.
    fn admit(&self, s: &mut RunShared, to_spawn: &mut Vec<TaskId>) {
        let order = s.topo.clone();
        for task_id in order {
            let provider = {
                let rt = match s.runtime.get(&task_id) {
                    Some(rt) if rt.state == TaskState::Ready => rt,
                    _ => continue,
                };
                match rt.chain.front() {
                    Some((_, candidate)) => candidate.provider_id().to_string(),
                    None => continue,
                }
            };

            if !s.slots.try_admit(&provider) {
                continue;
            }
            let rt = s
                .runtime
                .get_mut(&task_id)
                .expect("runtime entry for admitted task");
            let (rank, candidate) = rt.chain.pop_front().expect("non-empty chain");
            rt.current = Some(CurrentAttempt { candidate, rank });
            rt.state = TaskState::Running;
            rt.holds_global = true;
            rt.held_provider = Some(provider);
            to_spawn.push(task_id);
        }
    }

    /// Fails every task that has not started; in-flight attempts settle on
    /// their own once they observe the cancelled token.
    fn cancel_unstarted(&self, s: &mut RunShared, deferred: &mut Vec<RunEvent>) {
        let reason = if s.fatal.is_some() {
            "configuration failure aborted the run"
        } else {
            "Cancelled"
        };
        let ids: Vec<TaskId> = s
            .runtime
            .iter()
            .filter(|(_, rt)| matches!(rt.state, TaskState::Pending | TaskState::Ready))
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in ids {
            s.fail_task(&task_id, reason.to_string());
            deferred.push(RunEvent::TaskFailed {
                task_id,
                reason: reason.to_string(),
            });
        }
    }
}

/// Drives one task through attempts until it is terminal or requeued for
/// fallback.
async fn run_attempts(ctx: WorkerCtx, task_id: TaskId) {
    // A repair directive swaps in the node to execute for the next
    // attempt; the task id in events and bindings stays the original.
    let mut exec_override: Option<TaskNode> = None;

    loop {
        let started = Instant::now();

        let (node, exec_node, candidate, rank, attempt_index) = {
            let mut s = ctx.shared.lock().await;
            let node = match s.trace.graph.node(&task_id) {
                Some(node) => node.clone(),
                None => return,
            };
            let rt = match s.runtime.get_mut(&task_id) {
                Some(rt) => rt,
                None => return,
            };
            let (candidate, rank) = match rt.current.as_ref() {
                Some(current) => (current.candidate.clone(), current.rank),
                None => return,
            };
            rt.attempts_used += 1;
            let attempt_index = rt.attempts_used - 1;
            s.trace.bindings.push(Binding::new(
                task_id.clone(),
                candidate.model_id(),
                candidate.provider_id(),
                attempt_index,
            ));
            let exec_node = exec_override.clone().unwrap_or_else(|| node.clone());
            (node, exec_node, candidate, rank, attempt_index)
        };

        let model_id = candidate.model_id().to_string();
        let provider_id = candidate.provider_id().to_string();
        let is_repair = exec_override.is_some();

        ctx.emit(RunEvent::Decision {
            task_id: task_id.clone(),
            model_id: model_id.clone(),
            provider_id: provider_id.clone(),
            rank,
            attempt: attempt_index,
        })
        .await;
        ctx.emit(RunEvent::TaskStart {
            task_id: task_id.clone(),
            model_id: model_id.clone(),
        })
        .await;

        let prompt = if is_repair {
            // Repair prompts embed the rejected artifact already.
            exec_node.prompt_text.clone()
        } else {
            compose_prompt(&ctx, &exec_node).await
        };

        let result = execute_attempt(&ctx, &task_id, &model_id, &provider_id, prompt).await;

        let (completion, streamed) = match result {
            Err(_) if ctx.cancel.is_cancelled() => {
                settle_failed(&ctx, &task_id, "Cancelled".to_string()).await;
                return;
            }
            Err(e) if e.is_fatal() => {
                record_outcome(&ctx, &model_id, false, started.elapsed(), 0, 0, 0.0);
                {
                    let mut s = ctx.shared.lock().await;
                    s.fatal = Some(e.to_string());
                    s.fail_task(&task_id, e.to_string());
                }
                ctx.emit(RunEvent::TaskFailed {
                    task_id: task_id.clone(),
                    reason: e.to_string(),
                })
                .await;
                // Nothing else can succeed without credentials.
                ctx.cancel.cancel();
                ctx.poke();
                return;
            }
            Err(e) => {
                // Permanent errors and exhausted transients both rebind;
                // neither consumes repair budget.
                record_outcome(&ctx, &model_id, false, started.elapsed(), 0, 0, 0.0);
                enter_fallback(&ctx, &task_id, e.to_string()).await;
                return;
            }
            Ok(ok) => ok,
        };

        let cost = ctx
            .inner
            .registry
            .descriptor(&model_id)
            .map(|d| d.estimate_cost(completion.input_tokens, completion.output_tokens))
            .unwrap_or(0.0);

        let artifact = Artifact::new(
            Binding::new(
                task_id.clone(),
                model_id.clone(),
                provider_id.clone(),
                attempt_index,
            ),
            completion.content.clone(),
        )
        .with_usage(
            completion.input_tokens,
            completion.output_tokens,
            completion.latency_ms,
        );
        let artifact_id = artifact.artifact_id;

        {
            let mut s = ctx.shared.lock().await;
            s.trace.stats.tokens_in += completion.input_tokens as u64;
            s.trace.stats.tokens_out += completion.output_tokens as u64;
            s.trace.stats.cost += cost;
            s.trace.artifacts.push(artifact.clone());
        }

        if !streamed {
            ctx.emit(RunEvent::TaskArtifact {
                task_id: task_id.clone(),
                fragment: completion.content.clone(),
            })
            .await;
        }

        let verifier = match ctx.inner.verifier.as_ref() {
            None => {
                // Verification off: a produced artifact settles the task.
                record_outcome(
                    &ctx,
                    &model_id,
                    true,
                    started.elapsed(),
                    completion.input_tokens,
                    completion.output_tokens,
                    cost,
                );
                settle_done(&ctx, &task_id).await;
                return;
            }
            Some(verifier) => verifier,
        };

        let remaining_budget = {
            let mut s = ctx.shared.lock().await;
            match s.runtime.get_mut(&task_id) {
                Some(rt) => {
                    rt.state = TaskState::Verifying;
                    rt.remaining_budget
                }
                None => 0,
            }
        };

        let verdict = match verifier
            .verify(&node, &artifact, remaining_budget, ctx.cancel.clone())
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                // Internal rubric failure: a failed verdict that still
                // consumes one repair attempt.
                let reasons = vec![format!("VerifierError: {}", e)];
                let directive = if remaining_budget > 0 {
                    Some(synthesize_repair_directive(&node, &artifact, &reasons))
                } else {
                    None
                };
                Verdict {
                    artifact_id,
                    score: 0.0,
                    passed: false,
                    failure_reasons: reasons,
                    repair_directive: directive,
                }
            }
        };

        let passed = verdict.passed;
        let score = verdict.score;
        let directive = verdict.repair_directive.clone();
        let reasons = verdict.failure_reasons.clone();

        {
            let mut s = ctx.shared.lock().await;
            if let Some(stored) = s
                .trace
                .artifacts
                .iter_mut()
                .find(|a| a.artifact_id == artifact_id)
            {
                stored.status = if passed {
                    if is_repair {
                        ArtifactStatus::Repaired
                    } else {
                        ArtifactStatus::Verified
                    }
                } else {
                    ArtifactStatus::Rejected
                };
            }
            s.trace.verdicts.push(verdict);
        }

        ctx.emit(RunEvent::TaskVerified {
            task_id: task_id.clone(),
            score,
            passed,
        })
        .await;

        record_outcome(
            &ctx,
            &model_id,
            passed,
            started.elapsed(),
            completion.input_tokens,
            completion.output_tokens,
            cost,
        );

        if passed {
            settle_done(&ctx, &task_id).await;
            return;
        }

        let repair_node = directive.and_then(|d| d.nodes.into_iter().next());
        let repair_node = match repair_node {
            Some(node) if remaining_budget > 0 => node,
            _ => {
                enter_fallback(&ctx, &task_id, reasons.join("; ")).await;
                return;
            }
        };

        // Consume the repair attempt and insert the directive under the
        // run lock.
        let over_attempt_cap = {
            let mut s = ctx.shared.lock().await;
            let mut first_repair = false;
            if let Some(rt) = s.runtime.get_mut(&task_id) {
                rt.remaining_budget = rt.remaining_budget.saturating_sub(1);
                if !rt.repaired {
                    rt.repaired = true;
                    first_repair = true;
                }
                rt.state = TaskState::Repairing;
            }
            if first_repair {
                s.trace.stats.tasks_repaired += 1;
            }
            if let Err(e) = s.trace.graph.insert_node(repair_node.clone()) {
                tracing::warn!(task_id = %task_id, error = %e, "Could not insert repair node");
            }
            s.runtime
                .get(&task_id)
                .map(|rt| rt.attempts_used >= rt.max_attempts)
                .unwrap_or(true)
        };

        ctx.emit(RunEvent::TaskRepaired {
            task_id: task_id.clone(),
            new_node_ids: vec![repair_node.id.clone()],
        })
        .await;

        if over_attempt_cap {
            enter_fallback(&ctx, &task_id, "attempt budget exhausted".to_string()).await;
            return;
        }

        // Route the repair node; its binding may land on another provider,
        // in which case the provider slot is switched while the global
        // slot is kept.
        let routed = match ctx.inner.router.route(&repair_node) {
            Ok(routed) => routed,
            Err(e) => {
                enter_fallback(&ctx, &task_id, e.to_string()).await;
                return;
            }
        };
        let repair_candidate = routed.into_iter().next().expect("routed list is non-empty");
        let new_provider = repair_candidate.provider_id().to_string();

        if !switch_provider(&ctx, &task_id, &provider_id, &new_provider).await {
            settle_failed(&ctx, &task_id, "Cancelled".to_string()).await;
            return;
        }

        {
            let mut s = ctx.shared.lock().await;
            if let Some(rt) = s.runtime.get_mut(&task_id) {
                rt.current = Some(CurrentAttempt {
                    candidate: repair_candidate,
                    rank: 0,
                });
            }
        }
        exec_override = Some(repair_node);
    }
}

/// Concatenates upstream artifacts under the node's own prompt.
async fn compose_prompt(ctx: &WorkerCtx, node: &TaskNode) -> String {
    let s = ctx.shared.lock().await;
    let mut prompt = node.prompt_text.clone();
    for input in &node.inputs {
        if let Some(artifact) = s.trace.latest_artifact_for(input) {
            prompt.push_str(&format!(
                "\n\n--- Context from task {} ---\n{}",
                input, artifact.content
            ));
        }
    }
    prompt
}

/// Runs the adapter call under the per-attempt deadline, forwarding
/// streamed fragments as ordered `task_artifact` events.
async fn execute_attempt(
    ctx: &WorkerCtx,
    task_id: &str,
    model_id: &str,
    provider_id: &str,
    prompt: String,
) -> Result<(Completion, bool), ProviderError> {
    let adapter = ctx
        .inner
        .adapters
        .get(provider_id)
        .ok_or_else(|| ProviderError::Permanent(format!("no adapter for '{}'", provider_id)))?;

    let mut request = CompletionRequest::new(model_id, prompt);
    let forwarder = if adapter.supports_streaming() {
        let (tx, mut rx) = mpsc::channel::<String>(16);
        request = request.with_fragment_sink(tx);
        let events = ctx.events.clone();
        let task_id = task_id.to_string();
        Some(tokio::spawn(async move {
            let mut streamed = false;
            while let Some(fragment) = rx.recv().await {
                streamed = true;
                let _ = events
                    .send(RunEvent::TaskArtifact {
                        task_id: task_id.clone(),
                        fragment,
                    })
                    .await;
            }
            streamed
        }))
    } else {
        None
    };

    let timeout = ctx.inner.config.attempt_timeout;
    let result = tokio::select! {
        outcome = tokio::time::timeout(timeout, adapter.execute(request, ctx.cancel.child_token())) => {
            match outcome {
                Ok(inner) => inner,
                Err(_) => Err(ProviderError::Timeout(timeout.as_millis() as u64)),
            }
        }
        _ = ctx.cancel.cancelled() => Err(ProviderError::Transient("cancelled".to_string())),
    };

    let streamed = match forwarder {
        Some(handle) => handle.await.unwrap_or(false),
        None => false,
    };

    result.map(|completion| (completion, streamed))
}

/// Rebinds the task to its next-ranked candidate, or fails it when the
/// chain or attempt budget is exhausted. The task releases its slots and
/// re-enters `ready`, so admission is rechecked by the dispatch loop.
async fn enter_fallback(ctx: &WorkerCtx, task_id: &str, reason: String) {
    let failed = {
        let mut s = ctx.shared.lock().await;
        let exhausted = match s.runtime.get_mut(task_id) {
            Some(rt) => {
                rt.state = TaskState::Fallback;
                rt.current = None;
                rt.chain.is_empty() || rt.attempts_used >= rt.max_attempts
            }
            None => return,
        };
        if exhausted {
            s.fail_task(task_id, reason.clone());
            true
        } else {
            s.release_slots(task_id);
            if let Some(rt) = s.runtime.get_mut(task_id) {
                rt.state = TaskState::Ready;
            }
            false
        }
    };

    if failed {
        ctx.emit(RunEvent::TaskFailed {
            task_id: task_id.to_string(),
            reason,
        })
        .await;
    }
    ctx.poke();
}

/// Switches the held provider slot; keeps the global slot. Returns false
/// when the run was cancelled while waiting for capacity.
async fn switch_provider(ctx: &WorkerCtx, task_id: &str, from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }

    {
        let mut s = ctx.shared.lock().await;
        s.slots.release_provider(from);
        if let Some(rt) = s.runtime.get_mut(task_id) {
            rt.held_provider = None;
        }
    }
    ctx.poke();

    let mut wake_rx = ctx.wake_rx.clone();
    loop {
        {
            let mut s = ctx.shared.lock().await;
            if s.slots.try_admit_provider(to) {
                if let Some(rt) = s.runtime.get_mut(task_id) {
                    rt.held_provider = Some(to.to_string());
                }
                return true;
            }
        }
        if ctx.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = wake_rx.changed() => {}
            _ = ctx.cancel.cancelled() => return false,
        }
    }
}

async fn settle_done(ctx: &WorkerCtx, task_id: &str) {
    {
        let mut s = ctx.shared.lock().await;
        s.release_slots(task_id);
        if let Some(rt) = s.runtime.get_mut(task_id) {
            rt.state = TaskState::Done;
        }
        s.trace.stats.tasks_executed += 1;
    }
    ctx.poke();
}

async fn settle_failed(ctx: &WorkerCtx, task_id: &str, reason: String) {
    {
        let mut s = ctx.shared.lock().await;
        s.fail_task(task_id, reason.clone());
    }
    ctx.emit(RunEvent::TaskFailed {
        task_id: task_id.to_string(),
        reason,
    })
    .await;
    ctx.poke();
}

fn record_outcome(
    ctx: &WorkerCtx,
    model_id: &str,
    success: bool,
    elapsed: Duration,
    tokens_in: u32,
    tokens_out: u32,
    cost: f64,
) {
    ctx.inner.registry.update(ExecutionOutcome {
        model_id: model_id.to_string(),
        success,
        latency_ms: elapsed.as_millis() as u64,
        tokens_in: tokens_in as u64,
        tokens_out: tokens_out as u64,
        cost,
    });
}
