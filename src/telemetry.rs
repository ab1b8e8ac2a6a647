//! Telemetry recorder: per-model rolling aggregates over a 24 h horizon.
//!
//! Execution outcomes are appended by the scheduler; the registry and
//! router read windowed views on every query. The window is logical:
//! samples older than the horizon are pruned when a view is taken, so no
//! background sweeper is needed. Lifetime counters are monotonic and never
//! pruned.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

/// Rolling window horizon.
const WINDOW_HOURS: i64 = 24;

/// One execution outcome reported to the recorder.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub model_id: String,
    pub success: bool,
    pub latency_ms: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

/// A timestamped sample inside a model's window.
#[derive(Debug, Clone)]
struct Sample {
    at: DateTime<Utc>,
    success: bool,
    latency_ms: u64,
    tokens_in: u64,
    tokens_out: u64,
    cost: f64,
}

/// Per-model window plus lifetime counters.
#[derive(Debug, Default)]
struct ModelWindow {
    /// Samples in arrival order; pruned from the front on read.
    samples: VecDeque<Sample>,
    /// Monotonic lifetime counters.
    attempts_total: u64,
    successes_total: u64,
    errors_total: u64,
}

/// Windowed view of one model's recent behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub attempts: u64,
    pub successes: u64,
    pub errors: u64,
    /// Mean latency over the window; `None` with zero samples.
    pub avg_latency_ms: Option<f64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

impl WindowStats {
    fn empty() -> Self {
        Self {
            attempts: 0,
            successes: 0,
            errors: 0,
            avg_latency_ms: None,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
        }
    }

    /// Laplace-smoothed success rate: `(successes + 1) / (attempts + 2)`.
    ///
    /// An un-sampled model therefore reads 0.5 here; the registry overrides
    /// that with a neutral 1.0 prior when there are literally zero samples.
    pub fn success_rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.attempts as f64 + 2.0)
    }

    pub fn has_samples(&self) -> bool {
        self.attempts > 0
    }
}

/// Process-wide recorder of execution outcomes.
pub struct TelemetryRecorder {
    windows: RwLock<HashMap<String, ModelWindow>>,
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryRecorder {
    pub fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Records one execution outcome.
    pub fn record(&self, outcome: ExecutionOutcome) {
        self.record_at(outcome, Utc::now());
    }

    /// Records with an explicit timestamp (testable core of [`record`]).
    ///
    /// [`record`]: TelemetryRecorder::record
    pub fn record_at(&self, outcome: ExecutionOutcome, at: DateTime<Utc>) {
        let mut windows = self.windows.write().expect("telemetry lock poisoned");
        let window = windows.entry(outcome.model_id.clone()).or_default();

        window.attempts_total += 1;
        if outcome.success {
            window.successes_total += 1;
        } else {
            window.errors_total += 1;
        }
        window.samples.push_back(Sample {
            at,
            success: outcome.success,
            latency_ms: outcome.latency_ms,
            tokens_in: outcome.tokens_in,
            tokens_out: outcome.tokens_out,
            cost: outcome.cost,
        });
    }

    /// Windowed view for one model, pruning aged-out samples.
    pub fn window(&self, model_id: &str) -> WindowStats {
        self.window_at(model_id, Utc::now())
    }

    /// Windowed view at an explicit instant (testable core of [`window`]).
    ///
    /// [`window`]: TelemetryRecorder::window
    pub fn window_at(&self, model_id: &str, now: DateTime<Utc>) -> WindowStats {
        let mut windows = self.windows.write().expect("telemetry lock poisoned");
        match windows.get_mut(model_id) {
            Some(window) => {
                prune(window, now);
                summarize(window)
            }
            None => WindowStats::empty(),
        }
    }

    /// Windowed views for every model with recorded samples.
    pub fn windows_at(&self, now: DateTime<Utc>) -> HashMap<String, WindowStats> {
        let mut windows = self.windows.write().expect("telemetry lock poisoned");
        windows
            .iter_mut()
            .map(|(model_id, window)| {
                prune(window, now);
                (model_id.clone(), summarize(window))
            })
            .collect()
    }

    /// Lifetime (monotonic) counters for one model:
    /// `(attempts, successes, errors)`.
    pub fn lifetime_counters(&self, model_id: &str) -> (u64, u64, u64) {
        let windows = self.windows.read().expect("telemetry lock poisoned");
        windows
            .get(model_id)
            .map(|w| (w.attempts_total, w.successes_total, w.errors_total))
            .unwrap_or((0, 0, 0))
    }
}

fn prune(window: &mut ModelWindow, now: DateTime<Utc>) {
    let horizon = now - Duration::hours(WINDOW_HOURS);
    while window
        .samples
        .front()
        .map(|s| s.at < horizon)
        .unwrap_or(false)
    {
        window.samples.pop_front();
    }
}

fn summarize(window: &ModelWindow) -> WindowStats {
    let mut stats = WindowStats::empty();
    let mut latency_sum: u64 = 0;
    for sample in &window.samples {
        stats.attempts += 1;
        if sample.success {
            stats.successes += 1;
        } else {
            stats.errors += 1;
        }
        latency_sum += sample.latency_ms;
        stats.tokens_in += sample.tokens_in;
        stats.tokens_out += sample.tokens_out;
        stats.cost += sample.cost;
    }
    if stats.attempts > 0 {
        stats.avg_latency_ms = Some(latency_sum as f64 / stats.attempts as f64);
    }
    stats
}
