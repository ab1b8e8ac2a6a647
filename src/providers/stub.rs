//! Deterministic scripted adapter for tests and offline runs.
//!
//! Responses are queued per model id and popped in order; an exhausted
//! queue falls back to the default reply. The adapter tracks concurrent
//! in-flight calls so tests can assert admission-cap invariants.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

use super::{estimate_tokens, Completion, CompletionRequest, ProviderAdapter};

/// One scripted outcome.
pub type StubOutcome = Result<String, ProviderError>;

/// Scripted provider adapter.
pub struct StubAdapter {
    provider_id: String,
    scripts: Mutex<HashMap<String, VecDeque<StubOutcome>>>,
    default_reply: String,
    /// Artificial latency per call; lets tests observe concurrency.
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl StubAdapter {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            scripts: Mutex::new(HashMap::new()),
            default_reply: "stub response".to_string(),
            delay: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues the next outcome for a model.
    pub fn push_response(&self, model_id: impl Into<String>, outcome: StubOutcome) {
        self.scripts
            .lock()
            .expect("stub lock poisoned")
            .entry(model_id.into())
            .or_default()
            .push_back(outcome);
    }

    /// Every `(model_id, prompt)` pair seen so far, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("stub lock poisoned").clone()
    }

    /// Number of calls seen so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("stub lock poisoned").len()
    }

    /// Highest number of simultaneous in-flight calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, model_id: &str) -> StubOutcome {
        let mut scripts = self.scripts.lock().expect("stub lock poisoned");
        scripts
            .get_mut(model_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(self.default_reply.clone()))
    }
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let started = Instant::now();

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        self.calls
            .lock()
            .expect("stub lock poisoned")
            .push((request.model_id.clone(), request.prompt.clone()));

        let result = async {
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(ProviderError::Transient("cancelled".to_string()));
                    }
                }
            }

            let content = self.next_outcome(&request.model_id)?;

            if let Some(tx) = &request.fragment_tx {
                // Stream word-sized fragments; receivers that hang up are
                // treated as no longer interested, not as an error.
                let mut first = true;
                for word in content.split(' ') {
                    let fragment = if first {
                        word.to_string()
                    } else {
                        format!(" {}", word)
                    };
                    first = false;
                    if tx.send(fragment).await.is_err() {
                        break;
                    }
                }
            }

            Ok(Completion {
                input_tokens: estimate_tokens(&request.prompt),
                output_tokens: estimate_tokens(&content),
                latency_ms: started.elapsed().as_millis() as u64,
                content,
            })
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
