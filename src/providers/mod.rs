//! Provider adapters: a uniform execution contract over LLM backends.
//!
//! Each adapter owns its HTTP specifics and is responsible for token
//! counting, timing, transient-error retry with exponential backoff, and
//! normalizing provider error shapes into [`ProviderError`]. Adapters never
//! invoke the router or verifier; the scheduler treats their results as
//! data.

mod anthropic;
mod chat;
mod openai;
pub mod stub;
mod xai;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;
pub use stub::StubAdapter;
pub use xai::XaiAdapter;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::ProviderError;

/// Base delay for the adapter-level retry backoff.
pub(crate) const RETRY_BASE_DELAY_MS: u64 = 250;

/// Backoff multiplier between attempts.
pub(crate) const RETRY_FACTOR: u64 = 2;

/// Maximum attempts per adapter call (first try included).
pub(crate) const RETRY_MAX_ATTEMPTS: u32 = 3;

/// One prompt execution against one model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model_id: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// Fully composed prompt, upstream context included.
    pub prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Sink for incremental text fragments when the adapter streams.
    pub fragment_tx: Option<mpsc::Sender<String>>,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            system: None,
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
            fragment_tx: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_fragment_sink(mut self, tx: mpsc::Sender<String>) -> Self {
        self.fragment_tx = Some(tx);
        self
    }
}

/// Normalized result of one successful execution.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
}

/// Uniform adapter contract.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider id, used for slot accounting and telemetry.
    fn provider_id(&self) -> &str;

    /// Whether this adapter emits incremental fragments.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Executes one request, absorbing transient failures in the adapter's
    /// own bounded retry loop.
    async fn execute(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<Completion, ProviderError>;
}

/// Adapters keyed by provider id.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the adapter set for every provider with a configured key.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut set = Self::new();
        if let Some(key) = &settings.anthropic_api_key {
            set.insert(Arc::new(AnthropicAdapter::new(key.clone())));
        }
        if let Some(key) = &settings.openai_api_key {
            set.insert(Arc::new(OpenAiAdapter::new(key.clone())));
        }
        if let Some(key) = &settings.xai_api_key {
            set.insert(Arc::new(XaiAdapter::new(key.clone())));
        }
        set
    }

    pub fn insert(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .insert(adapter.provider_id().to_string(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Runs `call` under the shared retry policy: base 250 ms, factor 2,
/// at most three attempts, retrying only retryable errors.
pub(crate) async fn with_retry<T, F, Fut>(
    provider_id: &str,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_error = None;

    for attempt in 0..RETRY_MAX_ATTEMPTS {
        if attempt > 0 {
            let delay_ms = RETRY_BASE_DELAY_MS * RETRY_FACTOR.pow(attempt - 1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = cancel.cancelled() => {
                    return Err(ProviderError::Transient("cancelled during backoff".to_string()));
                }
            }
            tracing::debug!(
                provider = provider_id,
                attempt = attempt + 1,
                delay_ms = delay_ms,
                "Retrying provider request after transient failure"
            );
        }

        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    provider = provider_id,
                    attempt = attempt + 1,
                    max_attempts = RETRY_MAX_ATTEMPTS,
                    error = %err,
                    "Transient provider error, will retry"
                );
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error
        .unwrap_or_else(|| ProviderError::Transient("retries exhausted".to_string())))
}

/// Estimates token count for a string; roughly four characters per token
/// for English text. Used only when the provider omits usage numbers.
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f32 / 4.0).ceil() as u32
}
