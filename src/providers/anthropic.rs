//! Anthropic provider adapter (messages API).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

use super::chat::map_status;
use super::{with_retry, Completion, CompletionRequest, ProviderAdapter};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Messages require an explicit token ceiling; applied when the request
/// does not set one.
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Adapter for the Anthropic messages API.
pub struct AnthropicAdapter {
    http: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client - system TLS configuration error"),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            api_key,
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let api_request = ApiRequest {
            model: &request.model_id,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![ApiMessage {
                role: "user",
                content: &request.prompt,
            }],
            system: request.system.as_deref(),
            temperature: request.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url);
        let started = Instant::now();

        let http_response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(REQUEST_TIMEOUT_SECS * 1_000)
                } else {
                    ProviderError::Transient(e.to_string())
                }
            })?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(map_status(status.as_u16(), message));
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        let api_response: ApiResponse = http_response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("unparseable response: {}", e)))?;

        let content: String = api_response
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .map(|block| block.text.as_str())
            .collect();

        Ok(Completion {
            content,
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
            latency_ms,
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    async fn execute(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<Completion, ProviderError> {
        with_retry(self.provider_id(), &cancel, || self.complete(&request)).await
    }
}
