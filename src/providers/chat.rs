//! Shared client for OpenAI-compatible chat-completions endpoints.
//!
//! The OpenAI and xAI adapters differ only in base URL, default headers and
//! provider id; both speak this wire format.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

use super::{estimate_tokens, Completion, CompletionRequest};

/// Request timeout; the scheduler applies its own per-attempt deadline on
/// top of this.
const REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Thin client over one chat-completions endpoint.
pub(crate) struct ChatCompletionsClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ChatCompletionsClient {
    pub(crate) fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client - system TLS configuration error"),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Executes a single request (no retry logic).
    pub(crate) async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<Completion, ProviderError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ApiMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ApiMessage {
            role: "user",
            content: &request.prompt,
        });

        let api_request = ApiRequest {
            model: &request.model_id,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let started = Instant::now();

        let http_response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&api_request)
            .send()
            .await
            .map_err(map_send_error)?;

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

        let content = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        let (input_tokens, output_tokens) = match api_response.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (estimate_tokens(&request.prompt), estimate_tokens(&content)),
        };

        Ok(Completion {
            content,
            input_tokens,
            output_tokens,
            latency_ms,
        })
    }
}

fn map_send_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(REQUEST_TIMEOUT_SECS * 1_000)
    } else {
        ProviderError::Transient(err.to_string())
    }
}

/// Maps an HTTP status into the normalized error taxonomy.
pub(crate) fn map_status(status: u16, message: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthFailed(message),
        429 => ProviderError::RateLimited(message),
        408 => ProviderError::Timeout(REQUEST_TIMEOUT_SECS * 1_000),
        500..=599 => ProviderError::Transient(format!("HTTP {}: {}", status, message)),
        _ => ProviderError::Permanent(format!("HTTP {}: {}", status, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert!(matches!(
            map_status(401, "x".into()),
            ProviderError::AuthFailed(_)
        ));
        assert!(matches!(
            map_status(403, "x".into()),
            ProviderError::AuthFailed(_)
        ));
        assert!(matches!(
            map_status(429, "x".into()),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            map_status(408, "x".into()),
            ProviderError::Timeout(_)
        ));
        assert!(matches!(
            map_status(503, "x".into()),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            map_status(400, "x".into()),
            ProviderError::Permanent(_)
        ));
        assert!(matches!(
            map_status(404, "x".into()),
            ProviderError::Permanent(_)
        ));
    }

    #[test]
    fn test_api_request_serialization() {
        let request = ApiRequest {
            model: "gpt-4o",
            messages: vec![
                ApiMessage {
                    role: "system",
                    content: "be terse",
                },
                ApiMessage {
                    role: "user",
                    content: "hi",
                },
            ],
            temperature: Some(0.0),
            max_tokens: None,
        };

        let json = serde_json::to_string(&request).expect("serializes");
        assert!(json.contains("\"model\":\"gpt-4o\""));
        assert!(json.contains("\"temperature\":0.0"));
        assert!(!json.contains("max_tokens"));
    }

    #[tokio::test]
    async fn test_connection_error_is_transient() {
        let client = ChatCompletionsClient::new("http://127.0.0.1:65535/v1", "test-key");
        let request = CompletionRequest::new("gpt-4o", "hello");

        let result = client.complete(&request).await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }
}
