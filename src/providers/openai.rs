//! OpenAI provider adapter.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

use super::chat::ChatCompletionsClient;
use super::{with_retry, Completion, CompletionRequest, ProviderAdapter};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for the OpenAI chat-completions API.
pub struct OpenAiAdapter {
    client: ChatCompletionsClient,
}

impl OpenAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: ChatCompletionsClient::new(OPENAI_BASE_URL, api_key),
        }
    }

    /// Points the adapter at an OpenAI-compatible proxy; test use.
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: ChatCompletionsClient::new(base_url, api_key),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn execute(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<Completion, ProviderError> {
        with_retry(self.provider_id(), &cancel, || self.client.complete(&request)).await
    }
}
