//! xAI provider adapter (OpenAI-compatible wire format).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

use super::chat::ChatCompletionsClient;
use super::{with_retry, Completion, CompletionRequest, ProviderAdapter};

const XAI_BASE_URL: &str = "https://api.x.ai/v1";

/// Adapter for the xAI API.
pub struct XaiAdapter {
    client: ChatCompletionsClient,
}

impl XaiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            client: ChatCompletionsClient::new(XAI_BASE_URL, api_key),
        }
    }
}

#[async_trait]
impl ProviderAdapter for XaiAdapter {
    fn provider_id(&self) -> &str {
        "xai"
    }

    async fn execute(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<Completion, ProviderError> {
        with_retry(self.provider_id(), &cancel, || self.client.complete(&request)).await
    }
}
