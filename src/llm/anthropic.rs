//! Anthropic messages API client.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ProviderSettings;
use crate::error::LlmError;
use crate::llm::http::{self, Endpoint};
use crate::llm::{Backend, LlmProvider, user_message};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    endpoint: Endpoint,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: Endpoint::new(Backend::Anthropic, settings)?,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        Backend::Anthropic.as_str()
    }

    fn model_name(&self) -> &str {
        &self.endpoint.model
    }

    async fn generate_reply(
        &self,
        content: &str,
        system_prompt: &str,
        subject: &str,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": self.endpoint.model,
            "max_tokens": self.endpoint.max_tokens,
            "temperature": self.endpoint.temperature,
            "system": system_prompt,
            "messages": [
                {"role": "user", "content": user_message(subject, content)},
            ],
        });

        let mut request = self
            .endpoint
            .client
            .post(format!("{}/messages", self.endpoint.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = &self.endpoint.api_key {
            request = request.header("x-api-key", key.expose_secret());
        }

        debug!(model = %self.endpoint.model, "Requesting Anthropic completion");
        let response: MessagesResponse = http::send_json(self.name(), request).await?;
        let text: String = response
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        http::require_text(self.name(), Some(text))
    }
}
