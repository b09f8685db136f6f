//! Local Ollama chat client. No credential.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ProviderSettings;
use crate::error::LlmError;
use crate::llm::http::{self, Endpoint};
use crate::llm::{Backend, LlmProvider, user_message};

pub struct OllamaProvider {
    endpoint: Endpoint,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OllamaProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: Endpoint::new(Backend::Ollama, settings)?,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        Backend::Ollama.as_str()
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
            "stream": false,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message(subject, content)},
            ],
            "options": {
                "temperature": self.endpoint.temperature,
                "num_predict": self.endpoint.max_tokens,
            },
        });

        let request = self
            .endpoint
            .client
            .post(format!("{}/api/chat", self.endpoint.base_url))
            .json(&body);

        debug!(model = %self.endpoint.model, "Requesting Ollama completion");
        let response: ChatResponse = http::send_json(self.name(), request).await?;
        http::require_text(self.name(), response.message.and_then(|m| m.content))
    }
}
