//! Google Gemini `generateContent` client.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ProviderSettings;
use crate::error::LlmError;
use crate::llm::http::{self, Endpoint};
use crate::llm::{Backend, LlmProvider, user_message};

pub struct GoogleProvider {
    endpoint: Endpoint,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

impl GoogleProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: Endpoint::new(Backend::Google, settings)?,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.endpoint.base_url, self.endpoint.model
        )
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn name(&self) -> &str {
        Backend::Google.as_str()
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
            "systemInstruction": {"parts": [{"text": system_prompt}]},
            "contents": [
                {"role": "user", "parts": [{"text": user_message(subject, content)}]},
            ],
            "generationConfig": {
                "maxOutputTokens": self.endpoint.max_tokens,
                "temperature": self.endpoint.temperature,
            },
        });

        let mut request = self.endpoint.client.post(self.url()).json(&body);
        if let Some(key) = &self.endpoint.api_key {
            request = request.header("x-goog-api-key", key.expose_secret());
        }

        debug!(model = %self.endpoint.model, "Requesting Gemini completion");
        let response: GenerateResponse = http::send_json(self.name(), request).await?;
        let text = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<String>());
        http::require_text(self.name(), text)
    }
}
