//! OpenAI chat completions client.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::ProviderSettings;
use crate::error::LlmError;
use crate::llm::http::{self, Endpoint};
use crate::llm::{Backend, LlmProvider, user_message};

pub struct OpenAiProvider {
    endpoint: Endpoint,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiProvider {
    pub fn new(settings: &ProviderSettings) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: Endpoint::new(Backend::OpenAi, settings)?,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint.base_url)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        Backend::OpenAi.as_str()
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
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message(subject, content)},
            ],
            "max_tokens": self.endpoint.max_tokens,
            "temperature": self.endpoint.temperature,
        });

        let mut request = self.endpoint.client.post(self.url()).json(&body);
        if let Some(key) = &self.endpoint.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        debug!(model = %self.endpoint.model, "Requesting OpenAI completion");
        let response: ChatResponse = http::send_json(self.name(), request).await?;
        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content);
        http::require_text(self.name(), text)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;

    fn provider(server: &MockServer) -> OpenAiProvider {
        OpenAiProvider::new(&ProviderSettings {
            api_key: Some(SecretString::from("test-openai-key".to_string())),
            model: Some("gpt-4o-mini".into()),
            base_url: Some(format!("{}/v1", server.base_url())),
            ..ProviderSettings::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn sends_expected_request() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer test-openai-key")
                .json_body_includes(
                    json!({
                        "model": "gpt-4o-mini",
                        "messages": [{"role": "system", "content": "Be brief."}]
                    })
                    .to_string(),
                );
            then.status(200).json_body(json!({
                "choices": [{"message": {"role": "assistant", "content": " Thanks, noted. "}}]
            }));
        });

        let reply = provider(&server)
            .generate_reply("Hello", "Be brief.", "Hi")
            .await
            .unwrap();
        mock.assert();
        assert_eq!(reply, "Thanks, noted.");
    }

    #[tokio::test]
    async fn unauthorized_is_permanent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401).body("{\"error\":\"bad key\"}");
        });

        let err = provider(&server)
            .generate_reply("Hello", "Be brief.", "Hi")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::AuthFailed { status: 401, .. }));
    }

    #[tokio::test]
    async fn empty_choices_is_invalid_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({"choices": []}));
        });

        let err = provider(&server)
            .generate_reply("Hello", "Be brief.", "Hi")
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}
