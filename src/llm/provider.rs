//! The provider capability contract.

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::google::GoogleProvider;
use crate::llm::ollama::OllamaProvider;
use crate::llm::openai::OpenAiProvider;

/// Something that can write a reply to an email.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry name, e.g. `"openai"`.
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Produce reply text for the given message. One request, no retries.
    async fn generate_reply(
        &self,
        content: &str,
        system_prompt: &str,
        subject: &str,
    ) -> Result<String, LlmError>;
}

/// The user turn sent to every backend. The subject line is left out when
/// there is no subject.
pub fn user_message(subject: &str, content: &str) -> String {
    let subject = subject.trim();
    let mut message = String::new();
    if !subject.is_empty() {
        message.push_str(&format!("Subject: {subject}\n\n"));
    }
    message.push_str(&format!(
        "Email content:\n{content}\n\nPlease write a reply to this email."
    ));
    message
}

/// The closed set of built-in backends.
pub enum ProviderClient {
    OpenAi(OpenAiProvider),
    Anthropic(AnthropicProvider),
    Google(GoogleProvider),
    Ollama(OllamaProvider),
}

#[async_trait]
impl LlmProvider for ProviderClient {
    fn name(&self) -> &str {
        match self {
            Self::OpenAi(p) => p.name(),
            Self::Anthropic(p) => p.name(),
            Self::Google(p) => p.name(),
            Self::Ollama(p) => p.name(),
        }
    }

    fn model_name(&self) -> &str {
        match self {
            Self::OpenAi(p) => p.model_name(),
            Self::Anthropic(p) => p.model_name(),
            Self::Google(p) => p.model_name(),
            Self::Ollama(p) => p.model_name(),
        }
    }

    async fn generate_reply(
        &self,
        content: &str,
        system_prompt: &str,
        subject: &str,
    ) -> Result<String, LlmError> {
        match self {
            Self::OpenAi(p) => p.generate_reply(content, system_prompt, subject).await,
            Self::Anthropic(p) => p.generate_reply(content, system_prompt, subject).await,
            Self::Google(p) => p.generate_reply(content, system_prompt, subject).await,
            Self::Ollama(p) => p.generate_reply(content, system_prompt, subject).await,
        }
    }
}
