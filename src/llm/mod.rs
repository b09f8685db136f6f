//! LLM integration for Mail Agent.
//!
//! Supports four chat backends, each a plain `reqwest` JSON client:
//! - **OpenAI**: `/chat/completions`
//! - **Anthropic**: `/messages`
//! - **Google**: Gemini `generateContent`
//! - **Ollama**: local `/api/chat`
//!
//! The pipeline only ever sees [`LlmProvider`]; providers are looked up by
//! name through the [`ProviderRegistry`].

pub mod anthropic;
pub mod google;
mod http;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod registry;

pub use provider::{LlmProvider, ProviderClient, user_message};
pub use registry::ProviderRegistry;

use std::fmt;
use std::str::FromStr;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    OpenAi,
    Anthropic,
    Google,
    Ollama,
}

impl Backend {
    pub const ALL: [Backend; 4] = [
        Backend::OpenAi,
        Backend::Anthropic,
        Backend::Google,
        Backend::Ollama,
    ];

    /// Registry name, as used in settings and rules.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4-turbo",
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Google => "gemini-pro",
            Self::Ollama => "llama3",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::Google => "https://generativelanguage.googleapis.com/v1beta",
            Self::Ollama => "http://localhost:11434",
        }
    }

    /// Local backends run without a credential.
    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "google" | "gemini" => Ok(Self::Google),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown LLM backend '{other}'")),
        }
    }
}
