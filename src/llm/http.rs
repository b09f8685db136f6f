//! HTTP plumbing shared by the provider clients: client construction,
//! status classification and `Retry-After` handling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use secrecy::SecretString;
use serde::de::DeserializeOwned;

use crate::config::ProviderSettings;
use crate::error::LlmError;
use crate::llm::Backend;

/// Error bodies are cut to this many characters before logging.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Connection details resolved from settings, with backend defaults applied.
pub(crate) struct Endpoint {
    pub client: reqwest::Client,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Endpoint {
    pub fn new(backend: Backend, settings: &ProviderSettings) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: backend.as_str().to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        let base_url = settings
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(backend.default_base_url())
            .trim_end_matches('/')
            .to_string();

        let model = settings
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(backend.default_model())
            .to_string();

        Ok(Self {
            client,
            base_url,
            model,
            api_key: settings.api_key.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        })
    }
}

/// Send `request` and decode a 2xx JSON body into `T`.
pub(crate) async fn send_json<T: DeserializeOwned>(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, LlmError> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, e))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(provider, status.as_u16(), retry_after, &body));
    }

    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, e))?;
    serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("Failed to decode response body: {e}"),
    })
}

/// Reject an empty completion.
pub(crate) fn require_text(provider: &str, text: Option<String>) -> Result<String, LlmError> {
    match text {
        Some(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "No text in response".to_string(),
        }),
    }
}

pub(crate) fn transport_error(provider: &str, error: reqwest::Error) -> LlmError {
    if error.is_timeout() {
        LlmError::Timeout {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Map a non-2xx status to a classified error.
pub(crate) fn classify_status(
    provider: &str,
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> LlmError {
    let provider = provider.to_string();
    let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    match status {
        401 | 403 => LlmError::AuthFailed { provider, status },
        429 => LlmError::RateLimited {
            provider,
            retry_after,
        },
        408 | 500..=599 => LlmError::ServerError {
            provider,
            status,
            body,
        },
        _ => LlmError::InvalidRequest {
            provider,
            status,
            body,
        },
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    Some(Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0)))
}
