//! Reply generator: provider call under retry, then reply assembly.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{Error, Result, Retryable};
use crate::llm::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::pipeline::types::{GeneratedReply, ParsedMessage, Rule};

/// Who replies are sent as.
#[derive(Debug, Clone)]
pub struct ReplyIdentity {
    pub address: String,
    pub name: Option<String>,
}

pub struct ReplyGenerator {
    registry: Arc<ProviderRegistry>,
    retry: RetryPolicy,
    identity: ReplyIdentity,
}

impl ReplyGenerator {
    pub fn new(registry: Arc<ProviderRegistry>, retry: RetryPolicy, identity: ReplyIdentity) -> Self {
        Self {
            registry,
            retry,
            identity,
        }
    }

    /// Generate a reply to `message` using `rule`'s provider and prompt.
    ///
    /// Provider lookup happens before any network call, so a missing
    /// credential fails fast with a permanent error.
    #[instrument(skip_all, fields(rule = %rule.name, provider = %rule.provider))]
    pub async fn generate(&self, message: &ParsedMessage, rule: &Rule) -> Result<GeneratedReply> {
        let provider = self.registry.resolve(&rule.provider)?;
        let label = format!("llm:{}", provider.name());

        let (body, attempts) = self
            .retry
            .run(&label, |_| {
                provider.generate_reply(&message.body, &rule.system_prompt, &message.subject)
            })
            .await
            .map_err(|failure| {
                if failure.error.is_transient() {
                    Error::GenerationFailed {
                        attempts: failure.attempts,
                        source: failure.error,
                    }
                } else {
                    Error::GenerationRejected {
                        source: failure.error,
                    }
                }
            })?;

        info!(
            model = provider.model_name(),
            attempts,
            chars = body.len(),
            "Reply generated"
        );

        Ok(self.assemble(message, body))
    }

    fn assemble(&self, message: &ParsedMessage, body: String) -> GeneratedReply {
        let original_id = message.message_id.trim();
        let references = match message.headers.get("References").map(str::trim) {
            Some(chain) if !chain.is_empty() => format!("{chain} {original_id}"),
            _ => original_id.to_string(),
        };

        GeneratedReply {
            from_address: self.identity.address.clone(),
            from_name: self.identity.name.clone(),
            to_address: message.reply_address().to_string(),
            subject: reply_subject(&message.subject),
            body,
            message_id: new_message_id(&self.identity.address),
            in_reply_to: Some(original_id.to_string()).filter(|id| !id.is_empty()),
            references: Some(references).filter(|r| !r.is_empty()),
            loop_marker: crate::VERSION.to_string(),
        }
    }
}

/// `Re: ` + subject, unless it already carries a reply prefix.
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject.is_empty() {
        return "Re: (no subject)".to_string();
    }
    let has_prefix = subject
        .get(..3)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:"));
    if has_prefix {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Fresh `<uuid@domain>` identifier using the sender's domain.
fn new_message_id(from_address: &str) -> String {
    let domain = from_address
        .rsplit_once('@')
        .map(|(_, d)| d.trim())
        .filter(|d| !d.is_empty())
        .unwrap_or("mail-agent.local");
    format!("<{}@{}>", Uuid::new_v4(), domain)
}
