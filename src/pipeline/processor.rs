//! Message processor: one inbound message, at most one reply.
//!
//! Flow:
//! 1. Loop prevention (`should_skip`) → may end with no action
//! 2. Rule matching (no LLM) → may end with no action
//! 3. Reply generation (LLM, retried)
//! 4. Delivery via the rule's mode
//!
//! Everything after parsing runs under the invocation deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::deadline;
use crate::delivery::{DeliveryRouter, DraftSink, DryRunSink, ImapDraftSink, SendSink, SmtpSink};
use crate::error::{DeliveryError, Error, Result};
use crate::llm::ProviderRegistry;
use crate::pipeline::generator::{ReplyGenerator, ReplyIdentity};
use crate::pipeline::parser;
use crate::pipeline::rules::RuleMatcher;
use crate::pipeline::types::{NoActionReason, Outcome, ParsedMessage, RuleAction};
use crate::retry::RetryPolicy;

pub struct MessageProcessor {
    matcher: RuleMatcher,
    generator: ReplyGenerator,
    router: DeliveryRouter,
    deadline: Duration,
}

impl MessageProcessor {
    pub fn new(
        matcher: RuleMatcher,
        generator: ReplyGenerator,
        router: DeliveryRouter,
        deadline: Duration,
    ) -> Self {
        Self {
            matcher,
            generator,
            router,
            deadline,
        }
    }

    /// Wire up the real pipeline from configuration.
    ///
    /// With `dry_run`, both sinks are replaced by the given recorder.
    pub fn from_config(config: &Config, dry_run: Option<Arc<DryRunSink>>) -> Result<Self> {
        let settings = &config.settings;
        let mail = config.mail()?;
        let rules = config.rules()?;
        let retry = RetryPolicy::from(&settings.retry);
        let registry = Arc::new(ProviderRegistry::from_settings(&settings.llm));

        let (send, draft): (Arc<dyn SendSink>, Option<Arc<dyn DraftSink>>) = match dry_run {
            Some(recorder) => (
                recorder.clone() as Arc<dyn SendSink>,
                Some(recorder as Arc<dyn DraftSink>),
            ),
            None => (
                Arc::new(SmtpSink::new(mail.clone(), retry.clone())) as Arc<dyn SendSink>,
                settings.imap.clone().map(|imap| {
                    Arc::new(ImapDraftSink::new(imap, retry.clone())) as Arc<dyn DraftSink>
                }),
            ),
        };

        let identity = ReplyIdentity {
            address: mail.from_address.trim().to_string(),
            name: mail.from_name.clone(),
        };

        Ok(Self::new(
            RuleMatcher::new(rules),
            ReplyGenerator::new(registry, retry, identity),
            DeliveryRouter::new(send, draft)
                .with_fallback_to_draft(settings.delivery.fallback_to_draft),
            Duration::from_secs(settings.runtime.deadline_secs.max(1)),
        ))
    }

    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    /// Parse and process raw message bytes.
    pub async fn process_raw(&self, raw: &[u8], envelope_sender: Option<&str>) -> Result<Outcome> {
        let message = parser::parse(raw, envelope_sender)?;
        self.process(&message).await
    }

    /// Process a parsed message under the invocation deadline.
    #[instrument(skip_all, fields(message_id = %message.message_id, from = %message.from))]
    pub async fn process(&self, message: &ParsedMessage) -> Result<Outcome> {
        let at = Instant::now() + self.deadline;
        let run = deadline::scope(at, self.run(message));
        match tokio::time::timeout(self.deadline, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline_secs = self.deadline.as_secs(), "Invocation deadline exceeded");
                Err(Error::DeadlineExceeded(self.deadline))
            }
        }
    }

    async fn run(&self, message: &ParsedMessage) -> Result<Outcome> {
        if let Some(reason) = self.matcher.should_skip(message) {
            info!(%reason, "Skipping message");
            return Ok(Outcome::NoAction(NoActionReason::Skipped(reason)));
        }

        let Some(matched) = self.matcher.match_rule(message) else {
            info!("No matching rule");
            return Ok(Outcome::NoAction(NoActionReason::NoMatchingRule));
        };
        let rule = matched.rule;

        if rule.action == RuleAction::Skip {
            info!(rule = %rule.name, "Skip rule matched");
            return Ok(Outcome::NoAction(NoActionReason::SkipRule(rule.name.clone())));
        }

        let reply = self.generator.generate(message, rule).await?;
        let result = self.router.route(&reply, rule.mode).await;

        if !result.success {
            let error = result.error.unwrap_or_else(|| DeliveryError::Smtp {
                reason: "delivery failed without a reported cause".to_string(),
                transient: true,
            });
            return Err(error.into());
        }

        info!(
            rule = %rule.name,
            mode = %result.mode,
            target = %result.target,
            reply_id = %reply.message_id,
            "Reply delivered"
        );
        Ok(Outcome::Delivered {
            rule: rule.name.clone(),
            provider: rule.provider.clone(),
            reply,
            result,
        })
    }
}
