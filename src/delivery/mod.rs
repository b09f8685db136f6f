//! Delivery: hand a generated reply to exactly one sink.
//!
//! - `send`  → [`SendSink`] (SMTP)
//! - `draft` → [`DraftSink`] (IMAP drafts folder)
//!
//! A failed send is reported as failed. Falling back to a draft happens only
//! when `delivery.fallback_to_draft` is switched on.

pub mod compose;
pub mod imap;
pub mod smtp;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::DeliveryError;
use crate::pipeline::types::{DeliveryMode, DeliveryResult, GeneratedReply};

pub use imap::ImapDraftSink;
pub use smtp::SmtpSink;

/// Submits a reply for immediate delivery.
#[async_trait]
pub trait SendSink: Send + Sync {
    async fn send(&self, reply: &GeneratedReply) -> DeliveryResult;
}

/// Stores a reply for human review.
#[async_trait]
pub trait DraftSink: Send + Sync {
    async fn save_draft(&self, reply: &GeneratedReply) -> DeliveryResult;
}

/// Dispatches on delivery mode.
pub struct DeliveryRouter {
    send: Arc<dyn SendSink>,
    draft: Option<Arc<dyn DraftSink>>,
    fallback_to_draft: bool,
}

impl DeliveryRouter {
    pub fn new(send: Arc<dyn SendSink>, draft: Option<Arc<dyn DraftSink>>) -> Self {
        Self {
            send,
            draft,
            fallback_to_draft: false,
        }
    }

    /// Save a draft when sending fails for good.
    pub fn with_fallback_to_draft(mut self, enabled: bool) -> Self {
        self.fallback_to_draft = enabled;
        self
    }

    pub async fn route(&self, reply: &GeneratedReply, mode: DeliveryMode) -> DeliveryResult {
        match mode {
            DeliveryMode::Draft => self.save_draft(reply).await,
            DeliveryMode::Send => {
                let result = self.send.send(reply).await;
                if result.success || !self.fallback_to_draft || self.draft.is_none() {
                    return result;
                }
                warn!(
                    error = ?result.error,
                    to = %reply.to_address,
                    "Send failed, falling back to draft"
                );
                self.save_draft(reply).await
            }
        }
    }

    async fn save_draft(&self, reply: &GeneratedReply) -> DeliveryResult {
        match &self.draft {
            Some(sink) => sink.save_draft(reply).await,
            None => DeliveryResult::failed(
                DeliveryMode::Draft,
                "",
                DeliveryError::NotConfigured("draft mode requires an [imap] section".to_string()),
            ),
        }
    }
}

/// Records replies instead of delivering them. Used by `--dry-run` and
/// `--test`.
#[derive(Default)]
pub struct DryRunSink {
    recorded: Mutex<Vec<(DeliveryMode, GeneratedReply)>>,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in order.
    pub fn recorded(&self) -> Vec<(DeliveryMode, GeneratedReply)> {
        self.recorded
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn record(&self, mode: DeliveryMode, reply: &GeneratedReply) -> DeliveryResult {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push((mode, reply.clone()));
        }
        info!(mode = %mode, to = %reply.to_address, "Dry run: reply not delivered");
        DeliveryResult::delivered(mode, "dry-run", &reply.message_id)
    }
}

#[async_trait]
impl SendSink for DryRunSink {
    async fn send(&self, reply: &GeneratedReply) -> DeliveryResult {
        self.record(DeliveryMode::Send, reply)
    }
}

#[async_trait]
impl DraftSink for DryRunSink {
    async fn save_draft(&self, reply: &GeneratedReply) -> DeliveryResult {
        self.record(DeliveryMode::Draft, reply)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FailingSend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SendSink for FailingSend {
        async fn send(&self, reply: &GeneratedReply) -> DeliveryResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            DeliveryResult::failed(
                DeliveryMode::Send,
                reply.to_address.clone(),
                DeliveryError::Smtp {
                    reason: "550 rejected".into(),
                    transient: false,
                },
            )
        }
    }

    fn reply() -> GeneratedReply {
        GeneratedReply {
            from_address: "agent@example.org".into(),
            from_name: None,
            to_address: "alice@example.com".into(),
            subject: "Re: Hi".into(),
            body: "Hello".into(),
            message_id: "<r@example.org>".into(),
            in_reply_to: None,
            references: None,
            loop_marker: crate::VERSION.into(),
        }
    }

    #[tokio::test]
    async fn draft_mode_only_touches_draft_sink() {
        let send = Arc::new(FailingSend {
            calls: AtomicU32::new(0),
        });
        let drafts = Arc::new(DryRunSink::new());
        let router = DeliveryRouter::new(send.clone(), Some(drafts.clone() as Arc<dyn DraftSink>));

        let result = router.route(&reply(), DeliveryMode::Draft).await;
        assert!(result.success);
        assert_eq!(result.mode, DeliveryMode::Draft);
        assert_eq!(send.calls.load(Ordering::SeqCst), 0);
        assert_eq!(drafts.recorded().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_is_not_redirected_by_default() {
        let send = Arc::new(FailingSend {
            calls: AtomicU32::new(0),
        });
        let drafts = Arc::new(DryRunSink::new());
        let router = DeliveryRouter::new(send.clone(), Some(drafts.clone() as Arc<dyn DraftSink>));

        let result = router.route(&reply(), DeliveryMode::Send).await;
        assert!(!result.success);
        assert_eq!(result.mode, DeliveryMode::Send);
        assert!(drafts.recorded().is_empty());
    }

    #[tokio::test]
    async fn fallback_saves_draft_when_enabled() {
        let send = Arc::new(FailingSend {
            calls: AtomicU32::new(0),
        });
        let drafts = Arc::new(DryRunSink::new());
        let router =
            DeliveryRouter::new(send.clone(), Some(drafts.clone() as Arc<dyn DraftSink>)).with_fallback_to_draft(true);

        let result = router.route(&reply(), DeliveryMode::Send).await;
        assert!(result.success);
        assert_eq!(result.mode, DeliveryMode::Draft);
        assert_eq!(send.calls.load(Ordering::SeqCst), 1);
        assert_eq!(drafts.recorded().len(), 1);
    }

    #[tokio::test]
    async fn draft_without_imap_is_not_configured() {
        let router = DeliveryRouter::new(Arc::new(DryRunSink::new()), None);
        let result = router.route(&reply(), DeliveryMode::Draft).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(DeliveryError::NotConfigured(_))));
    }
}
