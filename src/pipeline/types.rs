//! Shared types for the message processing pipeline.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Disposition};

// ── Headers ─────────────────────────────────────────────────────────

/// Raw header map: case-insensitive names, multiple values per name,
/// original order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in message order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

// ── Inbound message ─────────────────────────────────────────────────

/// Transport-level sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeSender {
    /// A real return path.
    Address(String),
    /// The null return path `<>`, used by bounces and other notifications.
    Null,
}

impl EnvelopeSender {
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Address(a) => Some(a),
            Self::Null => None,
        }
    }
}

/// A parsed inbound message. Immutable once built by the parser.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub envelope_sender: EnvelopeSender,
    /// `From` header address (empty when absent).
    pub from: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    /// Plain-text body from the best available part.
    pub body: String,
    pub headers: HeaderMap,
    /// Message identifier in angle-bracket form, e.g. `<abc@example.com>`.
    pub message_id: String,
    pub date: Option<String>,
    pub attachments: Vec<String>,
}

impl ParsedMessage {
    /// Address the reply goes to: `Reply-To`, then `From`, then the envelope.
    pub fn reply_address(&self) -> &str {
        if let Some(reply_to) = self.reply_to.as_deref().filter(|a| !a.is_empty()) {
            return reply_to;
        }
        if !self.from.is_empty() {
            return &self.from;
        }
        self.envelope_sender.address().unwrap_or_default()
    }

    /// All `To` and `Cc` recipients.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to.iter().chain(self.cc.iter()).map(String::as_str)
    }
}

// ── Rules ───────────────────────────────────────────────────────────

/// Where a generated reply goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Submit via SMTP immediately.
    #[default]
    Send,
    /// Save into the IMAP drafts folder for review.
    Draft,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Draft => "draft",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "send" => Ok(Self::Send),
            "draft" => Ok(Self::Draft),
            other => Err(format!("unknown delivery mode '{other}' (expected send or draft)")),
        }
    }
}

/// What a matching rule asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Reply,
    /// Matching messages are left alone.
    Skip,
}

/// A compiled routing rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    /// Searched (not anchored) against the sender.
    pub sender_pattern: Regex,
    /// Searched against each `To`/`Cc` recipient.
    pub recipient_filter: Option<Regex>,
    /// Header name → pattern; all must match.
    pub headers_match: Vec<(String, Regex)>,
    pub provider: String,
    pub mode: DeliveryMode,
    /// Higher is evaluated first.
    pub priority: i64,
    pub system_prompt: String,
    pub enabled: bool,
    pub action: RuleAction,
}

/// The winning rule and the recipient that satisfied its filter.
#[derive(Debug, Clone, Copy)]
pub struct MatchedRule<'a> {
    pub rule: &'a Rule,
    /// `None` when the rule has no recipient filter.
    pub recipient: Option<&'a str>,
}

// ── Reply ───────────────────────────────────────────────────────────

/// A reply ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedReply {
    pub from_address: String,
    pub from_name: Option<String>,
    /// The original sender.
    pub to_address: String,
    pub subject: String,
    pub body: String,
    /// Identifier of the reply itself, angle-bracket form.
    pub message_id: String,
    pub in_reply_to: Option<String>,
    /// Space-separated chain, oldest first.
    pub references: Option<String>,
    /// Value of the loop-prevention marker header.
    pub loop_marker: String,
}

// ── Delivery ────────────────────────────────────────────────────────

/// Outcome of handing a reply to a sink.
#[derive(Debug)]
pub struct DeliveryResult {
    pub mode: DeliveryMode,
    pub success: bool,
    /// SMTP recipient or drafts-folder path.
    pub target: String,
    pub message_id: Option<String>,
    pub error: Option<DeliveryError>,
}

impl DeliveryResult {
    pub fn delivered(mode: DeliveryMode, target: impl Into<String>, message_id: &str) -> Self {
        Self {
            mode,
            success: true,
            target: target.into(),
            message_id: Some(message_id.to_string()),
            error: None,
        }
    }

    pub fn failed(mode: DeliveryMode, target: impl Into<String>, error: DeliveryError) -> Self {
        Self {
            mode,
            success: false,
            target: target.into(),
            message_id: None,
            error: Some(error),
        }
    }
}

// ── Pipeline outcome ────────────────────────────────────────────────

/// Why no reply was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoActionReason {
    /// Loop prevention fired.
    Skipped(String),
    NoMatchingRule,
    /// A rule with `action = "skip"` matched.
    SkipRule(String),
}

impl fmt::Display for NoActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
            Self::NoMatchingRule => f.write_str("no matching rule"),
            Self::SkipRule(rule) => write!(f, "skip rule '{rule}' matched"),
        }
    }
}

/// What one invocation did with its message.
#[derive(Debug)]
pub enum Outcome {
    NoAction(NoActionReason),
    Delivered {
        rule: String,
        provider: String,
        reply: GeneratedReply,
        result: DeliveryResult,
    },
}

impl Outcome {
    /// Delivered, drafted or deliberately left alone: the message is handled.
    pub fn disposition(&self) -> Disposition {
        Disposition::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive_and_multi_valued() {
        let headers: HeaderMap = [
            ("Received", "from a"),
            ("received", "from b"),
            ("Auto-Submitted", "auto-replied"),
        ]
        .into_iter()
        .collect();

        assert_eq!(headers.get("AUTO-SUBMITTED"), Some("auto-replied"));
        assert_eq!(
            headers.get_all("Received").collect::<Vec<_>>(),
            vec!["from a", "from b"]
        );
        assert!(!headers.contains("List-Id"));
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn delivery_mode_parses_case_insensitively() {
        assert_eq!("Draft".parse::<DeliveryMode>(), Ok(DeliveryMode::Draft));
        assert_eq!(" send ".parse::<DeliveryMode>(), Ok(DeliveryMode::Send));
        assert!("queue".parse::<DeliveryMode>().is_err());
    }

    #[test]
    fn reply_address_prefers_reply_to() {
        let mut msg = ParsedMessage {
            envelope_sender: EnvelopeSender::Address("bounce@lists.example.com".into()),
            from: "alice@example.com".into(),
            from_name: None,
            reply_to: Some("help@example.com".into()),
            to: vec![],
            cc: vec![],
            subject: String::new(),
            body: String::new(),
            headers: HeaderMap::new(),
            message_id: "<1@example.com>".into(),
            date: None,
            attachments: vec![],
        };
        assert_eq!(msg.reply_address(), "help@example.com");
        msg.reply_to = None;
        assert_eq!(msg.reply_address(), "alice@example.com");
        msg.from.clear();
        assert_eq!(msg.reply_address(), "bounce@lists.example.com");
    }

    #[test]
    fn every_outcome_is_accepted() {
        let outcome = Outcome::NoAction(NoActionReason::NoMatchingRule);
        assert_eq!(outcome.disposition(), Disposition::Accept);
        assert_eq!(outcome.disposition().exit_code(), crate::error::EXIT_SUCCESS);
    }
}
