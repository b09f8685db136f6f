//! Rule matcher: loop prevention plus sender/recipient routing.
//!
//! Runs before any LLM call:
//! - automated or bulk mail, and our own replies → skipped
//! - otherwise the highest-priority enabled rule whose patterns match wins
//!
//! Patterns use regex search semantics (substring match) and are compiled
//! case-insensitive by the config loader.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{EnvelopeSender, MatchedRule, ParsedMessage, Rule, RuleAction};

/// Header stamped on every reply we send; seeing it inbound means a loop.
pub const LOOP_MARKER_HEADER: &str = "X-Mail-Agent";

/// Sender local parts that never want an answer.
static AUTOMATED_SENDER_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?i)^(no-?reply|noreply|mailer-daemon|postmaster)@",
            "automated sender address",
        ),
        (r"(?i)^bounces?@", "bounce handler address"),
        (r"(?i)^auto[-_]?reply@", "auto-reply address"),
    ]
    .into_iter()
    .filter_map(|(pattern, reason)| Regex::new(pattern).ok().map(|re| (re, reason)))
    .collect()
});

/// Headers whose mere presence marks list or bulk traffic.
const LIST_HEADERS: [&str; 3] = ["List-Unsubscribe", "List-Id", "Mailing-List"];

/// Selects which rule (if any) answers a message.
pub struct RuleMatcher {
    /// Sorted by priority, highest first; ties keep declaration order.
    rules: Vec<Rule>,
}

impl RuleMatcher {
    pub fn new(mut rules: Vec<Rule>) -> Self {
        // Stable sort keeps declaration order among equal priorities.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self { rules }
    }

    /// Why the message must not be answered, or `None` if it may be.
    pub fn should_skip(&self, message: &ParsedMessage) -> Option<String> {
        let headers = &message.headers;

        if headers.contains(LOOP_MARKER_HEADER) {
            return Some(format!("{LOOP_MARKER_HEADER} header present (own reply)"));
        }

        if message.envelope_sender == EnvelopeSender::Null {
            return Some("null envelope sender (bounce or notification)".to_string());
        }

        if let Some(value) = headers
            .get_all("Auto-Submitted")
            .map(str::trim)
            .find(|value| !value.eq_ignore_ascii_case("no"))
        {
            return Some(format!("Auto-Submitted: {value}"));
        }

        if let Some(value) = headers
            .get_all("Precedence")
            .map(|value| value.trim().to_ascii_lowercase())
            .find(|value| matches!(value.as_str(), "bulk" | "list" | "junk"))
        {
            return Some(format!("Precedence: {value}"));
        }

        if let Some(header) = LIST_HEADERS.iter().find(|h| headers.contains(h)) {
            return Some(format!("{header} header present (mailing list)"));
        }

        let senders = [
            Some(message.from.as_str()),
            message.envelope_sender.address(),
        ];
        for sender in senders.into_iter().flatten().filter(|s| !s.is_empty()) {
            if let Some((_, reason)) = AUTOMATED_SENDER_PATTERNS
                .iter()
                .find(|(re, _)| re.is_match(sender))
            {
                return Some(format!("{reason}: {sender}"));
            }
        }

        None
    }

    /// First enabled rule, in priority order, that matches the message.
    pub fn match_rule<'a>(&'a self, message: &'a ParsedMessage) -> Option<MatchedRule<'a>> {
        let matched = self.candidates(message).next();
        match &matched {
            Some(m) => debug!(rule = %m.rule.name, priority = m.rule.priority, "Rule matched"),
            None => debug!(from = %message.from, "No rule matched"),
        }
        matched
    }

    /// Every matching reply rule, in priority order. Diagnostics only.
    pub fn match_all<'a>(&'a self, message: &'a ParsedMessage) -> Vec<MatchedRule<'a>> {
        self.candidates(message)
            .filter(|m| m.rule.action == RuleAction::Reply)
            .collect()
    }

    fn candidates<'a>(
        &'a self,
        message: &'a ParsedMessage,
    ) -> impl Iterator<Item = MatchedRule<'a>> + 'a {
        self.rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter_map(move |rule| evaluate(rule, message))
    }
}

fn evaluate<'a>(rule: &'a Rule, message: &'a ParsedMessage) -> Option<MatchedRule<'a>> {
    let sender_matches = [
        message.envelope_sender.address(),
        Some(message.from.as_str()),
    ]
    .into_iter()
    .flatten()
    .filter(|s| !s.is_empty())
    .any(|sender| rule.sender_pattern.is_match(sender));
    if !sender_matches {
        return None;
    }

    let headers_match = rule.headers_match.iter().all(|(name, pattern)| {
        message
            .headers
            .get_all(name)
            .any(|value| pattern.is_match(value))
    });
    if !headers_match {
        return None;
    }

    let recipient = match &rule.recipient_filter {
        None => None,
        Some(filter) => Some(message.recipients().find(|r| filter.is_match(r))?),
    };

    Some(MatchedRule { rule, recipient })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compile_pattern;
    use crate::pipeline::types::{DeliveryMode, HeaderMap};

    fn make_message(from: &str, to: &[&str], headers: &[(&str, &str)]) -> ParsedMessage {
        ParsedMessage {
            envelope_sender: EnvelopeSender::Address(from.to_string()),
            from: from.to_string(),
            from_name: None,
            reply_to: None,
            to: to.iter().map(|s| s.to_string()).collect(),
            cc: vec![],
            subject: "Question".into(),
            body: "Hello there".into(),
            headers: headers.iter().copied().collect::<HeaderMap>(),
            message_id: "<m1@example.com>".into(),
            date: None,
            attachments: vec![],
        }
    }

    fn make_rule(name: &str, sender: &str, priority: i64) -> Rule {
        Rule {
            name: name.into(),
            sender_pattern: compile_pattern(name, sender).unwrap(),
            recipient_filter: None,
            headers_match: vec![],
            provider: "openai".into(),
            mode: DeliveryMode::Send,
            priority,
            system_prompt: "Be helpful.".into(),
            enabled: true,
            action: RuleAction::Reply,
        }
    }

    // ── Loop prevention ─────────────────────────────────────────────

    #[test]
    fn skips_auto_submitted_except_no() {
        let matcher = RuleMatcher::new(vec![]);
        let msg = make_message("a@example.com", &[], &[("Auto-Submitted", "auto-replied")]);
        assert!(matcher.should_skip(&msg).is_some());

        let msg = make_message("a@example.com", &[], &[("Auto-Submitted", "No")]);
        assert!(matcher.should_skip(&msg).is_none());
    }

    #[test]
    fn any_auto_submitted_value_counts() {
        let matcher = RuleMatcher::new(vec![]);
        let msg = make_message(
            "a@example.com",
            &[],
            &[("Auto-Submitted", "no"), ("Auto-Submitted", "auto-replied")],
        );
        let reason = matcher.should_skip(&msg).unwrap();
        assert_eq!(reason, "Auto-Submitted: auto-replied");

        let msg = make_message(
            "a@example.com",
            &[],
            &[("Precedence", "first-class"), ("precedence", "bulk")],
        );
        assert_eq!(matcher.should_skip(&msg).unwrap(), "Precedence: bulk");
    }

    #[test]
    fn skips_bulk_precedence() {
        let matcher = RuleMatcher::new(vec![]);
        for value in ["bulk", "LIST", "junk"] {
            let msg = make_message("a@example.com", &[], &[("Precedence", value)]);
            assert!(matcher.should_skip(&msg).is_some(), "{value}");
        }
        let msg = make_message("a@example.com", &[], &[("Precedence", "first-class")]);
        assert!(matcher.should_skip(&msg).is_none());
    }

    #[test]
    fn skips_list_headers() {
        let matcher = RuleMatcher::new(vec![]);
        for header in LIST_HEADERS {
            let msg = make_message("a@example.com", &[], &[(header, "<x>")]);
            assert!(matcher.should_skip(&msg).is_some(), "{header}");
        }
    }

    #[test]
    fn skips_own_replies() {
        let matcher = RuleMatcher::new(vec![]);
        let msg = make_message("a@example.com", &[], &[("x-mail-agent", "0.1.0")]);
        let reason = matcher.should_skip(&msg).unwrap();
        assert!(reason.contains("own reply"));
    }

    #[test]
    fn skips_automated_senders() {
        let matcher = RuleMatcher::new(vec![]);
        for sender in [
            "noreply@example.com",
            "no-reply@example.com",
            "MAILER-DAEMON@example.com",
            "postmaster@example.com",
            "bounces@example.com",
            "auto_reply@example.com",
        ] {
            assert!(
                matcher.should_skip(&make_message(sender, &[], &[])).is_some(),
                "{sender}"
            );
        }
        assert!(
            matcher
                .should_skip(&make_message("reply-guy@example.com", &[], &[]))
                .is_none()
        );
    }

    #[test]
    fn skips_null_envelope() {
        let matcher = RuleMatcher::new(vec![]);
        let mut msg = make_message("alice@example.com", &[], &[]);
        msg.envelope_sender = EnvelopeSender::Null;
        assert!(matcher.should_skip(&msg).is_some());
    }

    // ── Matching ────────────────────────────────────────────────────

    #[test]
    fn pattern_is_search_not_anchored() {
        let matcher = RuleMatcher::new(vec![make_rule("domain", "example\\.com", 0)]);
        let msg = make_message("Alice@EXAMPLE.com", &[], &[]);
        assert_eq!(matcher.match_rule(&msg).unwrap().rule.name, "domain");

        let anchored = RuleMatcher::new(vec![make_rule("anchored", "^example\\.com$", 0)]);
        assert!(anchored.match_rule(&msg).is_none());
    }

    #[test]
    fn priority_then_declaration_order() {
        let matcher = RuleMatcher::new(vec![
            make_rule("low", ".*", 1),
            make_rule("high-a", ".*", 10),
            make_rule("high-b", ".*", 10),
        ]);
        let msg = make_message("alice@example.com", &[], &[]);

        assert_eq!(matcher.match_rule(&msg).unwrap().rule.name, "high-a");
        let names: Vec<_> = matcher
            .match_all(&msg)
            .iter()
            .map(|m| m.rule.name.as_str())
            .collect();
        assert_eq!(names, vec!["high-a", "high-b", "low"]);
    }

    #[test]
    fn match_all_lists_reply_rules_only() {
        let mut ignore = make_rule("ignore-newsletters", ".*", 100);
        ignore.action = RuleAction::Skip;
        let matcher = RuleMatcher::new(vec![ignore, make_rule("answer", ".*", 0)]);
        let msg = make_message("alice@example.com", &[], &[]);

        assert_eq!(
            matcher.match_rule(&msg).unwrap().rule.name,
            "ignore-newsletters"
        );
        let names: Vec<_> = matcher
            .match_all(&msg)
            .iter()
            .map(|m| m.rule.name.as_str())
            .collect();
        assert_eq!(names, vec!["answer"]);
    }

    #[test]
    fn disabled_rules_never_match() {
        let mut disabled = make_rule("off", ".*", 100);
        disabled.enabled = false;
        let matcher = RuleMatcher::new(vec![disabled, make_rule("on", ".*", 0)]);
        let msg = make_message("alice@example.com", &[], &[]);
        assert_eq!(matcher.match_rule(&msg).unwrap().rule.name, "on");
        assert_eq!(matcher.match_all(&msg).len(), 1);
    }

    #[test]
    fn recipient_filter_checks_to_and_cc() {
        let mut rule = make_rule("support", ".*", 0);
        rule.recipient_filter = Some(compile_pattern("support", "^support@").unwrap());
        let matcher = RuleMatcher::new(vec![rule]);

        let mut msg = make_message("alice@example.com", &["sales@example.com"], &[]);
        assert!(matcher.match_rule(&msg).is_none());

        msg.cc.push("Support@example.com".into());
        let matched = matcher.match_rule(&msg).unwrap();
        assert_eq!(matched.recipient, Some("Support@example.com"));
    }

    #[test]
    fn headers_match_requires_every_header() {
        let mut rule = make_rule("vip", ".*", 0);
        rule.headers_match = vec![("X-Priority".into(), compile_pattern("vip", "^1").unwrap())];
        let matcher = RuleMatcher::new(vec![rule]);

        assert!(
            matcher
                .match_rule(&make_message("a@example.com", &[], &[]))
                .is_none()
        );
        let msg = make_message("a@example.com", &[], &[("X-Priority", "1 (Highest)")]);
        assert!(matcher.match_rule(&msg).is_some());
    }

    #[test]
    fn no_rules_matches_nothing() {
        let matcher = RuleMatcher::new(vec![]);
        assert!(
            matcher
                .match_rule(&make_message("a@example.com", &[], &[]))
                .is_none()
        );
    }
}
