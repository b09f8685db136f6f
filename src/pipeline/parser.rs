//! Message parser: raw RFC 5322 bytes → [`ParsedMessage`].
//!
//! MIME decoding is delegated to `mail-parser`. The only hard failure is a
//! message with no usable sender; every other defect degrades to an empty
//! string.

use mail_parser::{Address, Message, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::debug;
use uuid::Uuid;

use crate::error::ParseError;
use crate::pipeline::types::{EnvelopeSender, HeaderMap, ParsedMessage};

/// Parse a raw message.
///
/// `envelope_override` is the transport-supplied sender (e.g. Postfix's
/// `${sender}`); it wins over `Return-Path`.
pub fn parse(raw: &[u8], envelope_override: Option<&str>) -> Result<ParsedMessage, ParseError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let headers = split_headers(raw);
    let parsed = MessageParser::default().parse(raw);

    let (from, from_name) = match parsed.as_ref().and_then(|m| first_address(m.from())) {
        Some((address, name)) => (address, name),
        None => (
            headers
                .get("From")
                .and_then(bare_address)
                .unwrap_or_default(),
            None,
        ),
    };

    let envelope_sender = envelope_override
        .map(parse_envelope)
        .or_else(|| headers.get("Return-Path").map(parse_envelope))
        .unwrap_or_else(|| EnvelopeSender::Address(from.clone()));

    let envelope_usable = envelope_sender
        .address()
        .is_some_and(|a| !a.is_empty());
    if from.is_empty() && !envelope_usable {
        return Err(ParseError::NoSender);
    }
    // A missing From still leaves us someone to answer.
    let envelope_sender = match envelope_sender {
        EnvelopeSender::Address(a) if a.is_empty() => EnvelopeSender::Address(from.clone()),
        other => other,
    };

    let Some(message) = parsed else {
        debug!("MIME parse failed, continuing with raw headers only");
        return Ok(ParsedMessage {
            envelope_sender,
            from,
            from_name,
            reply_to: headers.get("Reply-To").and_then(bare_address),
            to: Vec::new(),
            cc: Vec::new(),
            subject: headers.get("Subject").unwrap_or_default().to_string(),
            body: String::new(),
            message_id: normalize_message_id(headers.get("Message-ID")),
            date: headers.get("Date").map(str::to_string),
            attachments: Vec::new(),
            headers,
        });
    };

    let message_id = normalize_message_id(message.message_id());

    Ok(ParsedMessage {
        envelope_sender,
        from,
        from_name,
        reply_to: first_address(message.reply_to()).map(|(a, _)| a),
        to: extract_addresses(message.to()),
        cc: extract_addresses(message.cc()),
        subject: message.subject().unwrap_or_default().trim().to_string(),
        body: extract_body(&message),
        message_id,
        date: headers.get("Date").map(str::to_string),
        attachments: attachment_names(&message),
        headers,
    })
}

// ── Headers ─────────────────────────────────────────────────────────

/// Split the header block into a raw [`HeaderMap`], unfolding continuation
/// lines. Values are trimmed but not decoded.
pub fn split_headers(raw: &[u8]) -> HeaderMap {
    let text = String::from_utf8_lossy(raw);
    let mut headers = HeaderMap::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.insert(name, value);
        }
        // Lines without a colon are junk (or an mbox "From " line); skip them.
        if let Some((name, value)) = line.split_once(':')
            && !name.is_empty()
            && !name.contains(' ')
        {
            current = Some((name.to_string(), value.trim().to_string()));
        }
    }
    if let Some((name, value)) = current {
        headers.insert(name, value);
    }
    headers
}

fn parse_envelope(raw: &str) -> EnvelopeSender {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "<>" {
        return EnvelopeSender::Null;
    }
    match bare_address(trimmed) {
        Some(address) => EnvelopeSender::Address(address),
        None => EnvelopeSender::Null,
    }
}

/// Pull `user@host` out of `Name <user@host>` or a bare address.
fn bare_address(raw: &str) -> Option<String> {
    let candidate = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };
    let candidate = candidate.trim().trim_matches(|c| c == '"' || c == '\'');
    if candidate.contains('@') && !candidate.contains(char::is_whitespace) {
        Some(candidate.to_string())
    } else {
        None
    }
}

fn normalize_message_id(raw: Option<&str>) -> String {
    let id = raw
        .map(|s| s.trim().trim_start_matches('<').trim_end_matches('>').trim())
        .filter(|s| !s.is_empty());
    match id {
        Some(id) => format!("<{id}>"),
        None => format!("<gen-{}@mail-agent.invalid>", Uuid::new_v4()),
    }
}

// ── Addresses ───────────────────────────────────────────────────────

fn first_address(addr: Option<&Address<'_>>) -> Option<(String, Option<String>)> {
    let first = addr?.first()?;
    let address = first.address()?.trim();
    if address.is_empty() {
        return None;
    }
    let name = first
        .name()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Some((address.to_string(), name))
}

/// Extract email addresses from an optional address header.
///
/// Returns an empty vec if the header is absent.
pub fn extract_addresses(addr: Option<&Address<'_>>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

// ── Body ────────────────────────────────────────────────────────────

/// Part indices in depth-first order, starting at the root.
fn depth_first_parts(message: &Message<'_>) -> Vec<usize> {
    let mut order = Vec::new();
    let mut stack = vec![0_usize];
    while let Some(id) = stack.pop() {
        if order.len() >= message.parts.len() {
            break;
        }
        let Some(part) = message.parts.get(id) else {
            continue;
        };
        order.push(id);
        if let PartType::Multipart(children) = &part.body {
            stack.extend(children.iter().rev().map(|child| *child as usize));
        }
    }
    order
}

fn is_attachment(part: &MessagePart<'_>) -> bool {
    part.content_disposition()
        .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"))
}

fn is_plain_text(part: &MessagePart<'_>) -> bool {
    match part.content_type() {
        None => true,
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_none_or(|s| s.eq_ignore_ascii_case("plain"))
        }
    }
}

/// First `text/plain` part, else the first `text/html` part as text, else "".
fn extract_body(message: &Message<'_>) -> String {
    let order = depth_first_parts(message);
    let inline = || {
        order
            .iter()
            .filter_map(|id| message.parts.get(*id))
            .filter(|part| !is_attachment(part))
    };

    if let Some(text) = inline().find_map(|part| match &part.body {
        PartType::Text(text) if is_plain_text(part) => Some(text.trim().to_string()),
        _ => None,
    }) {
        return text;
    }

    inline()
        .find_map(|part| match &part.body {
            PartType::Html(html) => Some(strip_html(html)),
            _ => None,
        })
        .unwrap_or_default()
}

fn attachment_names(message: &Message<'_>) -> Vec<String> {
    message
        .parts
        .iter()
        .filter(|part| is_attachment(part))
        .map(|part| part.attachment_name().unwrap_or("unnamed").to_string())
        .collect()
}

/// Strip HTML tags from content, dropping script/style bodies and decoding
/// the common entities.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();
    let mut skip_until: Option<&'static str> = None;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                let closing = tag.starts_with('/');
                match (skip_until, closing, name.as_str()) {
                    (None, false, "script") => skip_until = Some("script"),
                    (None, false, "style") => skip_until = Some("style"),
                    (Some(end), true, n) if n == end => skip_until = None,
                    (None, _, "br" | "p" | "div" | "li" | "tr") => result.push(' '),
                    _ => {}
                }
            }
            _ if in_tag => tag.push(ch),
            _ if skip_until.is_some() => {}
            _ => result.push(ch),
        }
    }

    let decoded = result
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
