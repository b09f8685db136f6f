//! Frame a [`GeneratedReply`] as an RFC 5322 message with `lettre`.

use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::{Address, Message};

use crate::error::DeliveryError;
use crate::pipeline::rules::LOOP_MARKER_HEADER;
use crate::pipeline::types::GeneratedReply;

macro_rules! text_header {
    ($(#[$doc:meta])* $ty:ident, $name:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $ty(pub String);

        impl Header for $ty {
            fn name() -> HeaderName {
                HeaderName::new_from_ascii_str($name)
            }

            fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Self(s.trim().to_string()))
            }

            fn display(&self) -> HeaderValue {
                HeaderValue::new(Self::name(), self.0.clone())
            }
        }
    };
}

text_header!(
    /// RFC 3834 `Auto-Submitted`.
    AutoSubmitted,
    "Auto-Submitted"
);
text_header!(
    /// Asks Exchange-style servers not to answer our replies.
    XAutoResponseSuppress,
    "X-Auto-Response-Suppress"
);
text_header!(XMailer, "X-Mailer");
text_header!(
    /// Loop marker, checked inbound by the rule matcher.
    XMailAgent,
    LOOP_MARKER_HEADER
);
text_header!(XMailAgentDraft, "X-Mail-Agent-Draft");

/// Build the outgoing message. Drafts additionally carry a review marker.
pub fn compose(reply: &GeneratedReply, draft: bool) -> Result<Message, DeliveryError> {
    let from = mailbox(reply.from_name.clone(), &reply.from_address)?;
    let to = mailbox(None, &reply.to_address)?;

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(reply.subject.clone())
        .date_now()
        .message_id(Some(reply.message_id.clone()))
        .header(ContentType::TEXT_PLAIN)
        .header(AutoSubmitted("auto-replied".to_string()))
        .header(XAutoResponseSuppress("All".to_string()))
        .header(XMailer(format!("Mail-Agent/{}", crate::VERSION)))
        .header(XMailAgent(reply.loop_marker.clone()));

    if let Some(in_reply_to) = reply.in_reply_to.as_deref().filter(|v| !v.is_empty()) {
        builder = builder.in_reply_to(in_reply_to.to_string());
    }
    if let Some(references) = reply.references.as_deref().filter(|v| !v.is_empty()) {
        builder = builder.references(references.to_string());
    }
    if draft {
        builder = builder.header(XMailAgentDraft("pending-review".to_string()));
    }

    builder
        .body(reply.body.clone())
        .map_err(|e| DeliveryError::Compose(e.to_string()))
}

fn mailbox(name: Option<String>, address: &str) -> Result<Mailbox, DeliveryError> {
    let address: Address = address
        .trim()
        .parse()
        .map_err(|e: lettre::address::AddressError| DeliveryError::Address {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    Ok(Mailbox::new(name, address))
}
