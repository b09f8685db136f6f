//! Send sink: SMTP submission via `lettre`'s async transport.

use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::ExposeSecret;
use tracing::{info, instrument};

use crate::config::{MailSettings, SmtpTls};
use crate::delivery::SendSink;
use crate::delivery::compose::compose;
use crate::error::DeliveryError;
use crate::pipeline::types::{DeliveryMode, DeliveryResult, GeneratedReply};
use crate::retry::RetryPolicy;

/// Submits replies over SMTP. Each attempt opens and closes its own
/// connection.
pub struct SmtpSink {
    settings: MailSettings,
    retry: RetryPolicy,
}

impl SmtpSink {
    pub fn new(settings: MailSettings, retry: RetryPolicy) -> Self {
        Self { settings, retry }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        let host = self.settings.smtp_host.as_str();
        let builder = match self.settings.tls {
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            SmtpTls::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| classify(&e))?,
            SmtpTls::Tls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(host).map_err(|e| classify(&e))?
            }
        };

        let mut builder = builder
            .port(self.settings.smtp_port)
            .timeout(Some(Duration::from_secs(self.settings.timeout_secs.max(1))));

        if let (Some(user), Some(password)) =
            (&self.settings.smtp_user, &self.settings.smtp_password)
        {
            builder = builder.credentials(Credentials::new(
                user.clone(),
                password.expose_secret().to_string(),
            ));
        }

        Ok(builder.build())
    }
}

/// Permanent when the server answered 5xx or the client refused to proceed;
/// everything else (connection refused, 4xx, timeouts, TLS hiccups) may clear.
fn classify(error: &lettre::transport::smtp::Error) -> DeliveryError {
    DeliveryError::Smtp {
        reason: error.to_string(),
        transient: !(error.is_permanent() || error.is_client()),
    }
}

#[async_trait]
impl SendSink for SmtpSink {
    #[instrument(skip_all, fields(to = %reply.to_address, host = %self.settings.smtp_host))]
    async fn send(&self, reply: &GeneratedReply) -> DeliveryResult {
        let target = reply.to_address.clone();
        let message = match compose(reply, false) {
            Ok(message) => message,
            Err(e) => return DeliveryResult::failed(DeliveryMode::Send, target, e),
        };

        let outcome = self
            .retry
            .run("smtp", |_| {
                let message = message.clone();
                async move {
                    let transport = self.transport()?;
                    transport.send(message).await.map_err(|e| classify(&e))
                }
            })
            .await;

        match outcome {
            Ok((response, attempts)) => {
                info!(
                    attempts,
                    code = %response.code(),
                    message_id = %reply.message_id,
                    "Reply submitted"
                );
                DeliveryResult::delivered(DeliveryMode::Send, target, &reply.message_id)
            }
            Err(failure) => DeliveryResult::failed(DeliveryMode::Send, target, failure.error),
        }
    }
}
