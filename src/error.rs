//! Error types for Mail Agent.
//!
//! Every failure that can end an invocation maps to a [`Disposition`], which in
//! turn maps to the exit code the pipe transport understands.

use std::time::Duration;

/// How the invoking mail transport should treat the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled (delivered, drafted, or intentionally skipped). Accept and discard.
    Accept,
    /// Transient failure after local retries. Requeue and try again later.
    Defer,
    /// Unrecoverable. Bounce.
    Bounce,
}

/// `EX_OK`
pub const EXIT_SUCCESS: i32 = 0;
/// `EX_UNAVAILABLE`; pipe(8) bounces the message.
pub const EXIT_PERMANENT_FAILURE: i32 = 69;
/// `EX_TEMPFAIL`; pipe(8) defers the message.
pub const EXIT_TEMPORARY_FAILURE: i32 = 75;
/// `EX_CONFIG`; reported by validate mode.
pub const EXIT_CONFIG_ERROR: i32 = 78;

impl Disposition {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Accept => EXIT_SUCCESS,
            Self::Defer => EXIT_TEMPORARY_FAILURE,
            Self::Bounce => EXIT_PERMANENT_FAILURE,
        }
    }
}

/// Classifies an error as worth retrying or not.
pub trait Retryable {
    /// True when retrying may succeed without outside intervention.
    fn is_transient(&self) -> bool;

    /// Server-requested minimum wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Top-level error type for one invocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed message: {0}")]
    Parse(#[from] ParseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Reply generation failed after {attempts} attempt(s): {source}")]
    GenerationFailed {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    #[error("Reply generation rejected by provider: {source}")]
    GenerationRejected {
        #[source]
        source: LlmError,
    },

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Invocation deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map this error to the transport's accept/defer/bounce decision.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Parse(_) | Self::Config(_) | Self::Provider(_) => Disposition::Bounce,
            Self::GenerationRejected { .. } => Disposition::Bounce,
            Self::GenerationFailed { .. } | Self::DeadlineExceeded(_) => Disposition::Defer,
            Self::Delivery(e) if e.is_transient() => Disposition::Defer,
            Self::Delivery(_) => Disposition::Bounce,
            // Reading stdin failed; the transport still has the message.
            Self::Io(_) => Disposition::Defer,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.disposition().exit_code()
    }
}

/// The inbound message could not be turned into something we can reply to.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Empty input")]
    Empty,

    #[error("No usable sender address (checked envelope, Return-Path, From)")]
    NoSender,
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid pattern in rule {rule:?}: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provider lookup errors, raised before any network call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Unknown LLM provider {name:?}; available: {available}")]
    Unknown { name: String, available: String },

    #[error("LLM provider {name:?} is unavailable: {reason}")]
    Unavailable { name: String, reason: String },
}

/// Per-request LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} returned HTTP {status}: {body}")]
    ServerError {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Authentication failed for provider {provider} (HTTP {status})")]
    AuthFailed { provider: String, status: u16 },

    #[error("Provider {provider} rejected the request (HTTP {status}): {body}")]
    InvalidRequest {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl Retryable for LlmError {
    fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::ServerError { .. }
            | Self::InvalidResponse { .. } => true,
            Self::AuthFailed { .. } | Self::InvalidRequest { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Delivery errors from either sink.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Could not build message: {0}")]
    Compose(String),

    #[error("Invalid address {address:?}: {reason}")]
    Address { address: String, reason: String },

    #[error("SMTP error: {reason}")]
    Smtp { reason: String, transient: bool },

    #[error("IMAP error: {reason}")]
    Imap { reason: String, transient: bool },

    #[error("Sink not configured: {0}")]
    NotConfigured(String),

    #[error("{sink} delivery stopped at the invocation deadline")]
    DeadlineReached { sink: &'static str },
}

impl Retryable for DeliveryError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Smtp { transient, .. } | Self::Imap { transient, .. } => *transient,
            Self::DeadlineReached { .. } => true,
            Self::Compose(_) | Self::Address { .. } | Self::NotConfigured(_) => false,
        }
    }
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
