//! Mail Agent: LLM-backed auto-responder for a mail transport's pipe delivery.
//!
//! One invocation reads one message, decides whether and how to answer it,
//! and reports the outcome as an exit code the transport understands.

pub mod config;
pub mod deadline;
pub mod delivery;
pub mod error;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod retry;

pub use error::{Disposition, Error, Result};

/// Crate version, stamped into the loop marker and `X-Mailer` headers.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
