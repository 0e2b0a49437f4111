//! Error types for device connections
//!
//! Transport-level failures are wrapped into [`DeviceError`] at the
//! connection boundary. Error text headed for logs or status output goes
//! through [`sanitize_error_message`] first, since broker errors can echo
//! credentials back.

use crate::config::ConfigError;
use crate::protocol::ValidationError;
use crate::transport::TransportError;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Main error type for device operations
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Credential negotiation or the initial handshake failed
    #[error("Connect failed: {0}")]
    Connect(#[source] TransportError),

    /// The transport rejected an explicit send
    #[error("Publish failed on {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to serialize message payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection is not open")]
    NotOpen,

    /// The heartbeat/ack worker is gone and can no longer take acks
    #[error("Acknowledgment queue closed")]
    QueueClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl DeviceError {
    pub fn publish(topic: impl Into<String>, source: TransportError) -> Self {
        Self::Publish {
            topic: topic.into(),
            source,
        }
    }

    /// Error text safe to log or show an operator
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

static SECRET_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and sensitive paths, and bound the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
