//! Structured error types for the conversation hub core.
//!
//! Every fallible operation in `conclave-core` returns `Result<T>` with a
//! single `HubError` enum so retryability and user-facing messages stay
//! centralized instead of scattered across call sites.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for the conversation hub core.
#[derive(Error, Debug)]
pub enum HubError {
    // =========================================================================
    // Caller / argument errors
    // =========================================================================
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    // =========================================================================
    // Identity / authorization errors
    // =========================================================================
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("participant {participant_id} is not a participant of conversation {conversation_id}")]
    NotAParticipant {
        participant_id: String,
        conversation_id: String,
    },

    #[error("conversation type {conversation_type} requires a moderator")]
    ModeratorMissing { conversation_type: String },

    #[error("participant {0} is not known to the Agent Manager")]
    UnknownParticipant(String),

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    // =========================================================================
    // Protocol-level refusals
    // =========================================================================
    #[error("message rejected: out of turn for {participant_id}")]
    OutOfTurn { participant_id: String },

    #[error("participant count {actual} outside allowed range [{min}, {max}]")]
    OutOfCapacityRange { min: usize, max: usize, actual: usize },

    // =========================================================================
    // Backpressure / provider errors
    // =========================================================================
    #[error("task queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("transport failure: {message}")]
    TransportFailure { message: String },

    #[error("authentication failure: {message}")]
    AuthFailure { message: String },

    #[error("context window exceeded: {used_tokens} tokens used, limit {max_tokens}")]
    ContextExceeded { max_tokens: usize, used_tokens: usize },

    // =========================================================================
    // Journal / file-store failures
    // =========================================================================
    #[error("io failure: {message}")]
    IoFailure { message: String },

    #[error("schema failure: {message}")]
    SchemaFailure { message: String },

    #[error("file size exceeded: {size} bytes, limit {limit}")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("file type disallowed: {extension}")]
    TypeDisallowed { extension: String },

    // =========================================================================
    // Internal
    // =========================================================================
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),
}

impl HubError {
    /// Whether the Message Router should retry this error (§7).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::TransportFailure { .. }
        )
    }

    /// Whether this error is surfaced to the user immediately rather than retried.
    pub fn surfaces_immediately(&self) -> bool {
        matches!(self, Self::AuthFailure { .. } | Self::ContextExceeded { .. })
    }

    /// A short, user-facing summary suitable for a system Message body (§7).
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthFailure { .. } => "Authentication with the model provider failed.".to_string(),
            Self::ContextExceeded { .. } => {
                "The conversation is too long for this model's context window.".to_string()
            }
            Self::RateLimited { .. } => "The model provider asked us to slow down.".to_string(),
            Self::Timeout { .. } => "The model provider did not respond in time.".to_string(),
            Self::QueueFull { .. } => "The agent task queue is full; try again shortly.".to_string(),
            _ => self.to_string(),
        }
    }

    /// The error taxonomy kind, for journal `message_rejected` / system Message records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::InvalidState { .. } => "InvalidState",
            Self::InvalidConfiguration { .. } => "InvalidConfiguration",
            Self::NotFound { .. } => "NotFound",
            Self::NotAParticipant { .. } => "NotAParticipant",
            Self::ModeratorMissing { .. } => "ModeratorMissing",
            Self::UnknownParticipant(_) => "UnknownParticipant",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::OutOfTurn { .. } => "OutOfTurn",
            Self::OutOfCapacityRange { .. } => "OutOfCapacityRange",
            Self::QueueFull { .. } => "QueueFull",
            Self::RateLimited { .. } => "RateLimited",
            Self::Timeout { .. } => "Timeout",
            Self::TransportFailure { .. } => "TransportFailure",
            Self::AuthFailure { .. } => "AuthFailure",
            Self::ContextExceeded { .. } => "ContextExceeded",
            Self::IoFailure { .. } => "IoFailure",
            Self::SchemaFailure { .. } => "SchemaFailure",
            Self::SizeExceeded { .. } => "SizeExceeded",
            Self::TypeDisallowed { .. } => "TypeDisallowed",
            Self::Internal { .. } => "Internal",
            Self::Io(_) => "IoFailure",
            Self::Json(_) => "SchemaFailure",
        }
    }
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return Self::Io(std::io::Error::new(io_err.kind(), io_err.to_string()));
        }
        Self::Internal { message: err.to_string() }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<toml::de::Error> for HubError {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfiguration { message: err.to_string() }
    }
}

impl From<toml::ser::Error> for HubError {
    fn from(err: toml::ser::Error) -> Self {
        Self::InvalidConfiguration { message: err.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;

/// Extension trait mirroring the common `Option -> Result` conversions used
/// throughout the managers.
pub trait OptionExt<T> {
    fn ok_or_not_found(self, what: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, what: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| HubError::NotFound { what: what.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(HubError::Timeout { duration: Duration::from_secs(30) }.is_retryable());
        assert!(HubError::RateLimited { message: "slow down".into() }.is_retryable());
        assert!(HubError::TransportFailure { message: "reset".into() }.is_retryable());
        assert!(!HubError::AuthFailure { message: "bad key".into() }.is_retryable());
        assert!(!HubError::ContextExceeded { max_tokens: 10, used_tokens: 20 }.is_retryable());
    }

    #[test]
    fn immediate_surface_errors() {
        assert!(HubError::AuthFailure { message: "bad key".into() }.surfaces_immediately());
        assert!(HubError::ContextExceeded { max_tokens: 1, used_tokens: 2 }.surfaces_immediately());
        assert!(!HubError::Timeout { duration: Duration::from_secs(1) }.surfaces_immediately());
    }

    #[test]
    fn option_ext() {
        let opt: Option<i32> = None;
        let result = opt.ok_or_not_found("agent a1");
        assert!(matches!(result, Err(HubError::NotFound { .. })));
    }

    #[test]
    fn user_message_for_context_exceeded() {
        let err = HubError::ContextExceeded { max_tokens: 100, used_tokens: 200 };
        assert!(err.user_message().contains("too long"));
    }
}
