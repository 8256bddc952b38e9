//! Error types for support-triage.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Review error: {0}")]
    Review(#[from] ReviewError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors. Only ever raised at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Write conflict after {attempts} attempts: {reason}")]
    Conflict { attempts: u32, reason: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox access errors. Any of these aborts the current ingestion cycle.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),

    #[error("Unknown message id: {0}")]
    UnknownMessage(String),

    #[error("Mailbox task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Timeouts, rate limits and transport failures are worth another try.
    /// Malformed output and auth failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. }
        )
    }
}

/// Outcome of a failed extraction or drafting call.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Network, timeout or rate limit. The ticket stays where it is and is
    /// retried on a later batch.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The model answered, but not with something usable. The raw output is
    /// kept so a human can see what came back.
    #[error("Malformed model output: {reason}")]
    Content { reason: String, raw: String },

    /// The provider refused our credentials. No ticket is at fault, so the
    /// batch stops and nothing is written.
    #[error("Model provider unavailable: {0}")]
    Unavailable(String),
}

impl AnalysisError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<LlmError> for AnalysisError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::AuthFailed { .. } => Self::Unavailable(e.to_string()),
            _ if e.is_transient() => Self::Transient(e.to_string()),
            _ => Self::Content {
                reason: e.to_string(),
                raw: String::new(),
            },
        }
    }
}

/// Review surface errors.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("Ticket {0} not found")]
    NotFound(String),

    #[error("Ticket {id} is {status}; its draft cannot be edited yet")]
    NotEditable { id: String, status: String },

    #[error("Draft text must not be empty")]
    EmptyDraft,

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
