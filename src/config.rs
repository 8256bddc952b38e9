//! Configuration types, read once from the environment at startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Subject terms used when `TRIAGE_SUBJECT_FILTER` is unset.
pub const DEFAULT_SUBJECT_TERMS: &[&str] = &["Support", "Query", "Request", "Help"];

/// Settings shared by the ingest, process and review roles.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Path of the ticket store file.
    pub db_path: PathBuf,
    /// How often the mailbox is polled.
    pub poll_interval: Duration,
    /// How often the analysis pipeline runs a batch.
    pub process_interval: Duration,
    /// Whole-word, case-insensitive subject terms. Empty matches everything.
    pub subject_filter_terms: Vec<String>,
    /// Transient failures tolerated per stage before a ticket is failed.
    pub max_extraction_attempts: u32,
    /// Upper bound on a single model call.
    pub ai_call_timeout: Duration,
    /// Port of the review HTTP API.
    pub review_port: u16,
    /// Directory for a daily-rolling log file, if any.
    pub log_dir: Option<PathBuf>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/support-triage.db"),
            poll_interval: Duration::from_secs(60),
            process_interval: Duration::from_secs(120),
            subject_filter_terms: DEFAULT_SUBJECT_TERMS.iter().map(|s| s.to_string()).collect(),
            max_extraction_attempts: 3,
            ai_call_timeout: Duration::from_secs(30),
            review_port: 8080,
            log_dir: None,
        }
    }
}

impl TriageConfig {
    /// Build config from environment variables and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. `from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = lookup("TRIAGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let subject_filter_terms = match lookup("TRIAGE_SUBJECT_FILTER") {
            Some(raw) => split_terms(&raw),
            None => defaults.subject_filter_terms,
        };

        let config = Self {
            db_path,
            poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "TRIAGE_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            process_interval: Duration::from_secs(parse_or(
                &lookup,
                "TRIAGE_PROCESS_INTERVAL_SECS",
                defaults.process_interval.as_secs(),
            )?),
            subject_filter_terms,
            max_extraction_attempts: parse_or(
                &lookup,
                "TRIAGE_MAX_EXTRACTION_ATTEMPTS",
                defaults.max_extraction_attempts,
            )?,
            ai_call_timeout: Duration::from_secs(parse_or(
                &lookup,
                "TRIAGE_AI_TIMEOUT_SECS",
                defaults.ai_call_timeout.as_secs(),
            )?),
            review_port: parse_or(&lookup, "TRIAGE_REVIEW_PORT", defaults.review_port)?,
            log_dir: lookup("TRIAGE_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_extraction_attempts == 0 {
            return Err(invalid("TRIAGE_MAX_EXTRACTION_ATTEMPTS", "must be at least 1"));
        }
        if self.ai_call_timeout.is_zero() {
            return Err(invalid("TRIAGE_AI_TIMEOUT_SECS", "must be at least 1 second"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("TRIAGE_POLL_INTERVAL_SECS", "must be at least 1 second"));
        }
        if self.process_interval.is_zero() {
            return Err(invalid("TRIAGE_PROCESS_INTERVAL_SECS", "must be at least 1 second"));
        }
        Ok(())
    }
}

/// IMAP account used by the ingestion producer.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Folder to poll.
    pub mailbox: String,
    /// Most matching messages fetched in one cycle.
    pub max_per_poll: usize,
}

impl MailboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            imap_host: required(&lookup, "EMAIL_IMAP_HOST", "export EMAIL_IMAP_HOST=imap.example.com")?,
            imap_port: parse_or(&lookup, "EMAIL_IMAP_PORT", 993)?,
            username: required(&lookup, "EMAIL_USERNAME", "export EMAIL_USERNAME=support@example.com")?,
            password: SecretString::from(required(
                &lookup,
                "EMAIL_PASSWORD",
                "export EMAIL_PASSWORD=<app password>",
            )?),
            mailbox: lookup("EMAIL_MAILBOX")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "INBOX".to_string()),
            max_per_poll: parse_or(&lookup, "EMAIL_MAX_PER_POLL", 10)?,
        })
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_terms(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub(crate) fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    hint: &str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingRequired {
            key: key.to_string(),
            hint: hint.to_string(),
        })
}

pub(crate) fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e: T::Err| {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }
        }),
        _ => Ok(default),
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
