//! Mailbox access for the ingestion producer.
//!
//! The producer only needs two things from a mail account: the unread
//! messages whose subject matches the filter, and a way to flag one as read.
//! `ImapMailbox` talks to a real server; `MemoryMailbox` backs tests.

pub mod imap;
pub mod memory;

pub use imap::ImapMailbox;
pub use memory::MemoryMailbox;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{ConfigError, MailboxError};
use crate::tickets::RawMessage;

/// A source of support emails.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Unread messages whose subject passes `filter`. Must not change any
    /// message's read state.
    async fn list_unread_matching(
        &self,
        filter: &SubjectFilter,
    ) -> Result<Vec<RawMessage>, MailboxError>;

    /// Flag a previously listed message as read.
    async fn mark_read(&self, message_id: &str) -> Result<(), MailboxError>;
}

/// Case-insensitive whole-word subject match against any configured term.
///
/// An empty term list matches every subject.
#[derive(Debug, Clone)]
pub struct SubjectFilter {
    terms: Vec<String>,
    pattern: Option<Regex>,
}

impl SubjectFilter {
    pub fn new(terms: &[String]) -> Result<Self, ConfigError> {
        let terms: Vec<String> = terms
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if terms.is_empty() {
            return Ok(Self {
                terms,
                pattern: None,
            });
        }

        let alternatives: Vec<String> = terms.iter().map(|t| regex::escape(t)).collect();
        // Boundaries are explicit non-word characters rather than `\b`, so
        // terms like "C++" or "#urgent" still match as whole words.
        let pattern = Regex::new(&format!(
            r"(?i)(?:^|\W)(?:{})(?:\W|$)",
            alternatives.join("|")
        ))
        .map_err(|e| ConfigError::InvalidValue {
            key: "TRIAGE_SUBJECT_FILTER".into(),
            message: e.to_string(),
        })?;

        Ok(Self {
            terms,
            pattern: Some(pattern),
        })
    }

    pub fn matches(&self, subject: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(subject),
            None => true,
        }
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(terms: &[&str]) -> SubjectFilter {
        let owned: Vec<String> = terms.iter().map(|s| s.to_string()).collect();
        SubjectFilter::new(&owned).unwrap()
    }

    #[test]
    fn matches_whole_words_case_insensitively() {
        let f = filter(&["Support", "Query", "Request", "Help"]);
        assert!(f.matches("Need help with login"));
        assert!(f.matches("SUPPORT: billing"));
        assert!(f.matches("Feature request"));
        assert!(!f.matches("Helpful tips for you"));
        assert!(!f.matches("Newsletter"));
    }

    #[test]
    fn empty_terms_match_everything() {
        let f = filter(&[]);
        assert!(f.matches("anything at all"));
        assert!(f.matches(""));
    }

    #[test]
    fn terms_are_escaped() {
        let f = filter(&["C++", "a.b"]);
        assert!(f.matches("Question about a.b"));
        assert!(!f.matches("Question about axb"));
        assert!(f.matches("Question about C++ builds"));
        assert!(!f.matches("Question about C builds"));
    }

    #[test]
    fn terms_with_symbols_match_as_whole_words() {
        let f = filter(&["#urgent", "C++"]);
        assert!(f.matches("Login broken #urgent"));
        assert!(f.matches("#URGENT: refund"));
        assert!(f.matches("c++"));
        assert!(!f.matches("Login broken #urgently"));
        assert!(!f.matches("Learning C++x"));
    }

    #[test]
    fn blank_terms_are_dropped() {
        let f = filter(&["  ", "Help"]);
        assert_eq!(f.terms(), &["Help".to_string()]);
    }
}
