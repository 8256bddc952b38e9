//! In-memory mailbox for tests and local dry runs.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::MailboxError;
use crate::mailbox::{Mailbox, SubjectFilter};
use crate::tickets::RawMessage;

struct Entry {
    message: RawMessage,
    seen: bool,
}

/// Mailbox held in a `Vec`, with switches to simulate server failures.
#[derive(Default)]
pub struct MemoryMailbox {
    entries: Mutex<Vec<Entry>>,
    fail_listing: AtomicBool,
    fail_mark_read: Mutex<HashSet<String>>,
    mark_read_calls: AtomicUsize,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an unread message.
    pub fn deliver(&self, message: RawMessage) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(Entry {
                message,
                seen: false,
            });
        }
    }

    /// Make every `list_unread_matching` call fail until cleared.
    pub fn set_fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make `mark_read` fail for this message id.
    pub fn fail_mark_read_for(&self, message_id: &str) {
        if let Ok(mut ids) = self.fail_mark_read.lock() {
            ids.insert(message_id.to_string());
        }
    }

    pub fn is_seen(&self, message_id: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .any(|e| e.message.id == message_id && e.seen)
            })
            .unwrap_or(false)
    }

    pub fn unread_count(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.iter().filter(|e| !e.seen).count())
            .unwrap_or(0)
    }

    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_unread_matching(
        &self,
        filter: &SubjectFilter,
    ) -> Result<Vec<RawMessage>, MailboxError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(MailboxError::Connect {
                host: "memory".into(),
                reason: "simulated outage".into(),
            });
        }
        let entries = self
            .entries
            .lock()
            .map_err(|e| MailboxError::Task(format!("mailbox lock poisoned: {e}")))?;
        Ok(entries
            .iter()
            .filter(|e| !e.seen && filter.matches(&e.message.subject))
            .map(|e| e.message.clone())
            .collect())
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), MailboxError> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .fail_mark_read
            .lock()
            .map(|ids| ids.contains(message_id))
            .unwrap_or(false);
        if should_fail {
            return Err(MailboxError::Protocol(format!(
                "simulated STORE failure for {message_id}"
            )));
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|e| MailboxError::Task(format!("mailbox lock poisoned: {e}")))?;
        let mut found = false;
        for entry in entries.iter_mut().filter(|e| e.message.id == message_id) {
            entry.seen = true;
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(MailboxError::UnknownMessage(message_id.to_string()))
        }
    }
}
