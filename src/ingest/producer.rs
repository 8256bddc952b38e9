//! Ingestion producer: turns matching unread emails into `pending` tickets.
//!
//! One cycle:
//! 1. List unread messages whose subject passes the filter
//! 2. Insert each as a `pending` ticket (idempotent on message id)
//! 3. Mark it read once the ticket exists, whether just inserted or not
//!
//! A message is only marked read after its ticket is durable, so a crash
//! between the two steps re-lists it next cycle and the insert dedups it.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::MailboxError;
use crate::mailbox::{Mailbox, SubjectFilter};
use crate::schedule::WorkUnit;
use crate::store::TicketStore;
use crate::tickets::NewTicket;

/// Counts for one ingestion cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub listed: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub store_errors: usize,
    pub mark_read_failures: usize,
}

pub struct IngestionProducer {
    store: Arc<dyn TicketStore>,
    mailbox: Arc<dyn Mailbox>,
    filter: SubjectFilter,
}

impl IngestionProducer {
    pub fn new(
        store: Arc<dyn TicketStore>,
        mailbox: Arc<dyn Mailbox>,
        filter: SubjectFilter,
    ) -> Self {
        Self {
            store,
            mailbox,
            filter,
        }
    }

    /// Run one ingestion cycle.
    ///
    /// Only a listing failure is returned as an error; per-message failures
    /// are counted in the report and the rest of the cycle carries on.
    pub async fn poll_and_ingest(&self) -> Result<IngestReport, MailboxError> {
        let messages = self.mailbox.list_unread_matching(&self.filter).await?;
        let mut report = IngestReport {
            listed: messages.len(),
            ..Default::default()
        };

        for message in &messages {
            match self.store.insert_if_absent(&NewTicket::from(message)).await {
                Ok(true) => {
                    report.inserted += 1;
                    info!(
                        ticket_id = %message.id,
                        sender = %message.sender,
                        subject = %message.subject,
                        "Ticket created"
                    );
                }
                Ok(false) => {
                    report.duplicates += 1;
                    debug!(ticket_id = %message.id, "Ticket already exists");
                }
                Err(e) => {
                    // Left unread so the next cycle retries it.
                    report.store_errors += 1;
                    error!(ticket_id = %message.id, error = %e, "Failed to store ticket");
                    continue;
                }
            }

            if let Err(e) = self.mailbox.mark_read(&message.id).await {
                report.mark_read_failures += 1;
                warn!(ticket_id = %message.id, error = %e, "Failed to mark message read");
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl WorkUnit for IngestionProducer {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn run_once(&self, _stop: &AtomicBool) {
        match self.poll_and_ingest().await {
            Ok(report) if report.listed == 0 => {
                debug!(mailbox = self.mailbox.name(), "No matching unread mail");
            }
            Ok(report) => {
                info!(
                    mailbox = self.mailbox.name(),
                    listed = report.listed,
                    inserted = report.inserted,
                    duplicates = report.duplicates,
                    store_errors = report.store_errors,
                    mark_read_failures = report.mark_read_failures,
                    "Ingestion cycle complete"
                );
            }
            Err(e) => {
                error!(mailbox = self.mailbox.name(), error = %e, "Ingestion cycle aborted");
            }
        }
    }
}
