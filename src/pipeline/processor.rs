//! Analysis pipeline: moves tickets `pending → extracted → drafted`.
//!
//! **Core invariant: every write is one guarded row update.** Extraction
//! fields and `status = extracted` land together, a draft and
//! `status = drafted` land together, and each update only applies if the row
//! is still in the state the pipeline read it in.
//!
//! Flow per ticket:
//! 1. Pending → extractor → extracted | failed(extraction) | stays pending
//! 2. Extracted → drafter → drafted | failed(drafting) | stays extracted
//!
//! Transient errors leave the ticket where it is and bump its attempt
//! counter; once the counter reaches the limit the ticket is failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::analysis::{Drafter, Extractor};
use crate::error::{AnalysisError, DatabaseError};
use crate::schedule::WorkUnit;
use crate::store::{TicketPatch, TicketStore};
use crate::tickets::{Extraction, FailureStage, Ticket, TicketStatus};

/// Longest failure note written to a ticket.
const MAX_NOTE_CHARS: usize = 1000;

/// Counts for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Tickets in the start-of-batch snapshot.
    pub snapshot: usize,
    pub extracted: usize,
    pub drafted: usize,
    pub failed: usize,
    /// Transient errors that left the ticket for a later batch.
    pub deferred: usize,
    /// Guarded updates that found the row already moved on.
    pub skipped: usize,
    pub store_errors: usize,
    /// Set when the stop flag cut the batch short.
    pub stopped: bool,
    /// Set when the model provider rejected our credentials. The batch ends
    /// at that ticket and nothing is written for it.
    pub halted: bool,
}

pub struct AnalysisPipeline {
    store: Arc<dyn TicketStore>,
    extractor: Arc<dyn Extractor>,
    drafter: Arc<dyn Drafter>,
    max_attempts: u32,
}

impl AnalysisPipeline {
    pub fn new(
        store: Arc<dyn TicketStore>,
        extractor: Arc<dyn Extractor>,
        drafter: Arc<dyn Drafter>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            extractor,
            drafter,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Process every ticket that was waiting when the batch started.
    pub async fn process_batch(&self) -> Result<BatchReport, DatabaseError> {
        self.process_batch_with_stop(&AtomicBool::new(false)).await
    }

    /// Like `process_batch`, but checks `stop` between tickets. Each
    /// committed ticket is a checkpoint; nothing is rolled back.
    pub async fn process_batch_with_stop(
        &self,
        stop: &AtomicBool,
    ) -> Result<BatchReport, DatabaseError> {
        let mut work = self.store.get_by_status(TicketStatus::Pending).await?;
        work.extend(self.store.get_by_status(TicketStatus::Extracted).await?);

        let mut report = BatchReport {
            snapshot: work.len(),
            ..Default::default()
        };
        if work.is_empty() {
            return Ok(report);
        }
        info!(count = work.len(), "Processing ticket batch");

        for ticket in work {
            if stop.load(Ordering::SeqCst) {
                report.stopped = true;
                info!("Stop requested; ending batch early");
                break;
            }
            self.process_ticket(ticket, &mut report).await;
            if report.halted {
                break;
            }
        }

        info!(
            extracted = report.extracted,
            drafted = report.drafted,
            failed = report.failed,
            deferred = report.deferred,
            skipped = report.skipped,
            halted = report.halted,
            "Batch processing complete"
        );
        Ok(report)
    }

    async fn process_ticket(&self, ticket: Ticket, report: &mut BatchReport) {
        let extraction = match ticket.status {
            TicketStatus::Pending => match self.extract(&ticket, report).await {
                Some(extraction) => extraction,
                None => return,
            },
            TicketStatus::Extracted => match ticket.extraction() {
                Some(extraction) => extraction,
                None => {
                    error!(ticket_id = %ticket.id, "Extracted ticket has no extraction fields");
                    return;
                }
            },
            _ => return,
        };

        self.draft(&ticket, &extraction, report).await;
    }

    /// Run extraction; returns the extraction only if it was committed.
    async fn extract(&self, ticket: &Ticket, report: &mut BatchReport) -> Option<Extraction> {
        let stage = FailureStage::Extraction;
        let guard = TicketPatch::new().expect_status(TicketStatus::Pending);

        match self.extractor.extract(&ticket.subject, &ticket.body).await {
            Ok(extraction) => {
                let patch = guard
                    .extraction(extraction.clone())
                    .status(TicketStatus::Extracted);
                if self.apply(&ticket.id, &patch, stage, report).await {
                    report.extracted += 1;
                    info!(
                        ticket_id = %ticket.id,
                        sentiment = %extraction.sentiment,
                        urgency = extraction.urgency.value(),
                        "Ticket extracted"
                    );
                    return Some(extraction);
                }
                None
            }
            Err(AnalysisError::Unavailable(reason)) => {
                halt(&ticket.id, stage, &reason, report);
                None
            }
            Err(e) => {
                let attempt = ticket.extraction_attempts + 1;
                let patch = self.failure_patch(guard.bump_extraction_attempts(), stage, attempt, &e);
                self.record_failure(&ticket.id, patch, stage, attempt, &e, report)
                    .await;
                None
            }
        }
    }

    async fn draft(&self, ticket: &Ticket, extraction: &Extraction, report: &mut BatchReport) {
        let stage = FailureStage::Drafting;
        let guard = TicketPatch::new().expect_status(TicketStatus::Extracted);

        match self
            .drafter
            .draft(extraction.sentiment, &extraction.summary, &ticket.subject)
            .await
        {
            Ok(text) => {
                let patch = guard.draft_response(text).status(TicketStatus::Drafted);
                if self.apply(&ticket.id, &patch, stage, report).await {
                    report.drafted += 1;
                    info!(ticket_id = %ticket.id, "Ticket drafted");
                }
            }
            Err(AnalysisError::Unavailable(reason)) => {
                halt(&ticket.id, stage, &reason, report);
            }
            Err(e) => {
                let attempt = ticket.drafting_attempts + 1;
                let patch = self.failure_patch(guard.bump_drafting_attempts(), stage, attempt, &e);
                self.record_failure(&ticket.id, patch, stage, attempt, &e, report)
                    .await;
            }
        }
    }

    /// Build the update for a failed call. `attempt` counts the call that
    /// just failed.
    fn failure_patch(
        &self,
        patch: TicketPatch,
        stage: FailureStage,
        attempt: u32,
        err: &AnalysisError,
    ) -> TicketPatch {
        match err {
            AnalysisError::Content { reason, raw } => {
                let note = if raw.is_empty() {
                    reason.clone()
                } else {
                    format!("{reason}; model output: {raw}")
                };
                patch.failed(stage, truncate(&note))
            }
            AnalysisError::Transient(reason) if attempt >= self.max_attempts => patch.failed(
                stage,
                truncate(&format!("gave up after {attempt} attempts: {reason}")),
            ),
            AnalysisError::Transient(_) | AnalysisError::Unavailable(_) => patch,
        }
    }

    async fn record_failure(
        &self,
        id: &str,
        patch: TicketPatch,
        stage: FailureStage,
        attempt: u32,
        err: &AnalysisError,
        report: &mut BatchReport,
    ) {
        let failing = patch.status == Some(TicketStatus::Failed);
        if !self.apply(id, &patch, stage, report).await {
            return;
        }
        if failing {
            report.failed += 1;
            warn!(ticket_id = %id, %stage, attempt, error = %err, "Ticket failed");
        } else {
            report.deferred += 1;
            warn!(
                ticket_id = %id,
                %stage,
                attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "Transient failure; will retry next batch"
            );
        }
    }

    /// Apply a guarded update. Returns `true` only if the row changed.
    async fn apply(
        &self,
        id: &str,
        patch: &TicketPatch,
        stage: FailureStage,
        report: &mut BatchReport,
    ) -> bool {
        match self.store.update_fields(id, patch).await {
            Ok(true) => true,
            Ok(false) => {
                report.skipped += 1;
                warn!(ticket_id = %id, %stage, "Ticket moved on before update; skipping");
                false
            }
            Err(e) => {
                report.store_errors += 1;
                error!(ticket_id = %id, %stage, error = %e, "Failed to update ticket");
                false
            }
        }
    }
}

fn halt(id: &str, stage: FailureStage, reason: &str, report: &mut BatchReport) {
    report.halted = true;
    error!(
        ticket_id = %id,
        %stage,
        error = %reason,
        "Model provider unavailable; ending batch without touching tickets"
    );
}

fn truncate(note: &str) -> String {
    note.chars().take(MAX_NOTE_CHARS).collect()
}

#[async_trait]
impl WorkUnit for AnalysisPipeline {
    fn name(&self) -> &str {
        "process"
    }

    async fn run_once(&self, stop: &AtomicBool) {
        match self.process_batch_with_stop(stop).await {
            Ok(report) if report.snapshot == 0 => debug!("No tickets waiting"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to load ticket batch"),
        }
    }
}
