//! `TicketStore` trait, the single async interface every component uses
//! to read and write tickets.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::tickets::{Extraction, FailureStage, NewTicket, Ticket, TicketStatus};

/// A partial update to one ticket row.
///
/// Only the fields that are set are written. The guards turn the update into
/// a compare-and-set: if any guard fails the row is left untouched and
/// `update_fields` returns `false`.
#[derive(Debug, Clone, Default)]
pub struct TicketPatch {
    pub status: Option<TicketStatus>,
    pub failure_stage: Option<FailureStage>,
    pub failure_note: Option<String>,
    pub extraction: Option<Extraction>,
    pub draft_response: Option<String>,
    pub bump_extraction_attempts: bool,
    pub bump_drafting_attempts: bool,
    pub resolved_at: Option<DateTime<Utc>>,

    /// Row must currently be in one of these states (empty = any).
    pub expect_status: Vec<TicketStatus>,
    /// Row must already carry extraction fields.
    pub require_extraction: bool,
    /// Row must not be resolved yet.
    pub require_unresolved: bool,
}

impl TicketPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TicketStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Mark the ticket failed in `stage`, with a note for the reviewer.
    pub fn failed(mut self, stage: FailureStage, note: impl Into<String>) -> Self {
        self.status = Some(TicketStatus::Failed);
        self.failure_stage = Some(stage);
        self.failure_note = Some(note.into());
        self
    }

    pub fn extraction(mut self, extraction: Extraction) -> Self {
        self.extraction = Some(extraction);
        self
    }

    pub fn draft_response(mut self, text: impl Into<String>) -> Self {
        self.draft_response = Some(text.into());
        self
    }

    pub fn bump_extraction_attempts(mut self) -> Self {
        self.bump_extraction_attempts = true;
        self
    }

    pub fn bump_drafting_attempts(mut self) -> Self {
        self.bump_drafting_attempts = true;
        self
    }

    pub fn resolved_at(mut self, at: DateTime<Utc>) -> Self {
        self.resolved_at = Some(at);
        self
    }

    pub fn expect_status(mut self, status: TicketStatus) -> Self {
        self.expect_status.push(status);
        self
    }

    pub fn require_extraction(mut self) -> Self {
        self.require_extraction = true;
        self
    }

    pub fn require_unresolved(mut self) -> Self {
        self.require_unresolved = true;
        self
    }

    /// True when the patch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.failure_stage.is_none()
            && self.failure_note.is_none()
            && self.extraction.is_none()
            && self.draft_response.is_none()
            && !self.bump_extraction_attempts
            && !self.bump_drafting_attempts
            && self.resolved_at.is_none()
    }
}

/// Aggregate view for the review dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TicketOverview {
    pub total: u64,
    pub received_since: u64,
    pub unresolved: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_sentiment: BTreeMap<String, u64>,
    pub by_urgency: BTreeMap<u8, u64>,
}

/// Backend-agnostic ticket store.
///
/// Every call goes to the backing database; implementations must not cache
/// rows, so a read after another process's committed write sees it.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Apply any pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Insert a new `pending` ticket unless one with the same id exists.
    /// Returns `true` if a row was created.
    async fn insert_if_absent(&self, ticket: &NewTicket) -> Result<bool, DatabaseError>;

    /// Look up one ticket.
    async fn get_by_id(&self, id: &str) -> Result<Option<Ticket>, DatabaseError>;

    /// All tickets in `status`, oldest first.
    async fn get_by_status(&self, status: TicketStatus) -> Result<Vec<Ticket>, DatabaseError>;

    /// Apply `patch` to one row atomically. Returns `false` when the row does
    /// not exist or a guard did not hold.
    async fn update_fields(&self, id: &str, patch: &TicketPatch) -> Result<bool, DatabaseError>;

    /// Tickets in review order: urgency desc, then received_at asc.
    async fn list_by_priority(&self, include_resolved: bool)
    -> Result<Vec<Ticket>, DatabaseError>;

    /// Number of tickets in every status, zero counts included.
    async fn status_counts(&self) -> Result<Vec<(TicketStatus, u64)>, DatabaseError>;

    /// Dashboard aggregates; `received_since` counts tickets newer than `since`.
    async fn overview(&self, since: DateTime<Utc>) -> Result<TicketOverview, DatabaseError>;
}
