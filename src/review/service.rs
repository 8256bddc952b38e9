//! Review operations over the ticket store.
//!
//! Reviewers own `resolved_at` and, once the pipeline is done with a ticket,
//! `draft_response`. The pipeline never writes either of those after it
//! leaves `extracted`, so the two sides cannot overwrite each other.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::error::ReviewError;
use crate::store::{TicketOverview, TicketPatch, TicketStore};
use crate::tickets::{Ticket, TicketStatus};

/// Window for the "received recently" overview count.
const OVERVIEW_WINDOW_HOURS: i64 = 24;

pub struct ReviewService {
    store: Arc<dyn TicketStore>,
}

impl ReviewService {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    /// Tickets most urgent first, oldest first within an urgency.
    pub async fn priority_queue(&self, include_resolved: bool) -> Result<Vec<Ticket>, ReviewError> {
        Ok(self.store.list_by_priority(include_resolved).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Ticket, ReviewError> {
        self.store
            .get_by_id(id)
            .await?
            .ok_or_else(|| ReviewError::NotFound(id.to_string()))
    }

    /// Mark a ticket resolved. Resolving twice keeps the first timestamp.
    pub async fn resolve(&self, id: &str) -> Result<Ticket, ReviewError> {
        let patch = TicketPatch::new().resolved_at(Utc::now()).require_unresolved();
        if self.store.update_fields(id, &patch).await? {
            info!(ticket_id = %id, "Ticket resolved");
        } else {
            debug!(ticket_id = %id, "Ticket already resolved or missing");
        }
        self.get(id).await
    }

    /// Replace the draft reply on a ticket the pipeline has finished with.
    pub async fn edit_draft(&self, id: &str, text: &str) -> Result<Ticket, ReviewError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ReviewError::EmptyDraft);
        }

        let patch = TicketPatch::new()
            .draft_response(text)
            .expect_status(TicketStatus::Drafted)
            .expect_status(TicketStatus::Failed)
            .require_extraction();

        if self.store.update_fields(id, &patch).await? {
            info!(ticket_id = %id, chars = text.len(), "Draft edited");
            return self.get(id).await;
        }

        // Guard failed: tell the caller whether the ticket exists at all.
        let ticket = self.get(id).await?;
        Err(ReviewError::NotEditable {
            id: ticket.id,
            status: ticket.status.to_string(),
        })
    }

    /// Dashboard counts, with a rolling 24 hour "received" window.
    pub async fn overview(&self) -> Result<TicketOverview, ReviewError> {
        let since = Utc::now() - Duration::hours(OVERVIEW_WINDOW_HOURS);
        Ok(self.store.overview(since).await?)
    }
}
