//! libSQL backend: async `TicketStore` implementation.
//!
//! Supports local file and in-memory databases. Each `LibSqlBackend` owns its
//! own connection; the ingest, process and review roles each open one, so
//! they may live in separate processes sharing the same file.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{TicketOverview, TicketPatch, TicketStore};
use crate::tickets::{FailureStage, NewTicket, Sentiment, Ticket, TicketStatus, Urgency};

/// How many times a single write is tried when the file is locked by
/// another process.
const MAX_WRITE_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 25;
const BACKOFF_CAP_MS: u64 = 800;
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Both pragmas report a row, so they go through `query`.
        conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {e}")))?;
        conn.query("PRAGMA journal_mode = WAL", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable WAL: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Ticket store opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text order is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn is_busy(e: &libsql::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("database is locked") || msg.contains("busy")
}

fn is_constraint(e: &libsql::Error) -> bool {
    e.to_string().to_lowercase().contains("constraint")
}

/// Exponential backoff with random jitter, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let base = (BACKOFF_BASE_MS << attempt.saturating_sub(1).min(6)).min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

/// Run one write statement, retrying it alone while the file is locked.
/// Returns the number of affected rows.
async fn execute_with_retry(
    conn: &Connection,
    op: &str,
    sql: &str,
    values: Vec<Value>,
) -> Result<u64, DatabaseError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match conn.execute(sql, Params::Positional(values.clone())).await {
            Ok(affected) => return Ok(affected),
            Err(e) if is_busy(&e) => {
                if attempt >= MAX_WRITE_ATTEMPTS {
                    return Err(DatabaseError::Conflict {
                        attempts: attempt,
                        reason: format!("{op}: {e}"),
                    });
                }
                let delay = backoff_delay(attempt);
                warn!(op, attempt, delay_ms = delay.as_millis() as u64, "Store busy, retrying write");
                tokio::time::sleep(delay).await;
            }
            Err(e) if is_constraint(&e) => {
                return Err(DatabaseError::Constraint(format!("{op}: {e}")));
            }
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

/// Accumulates the SET and WHERE clauses of a guarded UPDATE.
#[derive(Default)]
struct UpdateBuilder {
    sets: Vec<String>,
    guards: Vec<String>,
    values: Vec<Value>,
}

impl UpdateBuilder {
    fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }

    fn set(&mut self, column: &str, value: Value) {
        let slot = self.bind(value);
        self.sets.push(format!("{column} = {slot}"));
    }

    fn set_expr(&mut self, expr: &str) {
        self.sets.push(expr.to_string());
    }

    fn guard(&mut self, expr: String) {
        self.guards.push(expr);
    }

    fn build(mut self, id: &str) -> (String, Vec<Value>) {
        let id_slot = self.bind(Value::Text(id.to_string()));
        let mut sql = format!(
            "UPDATE tickets SET {} WHERE id = {id_slot}",
            self.sets.join(", ")
        );
        for g in &self.guards {
            sql.push_str(" AND ");
            sql.push_str(g);
        }
        (sql, self.values)
    }
}

fn patch_to_update(patch: &TicketPatch) -> Result<UpdateBuilder, DatabaseError> {
    let mut b = UpdateBuilder::default();

    if let Some(status) = patch.status {
        b.set("status", Value::Text(status.as_str().into()));

        // Forward-only: the row must be in a state that may move to `status`.
        let from: Vec<TicketStatus> = TicketStatus::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(status))
            .collect();
        if from.is_empty() {
            return Err(DatabaseError::Constraint(format!(
                "no ticket may move back to {status}"
            )));
        }
        let slots: Vec<String> = from
            .iter()
            .map(|s| b.bind(Value::Text(s.as_str().into())))
            .collect();
        b.guard(format!("status IN ({})", slots.join(", ")));
    }
    if let Some(stage) = patch.failure_stage {
        b.set("failure_stage", Value::Text(stage.as_str().into()));
    }
    if let Some(ref note) = patch.failure_note {
        b.set("failure_note", Value::Text(note.clone()));
    }
    if let Some(ref ex) = patch.extraction {
        let contact = serde_json::to_string(&ex.contact_info)
            .map_err(|e| DatabaseError::Serialization(format!("contact_info: {e}")))?;
        b.set("sentiment", Value::Text(ex.sentiment.as_str().into()));
        b.set("urgency", Value::Integer(ex.urgency.into()));
        b.set("summary", Value::Text(ex.summary.clone()));
        b.set("contact_info", Value::Text(contact));
    }
    if let Some(ref draft) = patch.draft_response {
        b.set("draft_response", Value::Text(draft.clone()));
    }
    if patch.bump_extraction_attempts {
        b.set_expr("extraction_attempts = extraction_attempts + 1");
    }
    if patch.bump_drafting_attempts {
        b.set_expr("drafting_attempts = drafting_attempts + 1");
    }
    if let Some(ref at) = patch.resolved_at {
        b.set("resolved_at", Value::Text(ts(at)));
    }
    b.set("updated_at", Value::Text(ts(&Utc::now())));

    if !patch.expect_status.is_empty() {
        let slots: Vec<String> = patch
            .expect_status
            .iter()
            .map(|s| b.bind(Value::Text(s.as_str().into())))
            .collect();
        b.guard(format!("status IN ({})", slots.join(", ")));
    }
    if patch.require_extraction {
        b.guard("summary IS NOT NULL".into());
    }
    if patch.require_unresolved {
        b.guard("resolved_at IS NULL".into());
    }

    Ok(b)
}

const TICKET_COLUMNS: &str = "id, received_at, sender, subject, body, status, failure_stage, \
     failure_note, sentiment, urgency, summary, contact_info, draft_response, \
     extraction_attempts, drafting_attempts, resolved_at, created_at, updated_at";

/// Map a libsql Row to a Ticket. Column order matches `TICKET_COLUMNS`.
fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("ticket row parse: {e}"));

    let received_str: String = row.get(1).map_err(parse_err)?;
    let status_str: String = row.get(5).map_err(parse_err)?;
    let stage_str: Option<String> = row.get(6).ok();
    let sentiment_str: Option<String> = row.get(8).ok();
    let urgency_raw: Option<i64> = row.get(9).ok();
    let contact_str: Option<String> = row.get(11).ok();
    let extraction_attempts: i64 = row.get(13).map_err(parse_err)?;
    let drafting_attempts: i64 = row.get(14).map_err(parse_err)?;
    let resolved_str: Option<String> = row.get(15).ok();
    let created_str: String = row.get(16).map_err(parse_err)?;
    let updated_str: String = row.get(17).map_err(parse_err)?;

    let status: TicketStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let failure_stage: Option<FailureStage> = stage_str
        .map(|s| s.parse())
        .transpose()
        .map_err(DatabaseError::Serialization)?;
    let sentiment: Option<Sentiment> = sentiment_str
        .map(|s| s.parse())
        .transpose()
        .map_err(DatabaseError::Serialization)?;
    let urgency = urgency_raw
        .map(Urgency::new)
        .transpose()
        .map_err(DatabaseError::Serialization)?;
    let contact_info = contact_str
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DatabaseError::Serialization(format!("contact_info: {e}")))?;

    Ok(Ticket {
        id: row.get(0).map_err(parse_err)?,
        received_at: parse_datetime(&received_str),
        sender: row.get(2).map_err(parse_err)?,
        subject: row.get(3).map_err(parse_err)?,
        body: row.get(4).map_err(parse_err)?,
        status,
        failure_stage,
        failure_note: row.get(7).ok(),
        sentiment,
        urgency,
        summary: row.get(10).ok(),
        contact_info,
        draft_response: row.get(12).ok(),
        extraction_attempts: extraction_attempts.max(0) as u32,
        drafting_attempts: drafting_attempts.max(0) as u32,
        resolved_at: parse_optional_datetime(&resolved_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

impl LibSqlBackend {
    async fn query_tickets(
        &self,
        op: &str,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tickets = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            tickets.push(row_to_ticket(&row)?);
        }
        Ok(tickets)
    }

    /// Run a `SELECT key, COUNT(*) ... GROUP BY key` style query.
    async fn grouped_counts(
        &self,
        op: &str,
        sql: &str,
    ) -> Result<Vec<(Option<String>, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            let key: Option<String> = row.get(0).ok();
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
            out.push((key, count.max(0) as u64));
        }
        Ok(out)
    }

    async fn count(&self, op: &str, sql: &str, values: Vec<Value>) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let n: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
                Ok(n.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TicketStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_if_absent(&self, ticket: &NewTicket) -> Result<bool, DatabaseError> {
        let now = ts(&Utc::now());
        let values = vec![
            Value::Text(ticket.id.clone()),
            Value::Text(ts(&ticket.received_at)),
            Value::Text(ticket.sender.clone()),
            Value::Text(ticket.subject.clone()),
            Value::Text(ticket.body.clone()),
            Value::Text(now.clone()),
            Value::Text(now),
        ];
        let affected = execute_with_retry(
            self.conn(),
            "insert_if_absent",
            "INSERT INTO tickets (id, received_at, sender, subject, body, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)
             ON CONFLICT(id) DO NOTHING",
            values,
        )
        .await?;

        let created = affected > 0;
        if created {
            debug!(ticket_id = %ticket.id, "Ticket inserted");
        } else {
            debug!(ticket_id = %ticket.id, "Ticket already present, skipped");
        }
        Ok(created)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_by_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_ticket(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_by_id: {e}"))),
        }
    }

    async fn get_by_status(&self, status: TicketStatus) -> Result<Vec<Ticket>, DatabaseError> {
        self.query_tickets(
            "get_by_status",
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets WHERE status = ?1 ORDER BY received_at ASC, id ASC"
            ),
            vec![Value::Text(status.as_str().into())],
        )
        .await
    }

    async fn update_fields(&self, id: &str, patch: &TicketPatch) -> Result<bool, DatabaseError> {
        if patch.is_empty() {
            debug!(ticket_id = %id, "Empty patch, nothing to write");
            return Ok(false);
        }

        let (sql, values) = patch_to_update(patch)?.build(id);
        let affected = execute_with_retry(self.conn(), "update_fields", &sql, values).await?;

        if affected == 0 {
            debug!(ticket_id = %id, "Update guard did not hold");
        }
        Ok(affected > 0)
    }

    async fn list_by_priority(
        &self,
        include_resolved: bool,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let filter = if include_resolved {
            ""
        } else {
            "WHERE resolved_at IS NULL"
        };
        self.query_tickets(
            "list_by_priority",
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets {filter}
                 ORDER BY urgency IS NULL, urgency DESC, received_at ASC, id ASC"
            ),
            Vec::new(),
        )
        .await
    }

    async fn status_counts(&self) -> Result<Vec<(TicketStatus, u64)>, DatabaseError> {
        let grouped = self
            .grouped_counts(
                "status_counts",
                "SELECT status, COUNT(*) FROM tickets GROUP BY status",
            )
            .await?;

        Ok(TicketStatus::ALL
            .iter()
            .map(|status| {
                let n = grouped
                    .iter()
                    .find(|(key, _)| key.as_deref() == Some(status.as_str()))
                    .map(|(_, n)| *n)
                    .unwrap_or(0);
                (*status, n)
            })
            .collect())
    }

    async fn overview(&self, since: DateTime<Utc>) -> Result<TicketOverview, DatabaseError> {
        let total = self
            .count("overview", "SELECT COUNT(*) FROM tickets", Vec::new())
            .await?;
        let received_since = self
            .count(
                "overview",
                "SELECT COUNT(*) FROM tickets WHERE received_at >= ?1",
                vec![Value::Text(ts(&since))],
            )
            .await?;
        let unresolved = self
            .count(
                "overview",
                "SELECT COUNT(*) FROM tickets WHERE resolved_at IS NULL",
                Vec::new(),
            )
            .await?;

        let by_status: BTreeMap<String, u64> = self
            .status_counts()
            .await?
            .into_iter()
            .map(|(s, n)| (s.as_str().to_string(), n))
            .collect();

        let by_sentiment: BTreeMap<String, u64> = self
            .grouped_counts(
                "overview",
                "SELECT sentiment, COUNT(*) FROM tickets WHERE sentiment IS NOT NULL GROUP BY sentiment",
            )
            .await?
            .into_iter()
            .filter_map(|(k, n)| k.map(|k| (k, n)))
            .collect();

        let mut by_urgency = BTreeMap::new();
        let mut rows = self
            .conn()
            .query(
                "SELECT urgency, COUNT(*) FROM tickets WHERE urgency IS NOT NULL GROUP BY urgency",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("overview: {e}")))?;
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("overview: {e}")))?
        {
            let level: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("overview row parse: {e}")))?;
            let n: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("overview row parse: {e}")))?;
            if let Ok(u) = Urgency::new(level) {
                by_urgency.insert(u.value(), n.max(0) as u64);
            }
        }

        Ok(TicketOverview {
            total,
            received_since,
            unresolved,
            by_status,
            by_sentiment,
            by_urgency,
        })
    }
}
