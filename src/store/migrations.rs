//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones, in order. The ticket
//! invariants live in the table's CHECK constraints so that no writer,
//! including the review surface, can persist a half-extracted ticket.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "tickets",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY,
                received_at TEXT NOT NULL,
                sender TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'extracted', 'drafted', 'failed')),
                failure_stage TEXT
                    CHECK (failure_stage IN ('extraction', 'drafting')),
                failure_note TEXT,
                sentiment TEXT
                    CHECK (sentiment IN ('positive', 'neutral', 'negative', 'urgent_negative')),
                urgency INTEGER
                    CHECK (urgency BETWEEN 1 AND 5),
                summary TEXT,
                contact_info TEXT,
                draft_response TEXT,
                extraction_attempts INTEGER NOT NULL DEFAULT 0,
                drafting_attempts INTEGER NOT NULL DEFAULT 0,
                resolved_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((sentiment IS NULL) = (urgency IS NULL)
                   AND (urgency IS NULL) = (summary IS NULL)
                   AND (summary IS NULL) = (contact_info IS NULL)),
                CHECK (draft_response IS NULL OR summary IS NOT NULL),
                CHECK ((failure_stage IS NOT NULL) = (status = 'failed')),
                CHECK (status NOT IN ('extracted', 'drafted') OR summary IS NOT NULL),
                CHECK (status <> 'drafted' OR draft_response IS NOT NULL)
            );
            CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
            CREATE INDEX IF NOT EXISTS idx_tickets_received_at ON tickets(received_at);
        "#,
    },
    Migration {
        version: 2,
        name: "priority_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_tickets_priority
                ON tickets(resolved_at, urgency DESC, received_at ASC);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn insert_raw(conn: &Connection, extra_cols: &str, extra_vals: &str) -> libsql::Result<u64> {
        let sql = format!(
            "INSERT INTO tickets (id, received_at, sender, subject, body, created_at, updated_at{extra_cols})
             VALUES ('t1', '2026-01-01T00:00:00.000000Z', 'a@x.com', 'Help', 'body',
                     '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z'{extra_vals})"
        );
        conn.execute(&sql, ()).await
    }

    #[tokio::test]
    async fn migrations_create_tickets_table() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["tickets", "_migrations"] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "tickets");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "priority_index");
    }

    #[tokio::test]
    async fn schema_accepts_plain_pending_ticket() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        assert_eq!(insert_raw(&conn, "", "").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn schema_rejects_partial_extraction() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        let result = insert_raw(&conn, ", sentiment, urgency", ", 'negative', 4").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn schema_rejects_draft_without_extraction() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        let result = insert_raw(&conn, ", draft_response", ", 'Hi there'").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn schema_rejects_failed_without_stage() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        let result = insert_raw(&conn, ", status", ", 'failed'").await;
        assert!(result.is_err());

        let ok = insert_raw(&conn, ", status, failure_stage", ", 'failed', 'extraction'").await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn schema_rejects_out_of_range_urgency() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        let result = insert_raw(
            &conn,
            ", sentiment, urgency, summary, contact_info",
            ", 'neutral', 9, 's', '{}'",
        )
        .await;
        assert!(result.is_err());
    }
}
