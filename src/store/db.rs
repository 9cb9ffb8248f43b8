//! SQLite database handle — connection wrapper and migrations.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::error::DatabaseError;

/// Shared database handle wrapping a SQLite connection behind a Mutex.
///
/// Using `Mutex` (not `RwLock`) because rusqlite `Connection` is `!Sync`.
/// All DB access is serialized — fine for this write-light workload.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("create directory {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| DatabaseError::Open(e.to_string()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn =
            Connection::open_in_memory().map_err(|e| DatabaseError::Open(e.to_string()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a lock on the underlying connection.
    ///
    /// Callers hold the lock for the duration of their DB operation.
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("Database mutex poisoned")
    }

    /// Run all schema migrations.
    fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS recipient_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL UNIQUE,
                subscription TEXT NOT NULL DEFAULT 'subscribed',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recipient_group_members (
                recipient_id INTEGER NOT NULL REFERENCES recipients(id) ON DELETE CASCADE,
                group_id INTEGER NOT NULL REFERENCES recipient_groups(id) ON DELETE CASCADE,
                PRIMARY KEY (recipient_id, group_id)
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                subject TEXT NOT NULL,
                content TEXT NOT NULL,
                scheduled_time TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                report_sent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);

            CREATE TABLE IF NOT EXISTS campaign_groups (
                campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                group_id INTEGER NOT NULL REFERENCES recipient_groups(id) ON DELETE CASCADE,
                PRIMARY KEY (campaign_id, group_id)
            );

            CREATE TABLE IF NOT EXISTS campaign_recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                recipient_id INTEGER NOT NULL REFERENCES recipients(id) ON DELETE CASCADE,
                email_snapshot TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                sent_at TEXT,
                failure_reason TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                UNIQUE (campaign_id, recipient_id)
            );
            CREATE INDEX IF NOT EXISTS idx_campaign_recipients_status
                ON campaign_recipients(campaign_id, status);
            CREATE INDEX IF NOT EXISTS idx_campaign_recipients_snapshot
                ON campaign_recipients(campaign_id, email_snapshot COLLATE NOCASE);

            CREATE TABLE IF NOT EXISTS bounce_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                recipient_email TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                message_id TEXT NOT NULL DEFAULT '',
                processed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bounce_records_campaign
                ON bounce_records(campaign_id);",
        )
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        Ok(())
    }
}

// ── Shared row helpers ──────────────────────────────────────────────

pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Truncate free text to a bounded number of characters.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
