//! BounceRecord store — append-only audit rows for processed bounces.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::db::{Database, parse_datetime, truncate_chars};
use crate::error::DatabaseError;

/// Bound on stored bounce reasons (looser than the per-task bound so the
/// audit trail keeps more of the DSN text).
pub const BOUNCE_REASON_MAX: usize = 2000;

/// One processed bounce notification. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct BounceRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub recipient_email: String,
    pub reason: String,
    /// Message-ID of the bounce email, when present.
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
}

/// BounceRecord storage backed by SQLite.
pub struct BounceStore {
    db: Arc<Database>,
}

impl BounceStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one audit row. Returns its id.
    pub fn append(
        &self,
        campaign_id: i64,
        recipient_email: &str,
        reason: &str,
        message_id: &str,
    ) -> Result<i64, DatabaseError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO bounce_records
                (campaign_id, recipient_email, reason, message_id, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                campaign_id,
                recipient_email,
                truncate_chars(reason, BOUNCE_REASON_MAX),
                message_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Bounces for a campaign, most recent first.
    pub fn for_campaign(&self, campaign_id: i64) -> Result<Vec<BounceRecord>, DatabaseError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, campaign_id, recipient_email, reason, message_id, processed_at
             FROM bounce_records
             WHERE campaign_id = ?1
             ORDER BY processed_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(rusqlite::params![campaign_id], |row| {
            let processed_str: String = row.get(5)?;
            Ok(BounceRecord {
                id: row.get(0)?,
                campaign_id: row.get(1)?,
                recipient_email: row.get(2)?,
                reason: row.get(3)?,
                message_id: row.get(4)?,
                processed_at: parse_datetime(&processed_str),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}
