//! Recipient and group models and store.
//!
//! Recipients are owned by external tooling (CSV import); the engine only
//! reads them. The write helpers here exist for that tooling and for tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::db::{Database, parse_datetime};
use crate::error::DatabaseError;

/// Subscription state of a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "unsubscribed" => Self::Unsubscribed,
            _ => Self::Subscribed,
        }
    }
}

/// A mailing list member.
#[derive(Debug, Clone, Serialize)]
pub struct Recipient {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub subscription: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
}

/// A named label scoping campaign audiences. Many-to-many with both
/// recipients and campaigns.
#[derive(Debug, Clone, Serialize)]
pub struct RecipientGroup {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Recipient storage backed by SQLite.
pub struct RecipientStore {
    db: Arc<Database>,
}

impl RecipientStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or update a recipient keyed on its unique email.
    /// Returns the recipient id.
    pub fn upsert(
        &self,
        email: &str,
        name: &str,
        subscription: SubscriptionStatus,
    ) -> Result<i64, DatabaseError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO recipients (name, email, subscription, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(email) DO UPDATE SET name = ?1, subscription = ?3",
            rusqlite::params![name, email, subscription.as_str(), Utc::now().to_rfc3339()],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM recipients WHERE email = ?1",
            rusqlite::params![email],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Create a group if it does not exist. Returns its id.
    pub fn create_group(&self, name: &str, description: &str) -> Result<i64, DatabaseError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO recipient_groups (name, description, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![name, description, Utc::now().to_rfc3339()],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM recipient_groups WHERE name = ?1",
            rusqlite::params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Add a recipient to a group (idempotent).
    pub fn add_to_group(&self, recipient_id: i64, group_id: i64) -> Result<(), DatabaseError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO recipient_group_members (recipient_id, group_id)
             VALUES (?1, ?2)",
            rusqlite::params![recipient_id, group_id],
        )?;
        Ok(())
    }

    /// All groups, alphabetical.
    pub fn groups(&self) -> Result<Vec<RecipientGroup>, DatabaseError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, created_at
             FROM recipient_groups ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let created_str: String = row.get(3)?;
            Ok(RecipientGroup {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                created_at: parse_datetime(&created_str),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Compute a campaign's audience: subscribed recipients, restricted to
    /// the campaign's groups when any are assigned. An empty group set means
    /// "all subscribed". DISTINCT across overlapping groups.
    pub fn audience(&self, campaign_id: i64) -> Result<Vec<Recipient>, DatabaseError> {
        let conn = self.db.conn();
        let group_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM campaign_groups WHERE campaign_id = ?1",
            rusqlite::params![campaign_id],
            |row| row.get(0),
        )?;

        let recipients = if group_count > 0 {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT r.id, r.name, r.email, r.subscription, r.created_at
                 FROM recipients r
                 JOIN recipient_group_members m ON m.recipient_id = r.id
                 JOIN campaign_groups cg ON cg.group_id = m.group_id
                 WHERE cg.campaign_id = ?1 AND r.subscription = 'subscribed'
                 ORDER BY r.id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![campaign_id], row_to_recipient)?;
            rows.collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, name, email, subscription, created_at
                 FROM recipients
                 WHERE subscription = 'subscribed'
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], row_to_recipient)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        Ok(recipients)
    }
}

fn row_to_recipient(row: &rusqlite::Row<'_>) -> Result<Recipient, rusqlite::Error> {
    let subscription_str: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    Ok(Recipient {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        subscription: SubscriptionStatus::parse(&subscription_str),
        created_at: parse_datetime(&created_str),
    })
}
