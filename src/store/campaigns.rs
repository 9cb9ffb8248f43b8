//! Campaign model, lifecycle state machine, and store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::db::{Database, parse_datetime};
use crate::error::DatabaseError;

/// Lifecycle status of a campaign.
///
/// Transitions are monotonic: a campaign never moves backwards, and
/// Completed/Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    InProgress,
    Completed,
    Failed,
}

impl CampaignStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: CampaignStatus) -> bool {
        use CampaignStatus::*;

        matches!(
            (self, target),
            (Draft, Scheduled)
                | (Draft, InProgress)
                | (Draft, Failed)
                | (Scheduled, InProgress)
                | (Scheduled, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "scheduled" => Self::Scheduled,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Draft,
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bulk email campaign.
#[derive(Debug, Clone, Serialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    /// Subject template; the correlation token is prepended at send time.
    pub subject: String,
    /// HTML body.
    pub content: String,
    pub scheduled_time: DateTime<Utc>,
    pub status: CampaignStatus,
    /// One-shot flag: the completion report has been delivered.
    pub report_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-recipient delivery totals for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignCounts {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Campaign storage backed by SQLite.
pub struct CampaignStore {
    db: Arc<Database>,
}

impl CampaignStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a campaign. Returns its id.
    ///
    /// Campaign CRUD is owned by external tooling; this exists for that
    /// tooling and for tests.
    pub fn create(
        &self,
        name: &str,
        subject: &str,
        content: &str,
        scheduled_time: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO campaigns (name, subject, content, scheduled_time, status,
                report_sent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'draft', 0, ?5, ?5)",
            rusqlite::params![name, subject, content, scheduled_time.to_rfc3339(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Look up a campaign by id.
    pub fn get(&self, id: i64) -> Result<Option<Campaign>, DatabaseError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, subject, content, scheduled_time, status, report_sent,
                    created_at, updated_at
             FROM campaigns WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![id], row_to_campaign)?;
        match rows.next() {
            Some(Ok(c)) => Ok(Some(c)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Campaigns due for delivery: scheduled at or before `now` and not yet
    /// Completed, oldest schedule first.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, DatabaseError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, subject, content, scheduled_time, status, report_sent,
                    created_at, updated_at
             FROM campaigns
             WHERE scheduled_time <= ?1 AND status != 'completed'
             ORDER BY scheduled_time ASC, id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![now.to_rfc3339()], row_to_campaign)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Transition a campaign's status, enforcing monotonic lifecycle order.
    ///
    /// The UPDATE is guarded by the set of statuses allowed to reach
    /// `target`, so a concurrent writer cannot regress the lifecycle.
    /// Returns true if the transition was applied.
    pub fn transition(&self, id: i64, target: CampaignStatus) -> Result<bool, DatabaseError> {
        use CampaignStatus::*;
        let froms: Vec<&str> = [Draft, Scheduled, InProgress, Completed, Failed]
            .iter()
            .filter(|s| s.can_transition_to(target))
            .map(|s| s.as_str())
            .collect();
        if froms.is_empty() {
            return Ok(false);
        }

        // Statuses come from the whitelist above, never from input.
        let froms_sql = froms
            .iter()
            .map(|f| format!("'{f}'"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE campaigns SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ({froms_sql})"
        );

        let conn = self.db.conn();
        let changed = conn.execute(
            &sql,
            rusqlite::params![target.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        if changed > 0 {
            debug!(campaign = id, status = %target, "Campaign status updated");
        }
        Ok(changed > 0)
    }

    /// Set the one-shot report flag. Only called after a successful report
    /// delivery.
    pub fn mark_report_sent(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.db.conn();
        conn.execute(
            "UPDATE campaigns SET report_sent = 1, updated_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Assign a recipient group as part of the campaign's audience.
    pub fn assign_group(&self, campaign_id: i64, group_id: i64) -> Result<(), DatabaseError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO campaign_groups (campaign_id, group_id) VALUES (?1, ?2)",
            rusqlite::params![campaign_id, group_id],
        )?;
        Ok(())
    }

    /// Delivery totals used by the completion report.
    pub fn counts(&self, campaign_id: i64) -> Result<CampaignCounts, DatabaseError> {
        let conn = self.db.conn();
        let (total, sent, failed): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status = 'sent'), 0),
                    COALESCE(SUM(status = 'failed'), 0)
             FROM campaign_recipients WHERE campaign_id = ?1",
            rusqlite::params![campaign_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(CampaignCounts {
            total: total as usize,
            sent: sent as usize,
            failed: failed as usize,
        })
    }
}

fn row_to_campaign(row: &rusqlite::Row<'_>) -> Result<Campaign, rusqlite::Error> {
    let status_str: String = row.get(5)?;
    let scheduled_str: String = row.get(4)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        subject: row.get(2)?,
        content: row.get(3)?,
        scheduled_time: parse_datetime(&scheduled_str),
        status: CampaignStatus::parse(&status_str),
        report_sent: row.get::<_, i64>(6)? != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}
