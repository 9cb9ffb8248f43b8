//! RecipientTask model and store — one delivery record per
//! (campaign, recipient) pair.
//!
//! Status writes are guarded UPDATEs so concurrent writers (delivery tick
//! and bounce correlator) cannot violate the lifecycle: Pending→Sent and
//! Pending/Sent→Failed only. Failed is terminal; nothing ever returns a
//! task to Pending.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::db::{Database, parse_datetime, parse_optional_datetime, truncate_chars};
use crate::error::DatabaseError;

/// Bound on stored per-task failure reasons.
pub const FAILURE_REASON_MAX: usize = 500;

/// Delivery status of a single recipient task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Sent,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One delivery record: a campaign × recipient pair with a snapshotted
/// address. The snapshot is immutable once created, protecting in-flight
/// campaigns from later recipient edits.
#[derive(Debug, Clone, Serialize)]
pub struct RecipientTask {
    pub id: i64,
    pub campaign_id: i64,
    pub recipient_id: i64,
    pub email_snapshot: String,
    pub status: TaskStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub failure_reason: String,
    pub created_at: DateTime<Utc>,
}

/// RecipientTask storage backed by SQLite.
pub struct RecipientTaskStore {
    db: Arc<Database>,
}

impl RecipientTaskStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Ensure a task exists for the pair, creating it as Pending with an
    /// email snapshot only if absent. Returns true if a row was created.
    ///
    /// Idempotent via the UNIQUE (campaign_id, recipient_id) constraint.
    pub fn ensure(
        &self,
        campaign_id: i64,
        recipient_id: i64,
        email: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO campaign_recipients
                (campaign_id, recipient_id, email_snapshot, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            rusqlite::params![campaign_id, recipient_id, email, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Fetch up to `limit` Pending tasks for a campaign in creation order
    /// (stable FIFO — resumption needs no cursor beyond the status itself).
    pub fn pending_batch(
        &self,
        campaign_id: i64,
        limit: usize,
    ) -> Result<Vec<RecipientTask>, DatabaseError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, campaign_id, recipient_id, email_snapshot, status,
                    sent_at, failure_reason, created_at
             FROM campaign_recipients
             WHERE campaign_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![campaign_id, limit as i64], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Number of Pending tasks remaining for a campaign.
    pub fn pending_count(&self, campaign_id: i64) -> Result<usize, DatabaseError> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM campaign_recipients
             WHERE campaign_id = ?1 AND status = 'pending'",
            rusqlite::params![campaign_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Mark a task Sent, stamping the send time and clearing any failure
    /// reason. Guarded: only applies to a Pending task. Returns false if the
    /// task was no longer Pending (e.g. a bounce already failed it).
    pub fn mark_sent(&self, task_id: i64, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE campaign_recipients
             SET status = 'sent', sent_at = ?1, failure_reason = ''
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![at.to_rfc3339(), task_id],
        )?;
        Ok(changed > 0)
    }

    /// Mark a task Failed with a truncated reason. Allowed from Pending and
    /// Sent (a late bounce after SMTP acceptance) and idempotently from
    /// Failed (duplicate bounce); the reason of the latest failure wins.
    pub fn mark_failed(&self, task_id: i64, reason: &str) -> Result<bool, DatabaseError> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE campaign_recipients
             SET status = 'failed', failure_reason = ?1
             WHERE id = ?2",
            rusqlite::params![truncate_chars(reason, FAILURE_REASON_MAX), task_id],
        )?;
        Ok(changed > 0)
    }

    /// Fail every task of a campaign whose snapshot matches the bounced
    /// address case-insensitively. Returns the number of tasks updated —
    /// zero and multiple matches are both valid.
    pub fn fail_by_snapshot(
        &self,
        campaign_id: i64,
        email: &str,
        reason: &str,
    ) -> Result<usize, DatabaseError> {
        let conn = self.db.conn();
        let changed = conn.execute(
            "UPDATE campaign_recipients
             SET status = 'failed', failure_reason = ?1
             WHERE campaign_id = ?2 AND email_snapshot = ?3 COLLATE NOCASE",
            rusqlite::params![
                truncate_chars(reason, FAILURE_REASON_MAX),
                campaign_id,
                email
            ],
        )?;
        if changed > 0 {
            debug!(campaign = campaign_id, email = email, tasks = changed, "Tasks failed by bounce");
        }
        Ok(changed)
    }

    /// All tasks for a campaign in creation order, for report generation.
    pub fn for_campaign(&self, campaign_id: i64) -> Result<Vec<RecipientTask>, DatabaseError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, campaign_id, recipient_id, email_snapshot, status,
                    sent_at, failure_reason, created_at
             FROM campaign_recipients
             WHERE campaign_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![campaign_id], row_to_task)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<RecipientTask, rusqlite::Error> {
    let status_str: String = row.get(4)?;
    let sent_at_str: Option<String> = row.get(5)?;
    let created_str: String = row.get(7)?;

    Ok(RecipientTask {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        recipient_id: row.get(2)?,
        email_snapshot: row.get(3)?,
        status: TaskStatus::parse(&status_str),
        sent_at: parse_optional_datetime(&sent_at_str),
        failure_reason: row.get(6)?,
        created_at: parse_datetime(&created_str),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CampaignStore, RecipientStore};
    use crate::store::recipients::SubscriptionStatus;

    struct Fixture {
        tasks: RecipientTaskStore,
        campaign: i64,
        recipient: i64,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let campaigns = CampaignStore::new(Arc::clone(&db));
        let recipients = RecipientStore::new(Arc::clone(&db));
        let campaign = campaigns.create("c", "s", "b", Utc::now()).unwrap();
        let recipient = recipients
            .upsert("bob@example.com", "Bob", SubscriptionStatus::Subscribed)
            .unwrap();
        Fixture {
            tasks: RecipientTaskStore::new(db),
            campaign,
            recipient,
        }
    }

    #[test]
    fn ensure_is_idempotent() {
        let f = fixture();
        assert!(f.tasks.ensure(f.campaign, f.recipient, "bob@example.com").unwrap());
        assert!(!f.tasks.ensure(f.campaign, f.recipient, "bob@example.com").unwrap());
        assert_eq!(f.tasks.for_campaign(f.campaign).unwrap().len(), 1);
    }

    #[test]
    fn snapshot_survives_recipient_edit() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let campaigns = CampaignStore::new(Arc::clone(&db));
        let recipients = RecipientStore::new(Arc::clone(&db));
        let tasks = RecipientTaskStore::new(Arc::clone(&db));
        let campaign = campaigns.create("c", "s", "b", Utc::now()).unwrap();
        let bob = recipients
            .upsert("bob@example.com", "Bob", SubscriptionStatus::Subscribed)
            .unwrap();
        tasks.ensure(campaign, bob, "bob@example.com").unwrap();

        // Renaming the recipient later must not touch the snapshot the
        // campaign was resolved against.
        recipients
            .upsert("bob@example.com", "Robert", SubscriptionStatus::Unsubscribed)
            .unwrap();
        let task = &tasks.for_campaign(campaign).unwrap()[0];
        assert_eq!(task.email_snapshot, "bob@example.com");
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&TaskStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Failed);
    }

    #[test]
    fn pending_batch_is_fifo_and_bounded() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let campaigns = CampaignStore::new(Arc::clone(&db));
        let recipients = RecipientStore::new(Arc::clone(&db));
        let tasks = RecipientTaskStore::new(Arc::clone(&db));
        let campaign = campaigns.create("c", "s", "b", Utc::now()).unwrap();

        for i in 0..5 {
            let r = recipients
                .upsert(&format!("r{i}@example.com"), "", SubscriptionStatus::Subscribed)
                .unwrap();
            tasks.ensure(campaign, r, &format!("r{i}@example.com")).unwrap();
        }

        let batch = tasks.pending_batch(campaign, 3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].email_snapshot, "r0@example.com");
        assert_eq!(batch[2].email_snapshot, "r2@example.com");
    }

    #[test]
    fn mark_sent_only_from_pending() {
        let f = fixture();
        f.tasks.ensure(f.campaign, f.recipient, "bob@example.com").unwrap();
        let id = f.tasks.for_campaign(f.campaign).unwrap()[0].id;

        assert!(f.tasks.mark_sent(id, Utc::now()).unwrap());
        let task = &f.tasks.for_campaign(f.campaign).unwrap()[0];
        assert_eq!(task.status, TaskStatus::Sent);
        assert!(task.sent_at.is_some());

        // Already sent — a second mark is a no-op.
        assert!(!f.tasks.mark_sent(id, Utc::now()).unwrap());
    }

    #[test]
    fn failed_is_terminal() {
        let f = fixture();
        f.tasks.ensure(f.campaign, f.recipient, "bob@example.com").unwrap();
        let id = f.tasks.for_campaign(f.campaign).unwrap()[0].id;

        f.tasks.mark_failed(id, "mailbox unavailable").unwrap();
        // A send racing the bounce must not resurrect the task.
        assert!(!f.tasks.mark_sent(id, Utc::now()).unwrap());
        assert_eq!(
            f.tasks.for_campaign(f.campaign).unwrap()[0].status,
            TaskStatus::Failed
        );
    }

    #[test]
    fn sent_may_become_failed_by_late_bounce() {
        let f = fixture();
        f.tasks.ensure(f.campaign, f.recipient, "bob@example.com").unwrap();
        let id = f.tasks.for_campaign(f.campaign).unwrap()[0].id;

        f.tasks.mark_sent(id, Utc::now()).unwrap();
        let n = f
            .tasks
            .fail_by_snapshot(f.campaign, "BOB@EXAMPLE.COM", "user unknown")
            .unwrap();
        assert_eq!(n, 1);
        let task = &f.tasks.for_campaign(f.campaign).unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure_reason, "user unknown");
    }

    #[test]
    fn fail_by_snapshot_zero_matches_is_ok() {
        let f = fixture();
        let n = f
            .tasks
            .fail_by_snapshot(f.campaign, "nobody@example.com", "x")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn failure_reason_is_truncated() {
        let f = fixture();
        f.tasks.ensure(f.campaign, f.recipient, "bob@example.com").unwrap();
        let id = f.tasks.for_campaign(f.campaign).unwrap()[0].id;

        let long = "x".repeat(FAILURE_REASON_MAX + 100);
        f.tasks.mark_failed(id, &long).unwrap();
        let task = &f.tasks.for_campaign(f.campaign).unwrap()[0];
        assert_eq!(task.failure_reason.chars().count(), FAILURE_REASON_MAX);
    }

    #[test]
    fn pending_count_tracks_status() {
        let f = fixture();
        f.tasks.ensure(f.campaign, f.recipient, "bob@example.com").unwrap();
        assert_eq!(f.tasks.pending_count(f.campaign).unwrap(), 1);
        let id = f.tasks.for_campaign(f.campaign).unwrap()[0].id;
        f.tasks.mark_sent(id, Utc::now()).unwrap();
        assert_eq!(f.tasks.pending_count(f.campaign).unwrap(), 0);
    }
}
