//! Batch sender — delivers one tick's batch of pending tasks over a shared
//! transport, isolating per-recipient failures.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::mailer::{Mailer, OutgoingEmail, tag_subject};
use crate::store::RecipientTaskStore;
use crate::store::campaigns::Campaign;
use crate::store::tasks::RecipientTask;

/// Result of one batch: how many tasks went to Sent vs Failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub sent: usize,
    pub failed: usize,
}

/// Send one message per task over the shared `mailer`.
///
/// Each task is handled independently: a transport failure records Failed
/// on that task and the batch continues. Each task's new state is persisted
/// before the next send is attempted, so a crash loses at most the
/// in-flight recipient. Failed tasks are terminal — this run never retries
/// them.
pub async fn send_batch(
    mailer: &dyn Mailer,
    tasks: &RecipientTaskStore,
    campaign: &Campaign,
    batch: &[RecipientTask],
    now: DateTime<Utc>,
) -> Result<BatchOutcome, DatabaseError> {
    let subject = tag_subject(campaign.id, &campaign.subject);
    let mut outcome = BatchOutcome::default();

    for task in batch {
        let mail = OutgoingEmail {
            to: task.email_snapshot.clone(),
            subject: subject.clone(),
            html_body: Some(campaign.content.clone()),
            text_body: None,
            campaign_id: Some(campaign.id),
            attachment: None,
        };

        match mailer.send(&mail).await {
            Ok(()) => {
                if tasks.mark_sent(task.id, now)? {
                    outcome.sent += 1;
                } else {
                    // A bounce raced us and already failed the task; the
                    // terminal state wins.
                    debug!(task = task.id, "Task no longer pending after send");
                }
            }
            Err(e) => {
                warn!(
                    campaign = campaign.id,
                    to = %task.email_snapshot,
                    error = %e,
                    "Send failed"
                );
                tasks.mark_failed(task.id, &e.to_string())?;
                outcome.failed += 1;
            }
        }
    }

    Ok(outcome)
}
