//! Delivery scheduler — the periodic tick that advances due campaigns.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Engine, report, resolver, sender};
use crate::error::{DatabaseError, Error, ReportError, Result};
use crate::mailer::Mailer;
use crate::store::campaigns::{Campaign, CampaignStatus};

/// What one tick did, logged once at the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Due campaigns this tick attempted to process.
    pub campaigns: usize,
    /// Campaigns skipped because their lease was held.
    pub skipped: usize,
    pub sent: usize,
    pub failed: usize,
    /// Campaigns that reached Completed this tick.
    pub completed: usize,
}

/// Per-campaign outcome of one tick.
#[derive(Debug, Clone, Copy, Default)]
struct CampaignOutcome {
    sent: usize,
    failed: usize,
    completed: bool,
}

impl Engine {
    /// One delivery tick with a reference `now`.
    ///
    /// Selects campaigns with `scheduled_time <= now` that are not yet
    /// Completed, acquires the SMTP transport once, and processes each
    /// campaign under its lease. Failures are isolated per campaign; a
    /// connection-level transport failure aborts the tick with no sends
    /// (the next tick retries).
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        let due = match self.campaigns.due(now) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Failed to query due campaigns");
                return summary;
            }
        };
        if due.is_empty() {
            return summary;
        }

        let mailer = match self.provider.acquire().await {
            Ok(mailer) => mailer,
            Err(e) => {
                warn!(error = %e, "SMTP connection unavailable, skipping tick");
                return summary;
            }
        };

        for campaign in due {
            let Some(_lease) = self.locks.try_acquire(campaign.id) else {
                debug!(campaign = campaign.id, "Lease held, skipping");
                summary.skipped += 1;
                continue;
            };
            summary.campaigns += 1;

            match self.process_due_campaign(&campaign, mailer.as_ref(), now).await {
                Ok(outcome) => {
                    summary.sent += outcome.sent;
                    summary.failed += outcome.failed;
                    if outcome.completed {
                        summary.completed += 1;
                    }
                }
                Err(e) => {
                    warn!(campaign = campaign.id, error = %e, "Campaign processing failed this tick");
                }
            }
        }

        summary
    }

    /// Advance one due campaign: activate on first contact, send one batch,
    /// complete on exhaustion.
    async fn process_due_campaign(
        &self,
        campaign: &Campaign,
        mailer: &dyn Mailer,
        now: DateTime<Utc>,
    ) -> Result<CampaignOutcome> {
        let mut outcome = CampaignOutcome::default();

        // First contact: become visibly in-progress before any send, so a
        // crash mid-batch leaves the campaign resumable rather than
        // silently unprocessed. The audience is resolved once, here.
        if matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            self.campaigns
                .transition(campaign.id, CampaignStatus::InProgress)
                .map_err(Error::from)?;
            resolver::resolve_audience(&self.recipients, &self.tasks, campaign.id)?;
        }

        let batch = self
            .tasks
            .pending_batch(campaign.id, self.config.engine.batch_size)?;

        if batch.is_empty() {
            outcome.completed = self.complete_campaign(campaign.id, mailer).await?;
            return Ok(outcome);
        }

        let batch_outcome =
            sender::send_batch(mailer, &self.tasks, campaign, &batch, now).await?;
        outcome.sent = batch_outcome.sent;
        outcome.failed = batch_outcome.failed;

        // The batch may have drained the campaign; completing now (instead
        // of waiting a tick) keeps the ≤ batch_size bound while finishing
        // exhausted campaigns promptly.
        if self.tasks.pending_count(campaign.id)? == 0 {
            outcome.completed = self.complete_campaign(campaign.id, mailer).await?;
        }

        Ok(outcome)
    }

    /// Transition to Completed and fire the one-shot report. Report
    /// failures are logged, never escalated, and never roll back the
    /// Completed status.
    async fn complete_campaign(&self, campaign_id: i64, mailer: &dyn Mailer) -> Result<bool> {
        let transitioned = self
            .campaigns
            .transition(campaign_id, CampaignStatus::Completed)
            .map_err(Error::from)?;
        if !transitioned {
            // Terminal by another path (e.g. operator-failed); the report
            // stays tied to the Completed transition.
            return Ok(false);
        }

        match report::send_completion_report(
            &self.campaigns,
            &self.tasks,
            mailer,
            self.config.engine.operator_email.as_deref(),
            campaign_id,
        )
        .await
        {
            Ok(_) => {}
            Err(ReportError::NoOperatorAddress) => {
                warn!(campaign = campaign_id, "No operator address configured, skipping report");
            }
            Err(e) => {
                warn!(campaign = campaign_id, error = %e, "Completion report failed");
            }
        }

        Ok(transitioned)
    }

    /// Manual trigger: send a whole campaign immediately, bypassing the
    /// scheduled-time gate. Drains Pending tasks in `batch_size` batches
    /// with the same batch sender, then completes and reports through the
    /// same one-shot path.
    pub async fn send_now(&self, campaign_id: i64, now: DateTime<Utc>) -> Result<TickSummary> {
        let campaign = self
            .campaigns
            .get(campaign_id)?
            .ok_or(DatabaseError::NotFound {
                entity: "campaign".into(),
                id: campaign_id,
            })?;

        let Some(_lease) = self.locks.try_acquire(campaign_id) else {
            return Err(Error::CampaignBusy(campaign_id));
        };

        let mailer = self.provider.acquire().await?;
        let mut summary = TickSummary {
            campaigns: 1,
            ..TickSummary::default()
        };

        if matches!(
            campaign.status,
            CampaignStatus::Draft | CampaignStatus::Scheduled
        ) {
            self.campaigns
                .transition(campaign_id, CampaignStatus::InProgress)
                .map_err(Error::from)?;
        }
        resolver::resolve_audience(&self.recipients, &self.tasks, campaign_id)?;

        loop {
            let batch = self
                .tasks
                .pending_batch(campaign_id, self.config.engine.batch_size)?;
            if batch.is_empty() {
                break;
            }
            let outcome =
                sender::send_batch(mailer.as_ref(), &self.tasks, &campaign, &batch, now).await?;
            summary.sent += outcome.sent;
            summary.failed += outcome.failed;
        }

        if self.complete_campaign(campaign_id, mailer.as_ref()).await? {
            summary.completed = 1;
        }

        Ok(summary)
    }

    /// Manual trigger: (re-)deliver the completion report. Still guarded by
    /// the one-shot flag — a report that already went out is not repeated.
    pub async fn send_report(&self, campaign_id: i64) -> Result<bool> {
        let mailer = self.provider.acquire().await?;
        report::send_completion_report(
            &self.campaigns,
            &self.tasks,
            mailer.as_ref(),
            self.config.engine.operator_email.as_deref(),
            campaign_id,
        )
        .await
        .map_err(Error::from)
    }
}
