//! Completion report — one-shot per-campaign summary to the operator.

use chrono::Utc;
use tracing::debug;

use crate::error::{DatabaseError, ReportError};
use crate::mailer::{EmailAttachment, Mailer, OutgoingEmail};
use crate::store::{CampaignStore, RecipientTaskStore};

/// Build and deliver the completion report for a campaign.
///
/// Skips (Ok(false)) when the one-shot flag is already set. The flag is set
/// only after a successful delivery, so a failed delivery leaves the report
/// eligible for a later manual retry; the scheduler never retries it
/// automatically.
pub async fn send_completion_report(
    campaigns: &CampaignStore,
    tasks: &RecipientTaskStore,
    mailer: &dyn Mailer,
    operator_email: Option<&str>,
    campaign_id: i64,
) -> Result<bool, ReportError> {
    let campaign = campaigns
        .get(campaign_id)?
        .ok_or(DatabaseError::NotFound {
            entity: "campaign".into(),
            id: campaign_id,
        })?;

    if campaign.report_sent {
        debug!(campaign = campaign_id, "Report already sent, skipping");
        return Ok(false);
    }

    let operator = operator_email.ok_or(ReportError::NoOperatorAddress)?;

    let rows = tasks.for_campaign(campaign_id)?;
    let counts = campaigns.counts(campaign_id)?;

    let mut csv = String::from("Recipient Email,Status,Failure Reason,Sent At\n");
    for task in &rows {
        let sent_at = task
            .sent_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        csv.push_str(&format!(
            "{},{},{},{}\n",
            csv_escape(&task.email_snapshot),
            task.status,
            csv_escape(&task.failure_reason),
            sent_at,
        ));
    }

    let digest = [
        "Campaign Report".to_string(),
        "---------------------------".to_string(),
        format!("Name      : {}", campaign.name),
        format!("Id        : {}", campaign.id),
        format!("Subject   : {}", campaign.subject),
        format!("Scheduled : {}", campaign.scheduled_time.to_rfc3339()),
        format!("Triggered : {}", Utc::now().to_rfc3339()),
        String::new(),
        format!("Total recipients considered : {}", counts.total),
        format!("Sent successfully           : {}", counts.sent),
        format!("Failed during send          : {}", counts.failed),
    ]
    .join("\n");

    let mail = OutgoingEmail {
        to: operator.to_string(),
        subject: format!(
            "Campaign Report: {} (Sent: {}, Failed: {})",
            campaign.name, counts.sent, counts.failed
        ),
        html_body: None,
        text_body: Some(digest),
        campaign_id: None,
        attachment: Some(EmailAttachment {
            filename: format!("campaign_{}_report.csv", campaign.id),
            content_type: "text/csv".into(),
            content: csv,
        }),
    };

    mailer.send(&mail).await?;
    campaigns.mark_report_sent(campaign_id)?;
    debug!(campaign = campaign_id, to = operator, "Completion report delivered");
    Ok(true)
}

/// Quote a CSV field when it contains separators, quotes, or newlines.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_escape_plain_passthrough() {
        assert_eq!(csv_escape("bob@example.com"), "bob@example.com");
    }

    #[test]
    fn csv_escape_quotes_separators() {
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
