//! End-to-end scenarios for the delivery engine.
//!
//! Each test wires the real engine and stores against an in-memory SQLite
//! database and a recording fake transport, then drives ticks and manual
//! triggers through the public API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use secrecy::SecretString;

use campaigner::config::{Config, EngineConfig, SmtpConfig};
use campaigner::engine::Engine;
use campaigner::error::{Error, TransportError};
use campaigner::mailer::{Mailer, MailerProvider, OutgoingEmail};
use campaigner::store::Database;
use campaigner::store::campaigns::CampaignStatus;
use campaigner::store::recipients::SubscriptionStatus;
use campaigner::store::tasks::TaskStatus;

// ── Fake transport ──────────────────────────────────────────────────

/// Records every accepted send; rejects addresses on the failure list.
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    fail_addresses: Mutex<Vec<String>>,
}

impl RecordingMailer {
    fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }

    fn fail_address(&self, address: &str) {
        self.fail_addresses.lock().unwrap().push(address.to_string());
    }

    fn clear_failures(&self) {
        self.fail_addresses.lock().unwrap().clear();
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &OutgoingEmail) -> Result<(), TransportError> {
        if self.fail_addresses.lock().unwrap().contains(&mail.to) {
            return Err(TransportError::Send {
                to: mail.to.clone(),
                reason: "550 mailbox unavailable".into(),
            });
        }
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

/// Hands out the shared recording mailer; can simulate connection loss.
struct RecordingProvider {
    mailer: Arc<RecordingMailer>,
    connect_fails: AtomicBool,
}

#[async_trait]
impl MailerProvider for RecordingProvider {
    async fn acquire(&self) -> Result<Arc<dyn Mailer>, TransportError> {
        if self.connect_fails.load(Ordering::Relaxed) {
            return Err(TransportError::Connect("connection refused".into()));
        }
        Ok(Arc::clone(&self.mailer) as Arc<dyn Mailer>)
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    engine: Engine,
    mailer: Arc<RecordingMailer>,
    provider: Arc<RecordingProvider>,
}

fn test_config(batch_size: usize) -> Arc<Config> {
    Arc::new(Config {
        smtp: SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "news@example.com".into(),
            password: SecretString::from("secret"),
            from_address: "news@example.com".into(),
            starttls: true,
            send_timeout: Duration::from_secs(5),
        },
        imap: None,
        engine: EngineConfig {
            batch_size,
            delivery_interval: Duration::from_secs(60),
            scan_interval: Duration::from_secs(300),
            operator_email: Some("ops@example.com".into()),
        },
        db_path: ":memory:".into(),
    })
}

fn harness(batch_size: usize) -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let mailer = Arc::new(RecordingMailer::default());
    let provider = Arc::new(RecordingProvider {
        mailer: Arc::clone(&mailer),
        connect_fails: AtomicBool::new(false),
    });
    let engine = Engine::new(
        test_config(batch_size),
        db,
        Arc::clone(&provider) as Arc<dyn MailerProvider>,
    );
    Harness {
        engine,
        mailer,
        provider,
    }
}

impl Harness {
    /// A due campaign with `n` subscribed recipients `r0..rn`.
    fn due_campaign(&self, recipients: usize) -> i64 {
        let campaign = self
            .engine
            .campaigns()
            .create(
                "Launch",
                "Big news",
                "<p>Hello!</p>",
                Utc::now() - ChronoDuration::hours(1),
            )
            .unwrap();
        for i in 0..recipients {
            self.engine
                .recipients()
                .upsert(
                    &format!("r{i}@example.com"),
                    "",
                    SubscriptionStatus::Subscribed,
                )
                .unwrap();
        }
        campaign
    }

    fn status(&self, campaign: i64) -> CampaignStatus {
        self.engine.campaigns().get(campaign).unwrap().unwrap().status
    }

    fn task_statuses(&self, campaign: i64) -> Vec<TaskStatus> {
        self.engine
            .tasks()
            .for_campaign(campaign)
            .unwrap()
            .iter()
            .map(|t| t.status)
            .collect()
    }

    fn report_mails(&self) -> Vec<OutgoingEmail> {
        self.mailer
            .sent()
            .into_iter()
            .filter(|m| m.to == "ops@example.com")
            .collect()
    }

    fn campaign_mails(&self) -> Vec<OutgoingEmail> {
        self.mailer
            .sent()
            .into_iter()
            .filter(|m| m.campaign_id.is_some())
            .collect()
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn three_tasks_batch_two_completes_on_second_tick() {
    let h = harness(2);
    let campaign = h.due_campaign(3);
    let now = Utc::now();

    // First tick: activates, resolves, sends a full batch of 2.
    let first = h.engine.tick(now).await;
    assert_eq!(first.sent, 2);
    assert_eq!(first.completed, 0);
    assert_eq!(h.status(campaign), CampaignStatus::InProgress);
    assert_eq!(
        h.task_statuses(campaign),
        vec![TaskStatus::Sent, TaskStatus::Sent, TaskStatus::Pending]
    );
    assert!(h.report_mails().is_empty());

    // Second tick: drains the last task and completes with one report.
    let second = h.engine.tick(now).await;
    assert_eq!(second.sent, 1);
    assert_eq!(second.completed, 1);
    assert_eq!(h.status(campaign), CampaignStatus::Completed);
    assert_eq!(
        h.task_statuses(campaign),
        vec![TaskStatus::Sent, TaskStatus::Sent, TaskStatus::Sent]
    );
    assert_eq!(h.report_mails().len(), 1);

    // Third tick: nothing left — no re-sends, no second report.
    let third = h.engine.tick(now).await;
    assert_eq!(third.campaigns, 0);
    assert_eq!(h.campaign_mails().len(), 3);
    assert_eq!(h.report_mails().len(), 1);
}

#[tokio::test]
async fn campaign_mail_carries_correlation_token_and_header() {
    let h = harness(10);
    let campaign = h.due_campaign(1);

    h.engine.tick(Utc::now()).await;

    let mails = h.campaign_mails();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].subject, format!("[CID:{campaign}] Big news"));
    assert_eq!(mails[0].campaign_id, Some(campaign));
    assert_eq!(mails[0].to, "r0@example.com");
    assert_eq!(mails[0].html_body.as_deref(), Some("<p>Hello!</p>"));
}

#[tokio::test]
async fn sends_follow_task_creation_order() {
    let h = harness(2);
    h.due_campaign(3);

    h.engine.tick(Utc::now()).await;

    let mails = h.campaign_mails();
    assert_eq!(mails[0].to, "r0@example.com");
    assert_eq!(mails[1].to, "r1@example.com");
}

#[tokio::test]
async fn zero_recipients_completes_on_first_tick() {
    let h = harness(2);
    let campaign = h.due_campaign(0);

    let summary = h.engine.tick(Utc::now()).await;
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.completed, 1);
    assert_eq!(h.status(campaign), CampaignStatus::Completed);

    let reports = h.report_mails();
    assert_eq!(reports.len(), 1);
    let digest = reports[0].text_body.as_deref().unwrap();
    assert!(digest.contains("Total recipients considered : 0"));
    assert!(digest.contains("Sent successfully           : 0"));
    assert!(digest.contains("Failed during send          : 0"));
}

#[tokio::test]
async fn future_campaign_is_not_selected() {
    let h = harness(2);
    let campaign = h
        .engine
        .campaigns()
        .create("Later", "s", "b", Utc::now() + ChronoDuration::hours(1))
        .unwrap();

    let summary = h.engine.tick(Utc::now()).await;
    assert_eq!(summary.campaigns, 0);
    assert_eq!(h.status(campaign), CampaignStatus::Draft);
}

#[tokio::test]
async fn per_recipient_failure_does_not_abort_batch() {
    let h = harness(10);
    let campaign = h.due_campaign(3);
    h.mailer.fail_address("r1@example.com");

    let summary = h.engine.tick(Utc::now()).await;
    assert_eq!(summary.sent, 2);
    assert_eq!(summary.failed, 1);
    // Batch drained → completes the same tick.
    assert_eq!(h.status(campaign), CampaignStatus::Completed);

    let tasks = h.engine.tasks().for_campaign(campaign).unwrap();
    assert_eq!(
        tasks.iter().map(|t| t.status).collect::<Vec<_>>(),
        vec![TaskStatus::Sent, TaskStatus::Failed, TaskStatus::Sent]
    );
    assert!(tasks[1].failure_reason.contains("550 mailbox unavailable"));

    // Failed is terminal: the next tick retries nothing.
    let again = h.engine.tick(Utc::now()).await;
    assert_eq!(again.sent, 0);
    assert_eq!(h.campaign_mails().len(), 2);
}

#[tokio::test]
async fn connection_failure_aborts_tick_and_recovers() {
    let h = harness(2);
    let campaign = h.due_campaign(2);
    h.provider.connect_fails.store(true, Ordering::Relaxed);

    let summary = h.engine.tick(Utc::now()).await;
    assert_eq!(summary.campaigns, 0);
    assert_eq!(summary.sent, 0);
    // No sends attempted, campaign untouched.
    assert_eq!(h.status(campaign), CampaignStatus::Draft);
    assert!(h.mailer.sent().is_empty());

    // Next tick with a healthy connection resumes from scratch.
    h.provider.connect_fails.store(false, Ordering::Relaxed);
    let summary = h.engine.tick(Utc::now()).await;
    assert_eq!(summary.sent, 2);
    assert_eq!(h.status(campaign), CampaignStatus::Completed);
}

#[tokio::test]
async fn report_failure_leaves_flag_clear_for_manual_retry() {
    let h = harness(10);
    let campaign = h.due_campaign(1);
    h.mailer.fail_address("ops@example.com");

    h.engine.tick(Utc::now()).await;
    // Completed sticks even though the report could not be delivered.
    assert_eq!(h.status(campaign), CampaignStatus::Completed);
    assert!(!h.engine.campaigns().get(campaign).unwrap().unwrap().report_sent);

    // The scheduler does not auto-retry: further ticks change nothing.
    h.engine.tick(Utc::now()).await;
    assert!(h.report_mails().is_empty());

    // Manual retry succeeds once the transport recovers.
    h.mailer.clear_failures();
    assert!(h.engine.send_report(campaign).await.unwrap());
    assert!(h.engine.campaigns().get(campaign).unwrap().unwrap().report_sent);

    // And the one-shot flag holds from then on.
    assert!(!h.engine.send_report(campaign).await.unwrap());
    assert_eq!(h.report_mails().len(), 1);
}

#[tokio::test]
async fn send_now_bypasses_schedule_gating() {
    let h = harness(2);
    let campaign = h
        .engine
        .campaigns()
        .create("Later", "Flash sale", "<p>Now!</p>", Utc::now() + ChronoDuration::days(1))
        .unwrap();
    for i in 0..5 {
        h.engine
            .recipients()
            .upsert(&format!("r{i}@example.com"), "", SubscriptionStatus::Subscribed)
            .unwrap();
    }

    let summary = h.engine.send_now(campaign, Utc::now()).await.unwrap();
    assert_eq!(summary.sent, 5);
    assert_eq!(summary.completed, 1);
    assert_eq!(h.status(campaign), CampaignStatus::Completed);
    assert_eq!(h.report_mails().len(), 1);

    // The scheduled tick finds nothing left to do.
    let tick = h.engine.tick(Utc::now() + ChronoDuration::days(2)).await;
    assert_eq!(tick.campaigns, 0);
}

#[tokio::test]
async fn send_now_on_unknown_campaign_errors() {
    let h = harness(2);
    let err = h.engine.send_now(999, Utc::now()).await.unwrap_err();
    assert!(matches!(err, Error::Database(_)));
}

#[tokio::test]
async fn report_attachment_lists_every_recipient() {
    let h = harness(10);
    let campaign = h.due_campaign(2);
    h.mailer.fail_address("r1@example.com");

    h.engine.tick(Utc::now()).await;

    let reports = h.report_mails();
    let attachment = reports[0].attachment.as_ref().unwrap();
    assert_eq!(attachment.filename, format!("campaign_{campaign}_report.csv"));
    assert!(attachment.content.starts_with("Recipient Email,Status,Failure Reason,Sent At"));
    assert!(attachment.content.contains("r0@example.com,sent"));
    assert!(attachment.content.contains("r1@example.com,failed"));
}
