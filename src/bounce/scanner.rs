//! Bounce scanner — polls the inbound mailbox for delivery-failure
//! notifications and runs them through the correlator.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::correlator::{BounceCorrelator, BounceOutcome};
use super::imap::ImapSession;
use crate::config::ImapConfig;
use crate::error::ScanError;

/// One fetched bounce candidate.
pub struct FetchedBounce {
    pub seq: u32,
    pub raw: Vec<u8>,
}

/// What one scan did, logged once at the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub fetched: usize,
    pub applied: usize,
    pub skipped: usize,
}

/// Scans the bounce mailbox on a tick and applies what it finds.
pub struct BounceScanner {
    config: ImapConfig,
    correlator: Arc<BounceCorrelator>,
}

impl BounceScanner {
    pub fn new(config: ImapConfig, correlator: Arc<BounceCorrelator>) -> Self {
        Self { config, correlator }
    }

    /// One scan cycle: fetch bounce-shaped messages, correlate each, then
    /// mark them `\Seen`.
    ///
    /// State is persisted before the mark, so a crash in between reprocesses
    /// the message on the next scan — the correlator tolerates duplicates
    /// (at-least-once). A message that cannot be attributed is still marked
    /// seen: it will never become attributable, so retrying is pointless.
    pub async fn scan_tick(&self) -> ScanSummary {
        let mut summary = ScanSummary::default();

        let config = self.config.clone();
        let fetched = match tokio::task::spawn_blocking(move || fetch_bounces(&config)).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(e)) => {
                warn!(error = %e, "Bounce scan failed");
                return summary;
            }
            Err(e) => {
                error!(error = %e, "Bounce scan task panicked");
                return summary;
            }
        };
        summary.fetched = fetched.len();

        let mut processed = Vec::with_capacity(fetched.len());
        for bounce in &fetched {
            match self.correlator.process(&bounce.raw) {
                Ok(BounceOutcome::Applied {
                    campaign_id,
                    ref recipient,
                    tasks_failed,
                }) => {
                    debug!(
                        campaign = campaign_id,
                        recipient = %recipient,
                        tasks_failed,
                        "Bounce applied"
                    );
                    summary.applied += 1;
                }
                Ok(outcome) => {
                    debug!(seq = bounce.seq, ?outcome, "Bounce skipped");
                    summary.skipped += 1;
                }
                Err(e) => {
                    // Leave the message unseen so the next scan retries it.
                    warn!(seq = bounce.seq, error = %e, "Bounce processing failed");
                    continue;
                }
            }
            processed.push(bounce.seq);
        }

        if !processed.is_empty() {
            let config = self.config.clone();
            let result =
                tokio::task::spawn_blocking(move || mark_seen(&config, &processed)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to mark bounces as seen"),
                Err(e) => error!(error = %e, "Mark-seen task panicked"),
            }
        }

        summary
    }
}

/// The IMAP SEARCH criteria for bounce-shaped messages: unseen, and either
/// from the mailer daemon or carrying a delivery-subsystem subject.
fn search_criteria(config: &ImapConfig) -> String {
    format!(
        "UNSEEN (OR FROM \"{}\" SUBJECT \"{}\")",
        config.daemon_from, config.daemon_subject
    )
}

/// Fetch all bounce candidates from the mailbox (blocking).
fn fetch_bounces(config: &ImapConfig) -> Result<Vec<FetchedBounce>, ScanError> {
    let mut session = ImapSession::open(config)?;
    let seqs = session.search(&search_criteria(config))?;

    let mut fetched = Vec::with_capacity(seqs.len());
    for seq in seqs {
        match session.fetch_rfc822(seq) {
            Ok(raw) => fetched.push(FetchedBounce { seq, raw }),
            // One unfetchable message must not abort the scan.
            Err(e) => warn!(seq, error = %e, "Fetch failed, skipping message"),
        }
    }
    session.logout();
    Ok(fetched)
}

/// Flag processed messages `\Seen` (blocking).
fn mark_seen(config: &ImapConfig, seqs: &[u32]) -> Result<(), ScanError> {
    let mut session = ImapSession::open(config)?;
    for &seq in seqs {
        session.store_seen(seq)?;
    }
    session.logout();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;

    use super::*;

    #[test]
    fn criteria_combines_sender_and_subject() {
        let config = ImapConfig {
            host: "imap.example.com".into(),
            port: 993,
            username: "news@example.com".into(),
            password: SecretString::from("secret"),
            mailbox: "INBOX".into(),
            daemon_from: "MAILER-DAEMON".into(),
            daemon_subject: "Mail Delivery Subsystem".into(),
            read_timeout: Duration::from_secs(30),
        };
        assert_eq!(
            search_criteria(&config),
            "UNSEEN (OR FROM \"MAILER-DAEMON\" SUBJECT \"Mail Delivery Subsystem\")"
        );
    }
}
