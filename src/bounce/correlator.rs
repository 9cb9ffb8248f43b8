//! Bounce correlator — attributes a delivery-failure notification to the
//! originating campaign and recipient and applies it.
//!
//! Correlation keys on the `[CID:<id>]` subject token, a documented
//! best-effort heuristic: a relay that rewrites or strips the bracketed
//! token makes its bounces unattributable, and they are skipped.

use std::sync::{Arc, LazyLock};

use mail_parser::{Message, MessageParser, MimeHeaders, PartType};
use regex::Regex;

use crate::error::DatabaseError;
use crate::store::{BounceStore, CampaignStore, Database, RecipientTaskStore};

static CID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[CID:(\d+)\]").expect("CID pattern is valid"));

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w.+-]+@[\w.-]+\.\w+").expect("email pattern is valid"));

/// Extract the campaign id from a subject carrying the correlation token.
///
/// `"[CID:42] Welcome"` → 42. Absent or non-numeric tokens yield None.
pub fn extract_campaign_id(subject: &str) -> Option<i64> {
    CID_PATTERN
        .captures(subject)
        .and_then(|caps| caps.get(1))
        .and_then(|id| id.as_str().parse().ok())
}

/// How one bounce message was handled. Skips are values, not errors — the
/// scan boundary logs them and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BounceOutcome {
    /// Campaign and recipient resolved; tasks updated and audit row written.
    Applied {
        campaign_id: i64,
        recipient: String,
        /// Tasks flipped to Failed — zero and multiple are both valid.
        tasks_failed: usize,
    },
    /// The message bytes did not parse as an email.
    Unparsable,
    /// No correlation token in the recovered subject.
    NoToken,
    /// Token present but no failed address could be extracted.
    NoRecipient { campaign_id: i64 },
    /// Token references a campaign that does not exist.
    CampaignMissing { campaign_id: i64 },
}

/// Applies bounce notifications to the stores.
pub struct BounceCorrelator {
    campaigns: CampaignStore,
    tasks: RecipientTaskStore,
    bounces: BounceStore,
    /// The system's own sending address, excluded from fallback extraction.
    own_address: String,
}

impl BounceCorrelator {
    pub fn new(db: Arc<Database>, own_address: String) -> Self {
        Self {
            campaigns: CampaignStore::new(Arc::clone(&db)),
            tasks: RecipientTaskStore::new(Arc::clone(&db)),
            bounces: BounceStore::new(db),
            own_address,
        }
    }

    /// Process one raw bounce message.
    ///
    /// Duplicates are tolerated (at-least-once delivery from the scanner):
    /// re-failing a Failed task is a no-op state-wise, and the audit trail
    /// simply gains another row.
    pub fn process(&self, raw: &[u8]) -> Result<BounceOutcome, DatabaseError> {
        let Some(message) = MessageParser::default().parse(raw) else {
            return Ok(BounceOutcome::Unparsable);
        };

        let Some(campaign_id) = original_subject(&message).as_deref().and_then(extract_campaign_id)
        else {
            return Ok(BounceOutcome::NoToken);
        };

        let Some(recipient) = extract_failed_recipient(&message, &self.own_address) else {
            return Ok(BounceOutcome::NoRecipient { campaign_id });
        };

        if self.campaigns.get(campaign_id)?.is_none() {
            return Ok(BounceOutcome::CampaignMissing { campaign_id });
        }

        let reason = message.subject().unwrap_or("Delivery failed").to_string();
        let message_id = message.message_id().unwrap_or("").to_string();

        let tasks_failed = self
            .tasks
            .fail_by_snapshot(campaign_id, &recipient, &reason)?;
        // One audit row per bounce, regardless of how many tasks matched.
        self.bounces
            .append(campaign_id, &recipient, &reason, &message_id)?;

        Ok(BounceOutcome::Applied {
            campaign_id,
            recipient,
            tasks_failed,
        })
    }
}

/// Recover the subject of the bounced original.
///
/// Bounces commonly attach the original as a `message/rfc822` part; prefer
/// its Subject, falling back to the bounce's own subject (some MTAs keep
/// the original subject there).
fn original_subject(message: &Message<'_>) -> Option<String> {
    for part in &message.parts {
        if let PartType::Message(nested) = &part.body
            && let Some(subject) = nested.subject()
        {
            return Some(subject.to_string());
        }
    }
    message.subject().map(String::from)
}

/// Detect the failed recipient's address.
///
/// Prefers a structured `message/delivery-status` part's Final-Recipient
/// field (the address is the substring after the last `;`, stripping the
/// `rfc822;` type prefix); otherwise scans plain-text bodies for an
/// email-shaped token that is not our own sending address.
fn extract_failed_recipient(message: &Message<'_>, own_address: &str) -> Option<String> {
    for part in &message.parts {
        let is_delivery_status = part.content_type().is_some_and(|ct| {
            ct.ctype().eq_ignore_ascii_case("message")
                && ct
                    .subtype()
                    .is_some_and(|s| s.eq_ignore_ascii_case("delivery-status"))
        });
        if !is_delivery_status {
            continue;
        }

        let text = String::from_utf8_lossy(part.contents());
        for line in text.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if !name.trim().eq_ignore_ascii_case("final-recipient") {
                continue;
            }
            let addr = value.rsplit(';').next().unwrap_or("").trim();
            if addr.contains('@') {
                return Some(addr.to_string());
            }
        }
    }

    // Fallback: first email-shaped token in any text body that is not us.
    let mut body_text = String::new();
    let mut idx = 0;
    while let Some(text) = message.body_text(idx) {
        body_text.push_str(&text);
        body_text.push('\n');
        idx += 1;
    }
    EMAIL_PATTERN
        .find_iter(&body_text)
        .map(|m| m.as_str())
        .find(|addr| !addr.eq_ignore_ascii_case(own_address))
        .map(String::from)
}
