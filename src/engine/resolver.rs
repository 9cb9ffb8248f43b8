//! Recipient set resolver — expands a campaign's audience into delivery
//! tasks.

use tracing::debug;

use crate::error::DatabaseError;
use crate::store::{RecipientStore, RecipientTaskStore};

/// Ensure a RecipientTask exists for every member of the campaign's
/// audience (subscribed recipients, restricted to the campaign's groups
/// when any are assigned). Returns the number of tasks newly created.
///
/// Safe to call repeatedly: existing tasks are never duplicated or removed,
/// even when a recipient later leaves a group or a new recipient joins.
pub fn resolve_audience(
    recipients: &RecipientStore,
    tasks: &RecipientTaskStore,
    campaign_id: i64,
) -> Result<usize, DatabaseError> {
    let audience = recipients.audience(campaign_id)?;

    let mut created = 0;
    for recipient in &audience {
        if tasks.ensure(campaign_id, recipient.id, &recipient.email)? {
            created += 1;
        }
    }

    debug!(
        campaign = campaign_id,
        audience = audience.len(),
        created,
        "Audience resolved"
    );
    Ok(created)
}
