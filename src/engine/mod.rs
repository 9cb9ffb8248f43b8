//! Delivery engine — scheduler, resolver, batch sender, and reports.

pub mod report;
pub mod resolver;
pub mod scheduler;
pub mod sender;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::mailer::MailerProvider;
use crate::store::{CampaignStore, Database, RecipientStore, RecipientTaskStore};

pub use scheduler::TickSummary;
pub use sender::BatchOutcome;

/// Per-campaign lease registry.
///
/// Everything a tick does to one campaign (state check, batch fetch, sends,
/// state transition) runs under this exclusive scope. Overlapping ticks and
/// manual sends skip a campaign whose lease is held instead of racing it.
pub struct CampaignLocks {
    held: Mutex<HashSet<i64>>,
}

impl CampaignLocks {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Try to take the lease for a campaign. Returns None if already held.
    pub fn try_acquire(&self, campaign_id: i64) -> Option<CampaignLease<'_>> {
        let mut held = self.held.lock().expect("CampaignLocks mutex poisoned");
        if held.insert(campaign_id) {
            Some(CampaignLease {
                locks: self,
                campaign_id,
            })
        } else {
            None
        }
    }
}

impl Default for CampaignLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Held lease; released on drop.
pub struct CampaignLease<'a> {
    locks: &'a CampaignLocks,
    campaign_id: i64,
}

impl Drop for CampaignLease<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .expect("CampaignLocks mutex poisoned")
            .remove(&self.campaign_id);
    }
}

/// The delivery engine: owns the stores, the transport seam, and the
/// per-campaign leases. One instance is shared by the delivery tick loop
/// and the manual-trigger paths.
pub struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) provider: Arc<dyn MailerProvider>,
    pub(crate) campaigns: CampaignStore,
    pub(crate) recipients: RecipientStore,
    pub(crate) tasks: RecipientTaskStore,
    pub(crate) locks: CampaignLocks,
}

impl Engine {
    pub fn new(config: Arc<Config>, db: Arc<Database>, provider: Arc<dyn MailerProvider>) -> Self {
        Self {
            config,
            provider,
            campaigns: CampaignStore::new(Arc::clone(&db)),
            recipients: RecipientStore::new(Arc::clone(&db)),
            tasks: RecipientTaskStore::new(db),
            locks: CampaignLocks::new(),
        }
    }

    pub fn campaigns(&self) -> &CampaignStore {
        &self.campaigns
    }

    pub fn recipients(&self) -> &RecipientStore {
        &self.recipients
    }

    pub fn tasks(&self) -> &RecipientTaskStore {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let locks = CampaignLocks::new();
        let lease = locks.try_acquire(1).unwrap();
        assert!(locks.try_acquire(1).is_none());
        assert!(locks.try_acquire(2).is_some());
        drop(lease);
        assert!(locks.try_acquire(1).is_some());
    }
}
