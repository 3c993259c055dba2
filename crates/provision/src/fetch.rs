//! Record of devices downloading their personalized configuration.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::mac::HardwareAddress;

/// Last fetch time per hardware address, with change notification.
#[derive(Debug)]
pub struct FetchLedger {
    fetches: RwLock<HashMap<HardwareAddress, DateTime<Utc>>>,
    notify: watch::Sender<u64>,
}

impl Default for FetchLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchLedger {
    #[must_use]
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            fetches: RwLock::new(HashMap::new()),
            notify,
        }
    }

    /// Note that `hardware_address` just downloaded its payload.
    pub async fn record(&self, hardware_address: HardwareAddress) -> DateTime<Utc> {
        let now = Utc::now();
        self.fetches.write().await.insert(hardware_address, now);
        self.notify.send_modify(|n| *n = n.wrapping_add(1));
        info!(hardware_address = %hardware_address, "Device fetched personalized configuration");
        now
    }

    pub async fn last_fetch(&self, hardware_address: &HardwareAddress) -> Option<DateTime<Utc>> {
        self.fetches.read().await.get(hardware_address).copied()
    }

    /// Whether a fetch was recorded at or after `since`.
    pub async fn fetched_since(&self, hardware_address: &HardwareAddress, since: DateTime<Utc>) -> bool {
        self.last_fetch(hardware_address)
            .await
            .is_some_and(|at| at >= since)
    }

    /// Wait up to `timeout` for a fetch at or after `since`.
    pub async fn wait_for(
        &self,
        hardware_address: &HardwareAddress,
        since: DateTime<Utc>,
        timeout: Duration,
    ) -> bool {
        let mut changes = self.notify.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                changes.borrow_and_update();
                if self.fetched_since(hardware_address, since).await {
                    return;
                }
                // the sender lives in self, so this only fails if self is gone
                if changes.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

        if waited.is_err() {
            debug!(hardware_address = %hardware_address, "No fetch observed before timeout");
        }
        waited.is_ok()
    }
}
