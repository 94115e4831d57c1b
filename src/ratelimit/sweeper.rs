//! Background reclamation of idle counter entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace};

use super::tiers::TierRegistry;

/// Periodically sweep every tier of `registry`.
///
/// The task runs until the returned handle is aborted.
pub fn spawn_sweeper(registry: Arc<TierRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = registry.sweep();
            if removed > 0 {
                info!(removed = removed, "Reclaimed idle rate limit entries");
            } else {
                trace!("Sweep found no idle entries");
            }
        }
    })
}
