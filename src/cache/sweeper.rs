//! TTL sweeper
//!
//! One background task per bounded tier. Each tick removes expired entries
//! one at a time, so a sweep never holds a tier lock longer than a single
//! removal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A tier whose entries expire a fixed time after creation
#[async_trait]
pub trait Expiring: Send + Sync + 'static {
    /// Tier label for logs
    fn sweep_label(&self) -> &'static str;

    /// Remove every entry whose age at `now` is at least the TTL; returns how many
    async fn purge_expired(&self, now: DateTime<Utc>) -> usize;
}

/// Start the periodic sweep; it stops when `cancel` fires
pub fn spawn_ttl_sweeper<T: Expiring + ?Sized>(
    tier: Arc<T>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so a fresh tier is not swept at startup
        ticker.tick().await;

        info!(tier = tier.sweep_label(), ?interval, "TTL sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = tier.purge_expired(Utc::now()).await;
                    if removed > 0 {
                        debug!(tier = tier.sweep_label(), removed, "Expired entries swept");
                    }
                }
            }
        }
        info!(tier = tier.sweep_label(), "TTL sweeper stopped");
    })
}
