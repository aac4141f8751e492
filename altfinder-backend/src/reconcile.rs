//! Periodic replay of the write-behind queue.
//!
//! Broadcasts are lossy, so every node re-reads the recent writes from the
//! shared store, applies them to its own cache and re-broadcasts them.

use crate::api::{AltApi, ApiError};
use crate::sync::SyncMessage;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shortest accepted sweep period
const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub replayed: usize,
    pub corrupt: usize,
}

/// Drain the queue once: cache and re-broadcast every live row, evict and
/// broadcast deletes for corrupt ones.
pub async fn sweep(api: &AltApi) -> Result<SweepStats, ApiError> {
    let drained = api.store().drain_queue().await?;

    for sighting in &drained.sightings {
        if let Err(e) = api.cache().put(sighting).await {
            warn!(error = %e, player_id = %sighting.player_id, ip = %sighting.ip, "failed to cache replayed sighting");
        }
        api.publish_info(sighting.clone());
    }

    if !drained.corrupt.is_empty() {
        if let Err(e) = api.cache().evict_corrupt(&drained.corrupt).await {
            warn!(error = %e, "failed to evict corrupt queue rows");
        }
        for corrupt in &drained.corrupt {
            api.publish(SyncMessage::Delete {
                key: corrupt.offending_key().to_string(),
            });
        }
    }

    let stats = SweepStats {
        replayed: drained.sightings.len(),
        corrupt: drained.corrupt.len(),
    };
    debug!(
        replayed = stats.replayed,
        corrupt = stats.corrupt,
        "reconciliation sweep finished"
    );
    Ok(stats)
}

/// One scheduled run: finish a pending warm-up first, sweep only once warm.
async fn tick(api: &AltApi) {
    if api.is_stale() {
        debug!("sync is being restored, skipping sweep");
        return;
    }
    if !api.is_warm() {
        match api.warm().await {
            Ok(_) if !api.is_warm() => return,
            Ok(cached) => info!(cached, "cache warmed on retry"),
            Err(e) => {
                warn!(error = %e, "cache still cold, skipping sweep");
                return;
            }
        }
    }

    if let Err(e) = sweep(api).await {
        error!(error = %e, "reconciliation sweep failed");
    }
}

/// Run [`sweep`] every `every` until `token` is cancelled.
///
/// The first sweep happens one period after start. A sweep that overruns
/// its period delays the next one instead of stacking up.
pub fn spawn(api: AltApi, every: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => tick(&api).await,
            }
        }
        debug!("reconciler stopped");
    })
}
