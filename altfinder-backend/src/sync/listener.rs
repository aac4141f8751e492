use super::{Subscription, SyncMessage};
use crate::cache::SightingCache;
use altfinder_db::validation::normalize_ip;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Applies messages from peers to the local cache.
#[derive(Clone)]
pub struct SyncListener {
    cache: Arc<dyn SightingCache>,
    node_id: Uuid,
}

impl SyncListener {
    pub fn new(cache: Arc<dyn SightingCache>, node_id: Uuid) -> Self {
        Self { cache, node_id }
    }

    /// Apply one message. Returns whether the cache was touched.
    pub async fn apply(&self, message: SyncMessage) -> bool {
        match message {
            SyncMessage::Info { origin, .. } if origin == self.node_id => false,
            SyncMessage::Info {
                mut sighting,
                origin,
            } => {
                let Some(ip) = normalize_ip(&sighting.ip) else {
                    warn!(ip = %sighting.ip, %origin, "dropping sync message with invalid ip");
                    return false;
                };
                sighting.ip = ip;
                if let Err(e) = self.cache.put(&sighting).await {
                    warn!(error = %e, "failed to apply synced sighting");
                    return false;
                }
                debug!(player_id = %sighting.player_id, ip = %sighting.ip, %origin, "applied synced sighting");
                true
            }
            SyncMessage::Delete { key } => {
                if let Err(e) = self.cache.evict(&key).await {
                    warn!(error = %e, %key, "failed to apply synced delete");
                    return false;
                }
                debug!(%key, "applied synced delete");
                true
            }
        }
    }

    /// Consume `subscription` until it closes or `token` is cancelled.
    pub async fn run(self, mut subscription: Subscription, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = subscription.recv() => match message {
                    Some(message) => {
                        self.apply(message).await;
                    }
                    None => {
                        debug!("sync subscription ended");
                        break;
                    }
                },
            }
        }
    }

    pub fn spawn(self, subscription: Subscription, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(subscription, token))
    }
}
