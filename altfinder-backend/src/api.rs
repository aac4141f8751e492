//! The single entry point tying store, cache and sync together.
//!
//! Reads go cache first and fall back to the store; writes go store first
//! and then refresh the cache and tell peers. Cache and sync failures are
//! logged and never fail an operation.
//!
//! The cache only answers reads once a full warm-up from the store has
//! succeeded. Until then it is still written to, but every read goes to
//! the store.

use crate::cache::{CacheError, SightingCache};
use crate::helpers::now_millis;
use crate::reconcile::{self, SweepStats};
use crate::sync::{Messenger, SyncMessage};
use crate::validation::{self, Lookup, ValidationError};
use altfinder_db::{DbError, Sighting, Store};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Broadcasts waiting for the publisher task before new ones are dropped
const OUTBOX_CAPACITY: usize = 4096;

// Cache read states
/// Never warmed, or the last warm-up failed
const COLD: u8 = 0;
const WARM: u8 = 1;
/// Peer messages may have been lost; only a resync leaves this state
const STALE: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("store operation failed: {0}")]
    Store(#[from] DbError),
    #[error("cache warm-up failed: {0}")]
    Cache(#[from] CacheError),
}

#[derive(Clone)]
pub struct AltApi {
    store: Arc<dyn Store>,
    cache: Arc<dyn SightingCache>,
    messenger: Arc<dyn Messenger>,
    node_id: Uuid,
    cache_state: Arc<AtomicU8>,
    outbox: mpsc::Sender<SyncMessage>,
}

impl AltApi {
    /// Must be called from within a Tokio runtime: broadcasts are sent by a
    /// background task, in the order they were issued.
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn SightingCache>,
        messenger: Arc<dyn Messenger>,
        node_id: Uuid,
    ) -> Self {
        let (outbox, mut pending) = mpsc::channel::<SyncMessage>(OUTBOX_CAPACITY);
        let publisher = messenger.clone();
        tokio::spawn(async move {
            while let Some(message) = pending.recv().await {
                if let Err(e) = publisher.publish(&message).await {
                    warn!(error = %e, channel = message.channel(), "broadcast failed");
                }
            }
        });

        Self {
            store,
            cache,
            messenger,
            node_id,
            cache_state: Arc::new(AtomicU8::new(COLD)),
            outbox,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<dyn SightingCache> {
        &self.cache
    }

    pub fn messenger(&self) -> &Arc<dyn Messenger> {
        &self.messenger
    }

    /// Whether reads are currently answered from the cache.
    pub fn is_warm(&self) -> bool {
        self.cache_state.load(Ordering::Acquire) == WARM
    }

    /// Whether the cache waits for a [`resync`](Self::resync) rather than a
    /// plain warm-up.
    pub fn is_stale(&self) -> bool {
        self.cache_state.load(Ordering::Acquire) == STALE
    }

    /// Stop answering reads from the cache until the next [`resync`](Self::resync).
    pub(crate) fn mark_stale(&self) {
        self.cache_state.store(STALE, Ordering::Release);
    }

    /// Sightings for an ip or player key given as text.
    pub async fn get(&self, key: &str) -> Result<HashSet<Sighting>, ApiError> {
        let lookup = Lookup::parse(key)?;
        Ok(self.get_lookup(&lookup).await)
    }

    /// Sightings for a parsed key. Backend failures read as "not found".
    pub async fn get_lookup(&self, lookup: &Lookup) -> HashSet<Sighting> {
        if self.is_warm() {
            match self.cache.get(lookup).await {
                Ok(Some(hit)) => {
                    debug!(key = %lookup, found = hit.len(), "cache hit");
                    return hit;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, key = %lookup, "cache read failed, using store"),
            }
        }

        let result = match lookup {
            Lookup::Ip(ip) => self.store.get_by_ip(ip).await,
            Lookup::Player(player_id) => self.store.get_by_player(*player_id).await,
        };
        let found = match result {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, key = %lookup, "store read failed");
                return HashSet::new();
            }
        };

        if !found.is_empty() {
            let rows: Vec<Sighting> = found.iter().cloned().collect();
            if let Err(e) = self.cache.put_all(&rows).await {
                warn!(error = %e, key = %lookup, "failed to repopulate cache");
            }
            for row in rows {
                self.publish_info(row);
            }
        }
        debug!(key = %lookup, found = found.len(), "cache miss served from store");
        found
    }

    /// Record a login. Fails only if the store write fails.
    pub async fn add(&self, player_id: Uuid, ip: &str, server: &str) -> Result<Sighting, ApiError> {
        let ip = validation::parse_ip(ip)?;
        validation::validate_server(server)?;

        let sighting = self.store.upsert(player_id, &ip, server).await?;

        if let Err(e) = self.cache.put(&sighting).await {
            warn!(error = %e, %player_id, %ip, "failed to cache new sighting");
        }
        self.publish_info(sighting.clone());

        Ok(sighting)
    }

    /// Delete every sighting sharing `key`. Returns the number of store rows removed.
    pub async fn remove(&self, key: &str) -> Result<u64, ApiError> {
        let key = Lookup::parse(key)?.key();

        let removed = self.store.delete(&key).await?;

        if let Err(e) = self.cache.evict(&key).await {
            warn!(error = %e, %key, "failed to evict removed key");
        }
        self.publish(SyncMessage::Delete { key: key.clone() });

        info!(%key, removed, "removed sightings");
        Ok(removed)
    }

    /// Sightings of other players on any of this player's ips, most frequent first.
    pub async fn find_alts(&self, player_id: Uuid) -> Vec<Sighting> {
        let own = self.get_lookup(&Lookup::Player(player_id)).await;

        let mut alts = Vec::new();
        for sighting in own {
            let shared = self.get_lookup(&Lookup::Ip(sighting.ip)).await;
            alts.extend(shared.into_iter().filter(|s| s.player_id != player_id));
        }

        alts.sort_by(|a, b| b.count.cmp(&a.count).then(b.updated.cmp(&a.updated)));
        alts
    }

    /// The store clock, or the local clock if the store cannot be reached.
    pub async fn store_time(&self) -> i64 {
        match self.store.current_time().await {
            Ok(now) => now,
            Err(e) => {
                warn!(error = %e, "store clock unavailable, using local time");
                now_millis()
            }
        }
    }

    /// Fill the cache from a full store scan and start answering reads from
    /// it, unless the cache was marked stale meanwhile. Returns the number of
    /// rows cached.
    pub async fn warm(&self) -> Result<usize, ApiError> {
        let loaded = self.store.load_all().await?;

        self.cache.put_all(&loaded.sightings).await?;
        if !loaded.corrupt.is_empty() {
            if let Err(e) = self.cache.evict_corrupt(&loaded.corrupt).await {
                warn!(error = %e, "failed to evict corrupt rows");
            }
            for corrupt in &loaded.corrupt {
                self.publish(SyncMessage::Delete {
                    key: corrupt.offending_key().to_string(),
                });
            }
        }

        if self
            .cache_state
            .compare_exchange(COLD, WARM, Ordering::AcqRel, Ordering::Acquire)
            == Err(STALE)
        {
            warn!("cache went stale during warm-up, still reading from the store");
        }
        info!(
            cached = loaded.sightings.len(),
            corrupt = loaded.corrupt.len(),
            "cache warmed"
        );
        Ok(loaded.sightings.len())
    }

    /// Throw the cache away and warm it again. Used after this node may have
    /// missed deletes, which no later message would repair.
    pub async fn resync(&self) -> Result<usize, ApiError> {
        self.mark_stale();
        self.cache.clear().await?;
        // A loss reported while clearing keeps the cache stale
        let _ = self.cache_state.compare_exchange(
            STALE,
            COLD,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.warm().await
    }

    /// One reconciliation sweep over the write-behind queue.
    pub async fn reconcile_once(&self) -> Result<SweepStats, ApiError> {
        reconcile::sweep(self).await
    }

    pub(crate) fn publish_info(&self, sighting: Sighting) {
        self.publish(SyncMessage::Info {
            sighting,
            origin: self.node_id,
        });
    }

    /// Queue a broadcast without waiting for the transport.
    pub(crate) fn publish(&self, message: SyncMessage) {
        let channel = message.channel();
        if let Err(e) = self.outbox.try_send(message) {
            warn!(error = %e, channel, "broadcast dropped");
        }
    }
}
