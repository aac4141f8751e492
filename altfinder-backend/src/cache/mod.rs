//! Denormalized lookup sets kept in front of the store.
//!
//! Every backend maintains three indexes: ip to players, player to ips and
//! the per-pairing detail (count, server, timestamps). Caches never publish
//! anything; keeping peers in step is the sync layer's job.

mod disabled;
mod memory;
mod redis;

pub use disabled::DisabledCache;
pub use memory::MemoryCache;
pub use redis::RedisCache;

use crate::validation::Lookup;
use altfinder_db::{CorruptRow, Sighting};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("malformed cache entry: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait SightingCache: Send + Sync {
    /// `None` on a miss. A hit may hold an empty set if detail entries were
    /// evicted underneath the index.
    async fn get(&self, lookup: &Lookup) -> Result<Option<HashSet<Sighting>>, CacheError>;

    /// Refresh all three indexes for one pairing.
    async fn put(&self, sighting: &Sighting) -> Result<(), CacheError>;

    async fn put_all(&self, sightings: &[Sighting]) -> Result<(), CacheError> {
        for sighting in sightings {
            self.put(sighting).await?;
        }
        Ok(())
    }

    /// Drop every pairing that has `key` as its ip or its player id.
    async fn evict(&self, key: &str) -> Result<(), CacheError>;

    /// Drop the pairings behind rows the store rejected, then their offending keys.
    async fn evict_corrupt(&self, rows: &[CorruptRow]) -> Result<(), CacheError>;

    /// Drop every entry.
    async fn clear(&self) -> Result<(), CacheError>;
}

/// Which cache backend a node runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheConfig {
    Memory,
    Redis { url: String },
    Disabled,
}

pub async fn open_cache(config: &CacheConfig) -> Result<Arc<dyn SightingCache>, CacheError> {
    Ok(match config {
        CacheConfig::Memory => Arc::new(MemoryCache::new()),
        CacheConfig::Redis { url } => Arc::new(RedisCache::connect(url).await?),
        CacheConfig::Disabled => Arc::new(DisabledCache),
    })
}

/// Whether `incoming` should replace the cached detail `current`.
///
/// Broadcasts and reconciliation replays can arrive out of order; the
/// later observation wins, with the higher count breaking ties.
pub(crate) fn supersedes(current: &Sighting, incoming: &Sighting) -> bool {
    (incoming.updated, incoming.count) >= (current.updated, current.count)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use uuid::Uuid;

    pub(crate) fn sighting(player_id: Uuid, ip: &str, count: i64, updated: i64) -> Sighting {
        Sighting {
            player_id,
            ip: ip.to_string(),
            count,
            server: "lobby".to_string(),
            created: 1_700_000_000_000,
            updated,
        }
    }

    #[test]
    fn test_supersedes() {
        let player = Uuid::new_v4();
        let old = sighting(player, "1.2.3.4", 3, 100);
        let new = sighting(player, "1.2.3.4", 4, 200);

        assert!(supersedes(&old, &new));
        assert!(!supersedes(&new, &old));
        // Same state replayed is accepted
        assert!(supersedes(&new, &new.clone()));
        // Same millisecond, higher count wins
        let bumped = sighting(player, "1.2.3.4", 5, 200);
        assert!(supersedes(&new, &bumped));
        assert!(!supersedes(&bumped, &new));
    }

    #[tokio::test]
    async fn test_disabled_config_always_misses() {
        let cache = open_cache(&CacheConfig::Disabled).await.unwrap();
        let player = Uuid::new_v4();
        cache.put(&sighting(player, "1.2.3.4", 1, 0)).await.unwrap();
        assert!(
            cache
                .get(&Lookup::Player(player))
                .await
                .unwrap()
                .is_none()
        );
    }
}
