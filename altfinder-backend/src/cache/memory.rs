use super::{CacheError, SightingCache, supersedes};
use crate::validation::Lookup;
use altfinder_db::{CorruptRow, Sighting};
use async_trait::async_trait;
use scc::HashMap;
use scc::hash_map::Entry;
use std::collections::HashSet;
use uuid::Uuid;

/// In-process cache on lock-free concurrent maps.
pub struct MemoryCache {
    by_ip: HashMap<String, HashSet<Uuid>>,
    by_player: HashMap<Uuid, HashSet<String>>,
    details: HashMap<(Uuid, String), Sighting>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            by_ip: HashMap::new(),
            by_player: HashMap::new(),
            details: HashMap::new(),
        }
    }

    async fn detail(&self, player_id: Uuid, ip: &str) -> Option<Sighting> {
        self.details
            .read_async(&(player_id, ip.to_string()), |_, sighting| sighting.clone())
            .await
    }

    /// Remove `player_id` from the ip index entry, dropping the entry once empty.
    async fn unlink_player(&self, ip: &str, player_id: Uuid) {
        if let Entry::Occupied(mut entry) = self.by_ip.entry_async(ip.to_string()).await {
            entry.get_mut().remove(&player_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Remove `ip` from the player index entry, dropping the entry once empty.
    async fn unlink_ip(&self, player_id: Uuid, ip: &str) {
        if let Entry::Occupied(mut entry) = self.by_player.entry_async(player_id).await {
            entry.get_mut().remove(ip);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SightingCache for MemoryCache {
    async fn get(&self, lookup: &Lookup) -> Result<Option<HashSet<Sighting>>, CacheError> {
        let mut found = HashSet::new();
        match lookup {
            Lookup::Ip(ip) => {
                let Some(players) = self.by_ip.read_async(ip, |_, set| set.clone()).await else {
                    return Ok(None);
                };
                for player_id in players {
                    if let Some(sighting) = self.detail(player_id, ip).await {
                        found.insert(sighting);
                    }
                }
            }
            Lookup::Player(player_id) => {
                let Some(ips) = self
                    .by_player
                    .read_async(player_id, |_, set| set.clone())
                    .await
                else {
                    return Ok(None);
                };
                for ip in ips {
                    if let Some(sighting) = self.detail(*player_id, &ip).await {
                        found.insert(sighting);
                    }
                }
            }
        }
        Ok(Some(found))
    }

    async fn put(&self, sighting: &Sighting) -> Result<(), CacheError> {
        match self
            .details
            .entry_async((sighting.player_id, sighting.ip.clone()))
            .await
        {
            Entry::Occupied(mut entry) => {
                if supersedes(entry.get(), sighting) {
                    *entry.get_mut() = sighting.clone();
                }
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(sighting.clone());
            }
        }

        self.by_ip
            .entry_async(sighting.ip.clone())
            .await
            .or_default()
            .get_mut()
            .insert(sighting.player_id);
        self.by_player
            .entry_async(sighting.player_id)
            .await
            .or_default()
            .get_mut()
            .insert(sighting.ip.clone());

        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        // Key as an ip
        if let Some((ip, players)) = self.by_ip.remove_async(key).await {
            for player_id in players {
                self.details.remove_async(&(player_id, ip.clone())).await;
                self.unlink_ip(player_id, &ip).await;
            }
        }

        // Key as a player id
        if let Ok(player_id) = Uuid::parse_str(key) {
            if let Some((_, ips)) = self.by_player.remove_async(&player_id).await {
                for ip in ips {
                    self.details.remove_async(&(player_id, ip.clone())).await;
                    self.unlink_player(&ip, player_id).await;
                }
            }
        }

        Ok(())
    }

    async fn evict_corrupt(&self, rows: &[CorruptRow]) -> Result<(), CacheError> {
        for row in rows {
            if let Ok(player_id) = Uuid::parse_str(&row.player_id) {
                self.details
                    .remove_async(&(player_id, row.ip.clone()))
                    .await;
                self.unlink_ip(player_id, &row.ip).await;
                self.unlink_player(&row.ip, player_id).await;
            }
            self.evict(row.offending_key()).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.details.clear_async().await;
        self.by_ip.clear_async().await;
        self.by_player.clear_async().await;
        Ok(())
    }
}
