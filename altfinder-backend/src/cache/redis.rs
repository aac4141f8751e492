use super::{CacheError, SightingCache};
use crate::validation::Lookup;
use altfinder_db::{CorruptRow, Sighting};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

const IP_PREFIX: &str = "altfndr:ip:";
const PLAYER_PREFIX: &str = "altfndr:uuid:";
const INFO_PREFIX: &str = "altfndr:info:";

/// Writes the detail only if it is at least as new as the stored one, then
/// links both indexes, all in one atomic step. Mirrors `supersedes`.
///
/// KEYS: info, ip index, player index. ARGV: json, updated, count, player id, ip.
const PUT_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local write = true
if current then
  local ok, decoded = pcall(cjson.decode, current)
  if ok and type(decoded) == 'table' then
    local updated = tonumber(ARGV[2])
    local count = tonumber(ARGV[3])
    local current_updated = tonumber(decoded.updated) or 0
    local current_count = tonumber(decoded.count) or 0
    if updated < current_updated or (updated == current_updated and count < current_count) then
      write = false
    end
  end
end
if write then
  redis.call('SET', KEYS[1], ARGV[1])
end
redis.call('SADD', KEYS[2], ARGV[4])
redis.call('SADD', KEYS[3], ARGV[5])
if write then return 1 end
return 0
"#;

/// Keys fetched per SCAN round trip when clearing
const SCAN_BATCH: usize = 500;

fn ip_key(ip: &str) -> String {
    format!("{IP_PREFIX}{ip}")
}

fn player_key(player_id: &str) -> String {
    format!("{PLAYER_PREFIX}{player_id}")
}

fn info_key(player_id: &str, ip: &str) -> String {
    format!("{INFO_PREFIX}{player_id}|{ip}")
}

/// Detail value stored under `altfndr:info:{uuid}|{ip}`
#[derive(Debug, Serialize, Deserialize)]
struct InfoRecord {
    count: i64,
    server: String,
    created: i64,
    updated: i64,
}

impl InfoRecord {
    fn into_sighting(self, player_id: Uuid, ip: String) -> Sighting {
        Sighting {
            player_id,
            ip,
            count: self.count,
            server: self.server,
            created: self.created,
            updated: self.updated,
        }
    }
}

impl From<&Sighting> for InfoRecord {
    fn from(sighting: &Sighting) -> Self {
        Self {
            count: sighting.count,
            server: sighting.server.clone(),
            created: sighting.created,
            updated: sighting.updated,
        }
    }
}

/// Cache shared by every node pointed at the same Redis.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    put_script: Script,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!("redis cache connected");
        Ok(Self {
            conn,
            put_script: Script::new(PUT_SCRIPT),
        })
    }

    async fn info(&self, player_id: &str, ip: &str) -> Result<Option<InfoRecord>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(info_key(player_id, ip)).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Drop the detail entry and both index memberships of one pairing.
    async fn unlink(&self, player_id: &str, ip: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(info_key(player_id, ip)).await?;
        let _: () = conn.srem(ip_key(ip), player_id).await?;
        let _: () = conn.srem(player_key(player_id), ip).await?;
        Ok(())
    }
}

#[async_trait]
impl SightingCache for RedisCache {
    async fn get(&self, lookup: &Lookup) -> Result<Option<HashSet<Sighting>>, CacheError> {
        let mut conn = self.conn.clone();
        let key = match lookup {
            Lookup::Ip(ip) => ip_key(ip),
            Lookup::Player(id) => player_key(&id.to_string()),
        };

        // Redis deletes empty sets, so an empty reply is a miss
        let members: HashSet<String> = conn.smembers(&key).await?;
        if members.is_empty() {
            return Ok(None);
        }

        let mut found = HashSet::with_capacity(members.len());
        for member in members {
            let (player_id, ip) = match lookup {
                Lookup::Ip(ip) => (member, ip.clone()),
                Lookup::Player(id) => (id.to_string(), member),
            };
            let Ok(parsed) = Uuid::parse_str(&player_id) else {
                warn!(uuid = %player_id, "ignoring malformed player id in redis index");
                continue;
            };
            match self.info(&player_id, &ip).await {
                Ok(Some(record)) => {
                    found.insert(record.into_sighting(parsed, ip));
                }
                Ok(None) => {}
                Err(CacheError::Decode(e)) => {
                    warn!(error = %e, uuid = %player_id, %ip, "ignoring malformed redis detail");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(found))
    }

    async fn put(&self, sighting: &Sighting) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let player_id = sighting.player_id.to_string();
        let json = serde_json::to_string(&InfoRecord::from(sighting))?;

        let written: i64 = self
            .put_script
            .key(info_key(&player_id, &sighting.ip))
            .key(ip_key(&sighting.ip))
            .key(player_key(&player_id))
            .arg(json)
            .arg(sighting.updated)
            .arg(sighting.count)
            .arg(&player_id)
            .arg(&sighting.ip)
            .invoke_async(&mut conn)
            .await?;
        if written == 0 {
            debug!(%player_id, ip = %sighting.ip, "kept newer cached detail");
        }
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();

        let players: HashSet<String> = conn.smembers(ip_key(key)).await?;
        for player_id in &players {
            self.unlink(player_id, key).await?;
        }
        let _: () = conn.del(ip_key(key)).await?;

        let ips: HashSet<String> = conn.smembers(player_key(key)).await?;
        for ip in &ips {
            self.unlink(key, ip).await?;
        }
        let _: () = conn.del(player_key(key)).await?;

        debug!(key, players = players.len(), ips = ips.len(), "evicted from redis cache");
        Ok(())
    }

    async fn evict_corrupt(&self, rows: &[CorruptRow]) -> Result<(), CacheError> {
        for row in rows {
            self.unlink(&row.player_id, &row.ip).await?;
            self.evict(row.offending_key()).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("altfndr:*")
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                removed += keys.len();
                let _: () = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(removed, "cleared redis cache");
        Ok(())
    }
}
