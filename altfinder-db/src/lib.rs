mod error;
mod models;
mod mysql;
mod sqlite;
pub mod validation;

pub use error::{DbError, Result};
pub use models::{CorruptField, CorruptRow, DumpPage, FetchResult, Sighting};
pub use mysql::MySqlStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::models::RawRow;

/// Authoritative storage for sightings and the write-behind queue.
///
/// Every backend implements the same semantics; callers only ever see
/// [`DbError`], never a driver error type.
#[async_trait]
pub trait Store: Send + Sync {
  /// Create the sightings and queue tables if they do not exist yet.
  async fn create_schema(&self) -> Result<()>;

  /// Record one login: insert with `count = 1` or bump the existing row,
  /// then refresh the queue row. Returns the authoritative row.
  async fn upsert(&self, player_id: Uuid, ip: &str, server: &str) -> Result<Sighting>;

  async fn get_by_ip(&self, ip: &str) -> Result<HashSet<Sighting>>;

  async fn get_by_player(&self, player_id: Uuid) -> Result<HashSet<Sighting>>;

  /// Delete every sighting and queue row whose ip or uuid equals `key`.
  /// Returns the number of sighting rows removed.
  async fn delete(&self, key: &str) -> Result<u64>;

  /// Full scan used to warm a cache. Corrupt rows are deleted and reported.
  async fn load_all(&self) -> Result<FetchResult>;

  /// Read the queue oldest-first, drop corrupt rows, purge expired entries.
  async fn drain_queue(&self) -> Result<FetchResult>;

  /// The store's clock in Unix millis.
  async fn current_time(&self) -> Result<i64>;

  /// Page through the sightings table for reseeding. `after` is the cursor
  /// returned by the previous page (start with 0).
  async fn dump(&self, after: i64, limit: usize) -> Result<DumpPage>;

  /// Bulk-write sightings verbatim, optionally emptying both tables first.
  async fn load(&self, rows: Vec<Sighting>, truncate: bool) -> Result<()>;
}

/// Which storage backend to open.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreConfig {
  Sqlite {
    path: PathBuf,
  },
  MySql {
    url: String,
    max_connections: u32,
    connect_timeout: Duration,
  },
}

/// Settings shared by every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
  /// Prefix ending in `_`; the sightings table is the prefix without it,
  /// the queue table is `{prefix}queue`
  pub table_prefix: String,
  /// How long a queue row stays eligible for replay
  pub queue_ttl: Duration,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      table_prefix: "altfinder_".to_string(),
      queue_ttl: Duration::from_secs(120),
    }
  }
}

/// Open the configured backend and make sure its schema exists.
pub async fn open_store(config: &StoreConfig, options: StoreOptions) -> Result<Arc<dyn Store>> {
  match config {
    StoreConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path, options).await?)),
    StoreConfig::MySql {
      url,
      max_connections,
      connect_timeout,
    } => Ok(Arc::new(
      MySqlStore::connect(url, *max_connections, *connect_timeout, options).await?,
    )),
  }
}

/// Resolved table names.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
  pub sightings: String,
  pub queue: String,
}

impl Tables {
  pub(crate) fn new(prefix: &str) -> Result<Self> {
    let valid = prefix.len() >= 2
      && prefix.ends_with('_')
      && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
      return Err(DbError::InvalidConfig(format!(
        "table prefix {prefix:?} must be alphanumeric/underscore and end with '_'"
      )));
    }

    Ok(Self {
      sightings: prefix[..prefix.len() - 1].to_string(),
      queue: format!("{prefix}queue"),
    })
  }
}

/// Shift a clock reading taken from a query response by half the round trip.
pub(crate) fn corrected_time(store_millis: i64, round_trip: Duration) -> i64 {
  store_millis + (round_trip.as_millis() / 2) as i64
}

/// Builds a [`DumpPage`] from raw `(id, row)` pairs fetched with `LIMIT limit`.
///
/// The cursor follows the raw ids, so a page that loses rows to validation
/// still points at the next page.
pub(crate) fn dump_page(rows: Vec<(i64, RawRow)>, limit: usize) -> DumpPage {
  let next = if rows.len() >= limit {
    rows.last().map(|(id, _)| *id)
  } else {
    None
  };

  let rows = rows
    .into_iter()
    .filter_map(|(_, row)| match row.into_sighting() {
      Ok(sighting) => Some(sighting),
      Err(corrupt) => {
        warn!(uuid = %corrupt.player_id, ip = %corrupt.ip, "skipping corrupt sighting in dump");
        None
      }
    })
    .collect();

  DumpPage { rows, next }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_table_names() {
    let tables = Tables::new("altfinder_").unwrap();
    assert_eq!(tables.sightings, "altfinder");
    assert_eq!(tables.queue, "altfinder_queue");

    let tables = Tables::new("net1_alts_").unwrap();
    assert_eq!(tables.sightings, "net1_alts");
    assert_eq!(tables.queue, "net1_alts_queue");
  }

  #[test]
  fn test_rejects_unsafe_prefix() {
    assert!(Tables::new("").is_err());
    assert!(Tables::new("_").is_err());
    assert!(Tables::new("altfinder").is_err());
    assert!(Tables::new("alt`; DROP TABLE x;_").is_err());
  }

  #[test]
  fn test_corrected_time() {
    assert_eq!(corrected_time(1_000, Duration::from_millis(40)), 1_020);
    assert_eq!(corrected_time(1_000, Duration::ZERO), 1_000);
  }

  fn raw(id: i64, player_id: Option<&str>) -> (i64, RawRow) {
    let player_id = player_id
      .map(str::to_string)
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    (
      id,
      RawRow {
        player_id,
        ip: format!("10.0.0.{id}"),
        count: 1,
        server: "lobby".to_string(),
        created: 0,
        updated: 0,
      },
    )
  }

  #[test]
  fn test_dump_page_cursor() {
    let page = dump_page(vec![raw(3, None), raw(7, None)], 2);
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.next, Some(7));

    let page = dump_page(vec![raw(9, None)], 2);
    assert_eq!(page.next, None);
  }

  #[test]
  fn test_dump_page_cursor_counts_corrupt_rows() {
    let page = dump_page(vec![raw(3, Some("Notch")), raw(7, None)], 2);
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.next, Some(7));

    let page = dump_page(vec![raw(8, Some("Notch")), raw(9, Some("jeb_"))], 2);
    assert!(page.rows.is_empty());
    assert_eq!(page.next, Some(9));
  }
}
