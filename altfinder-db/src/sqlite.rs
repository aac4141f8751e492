use crate::models::{RawRow, partition_rows};
use crate::{
  DbError, DumpPage, FetchResult, Result, Sighting, Store, StoreOptions, Tables, corrected_time,
  dump_page,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, Row, Transaction, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// SQLite's clock in Unix millis.
const NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

/// SQLite-backed store. All queries run on the connection's background thread.
#[derive(Clone)]
pub struct SqliteStore {
  conn: Connection,
  tables: Tables,
  queue_ttl: Duration,
}

impl SqliteStore {
  /// Open or create a database at the given path.
  pub async fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
    let tables = Tables::new(&options.table_prefix)?;
    let conn = Connection::open(path).await.map_err(DbError::Sqlite)?;
    let store = Self {
      conn,
      tables,
      queue_ttl: options.queue_ttl,
    };
    store.create_schema().await?;
    Ok(store)
  }

  /// Create an in-memory database (useful for testing).
  pub async fn open_in_memory(options: StoreOptions) -> Result<Self> {
    let tables = Tables::new(&options.table_prefix)?;
    let conn = Connection::open_in_memory()
      .await
      .map_err(DbError::Sqlite)?;
    let store = Self {
      conn,
      tables,
      queue_ttl: options.queue_ttl,
    };
    store.create_schema().await?;
    Ok(store)
  }
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
  Ok(RawRow {
    player_id: row.get(0)?,
    ip: row.get(1)?,
    count: row.get(2)?,
    server: row.get(3)?,
    created: row.get(4)?,
    updated: row.get(5)?,
  })
}

/// Read every row of `table`, delete the ones that fail validation and
/// return the rest in query order.
fn fetch_checked(tx: &Transaction<'_>, table: &str, order_by: &str) -> rusqlite::Result<FetchResult> {
  let rows = tx
    .prepare_cached(&format!(
      "SELECT uuid, ip, count, server, created, updated FROM {table} ORDER BY {order_by}"
    ))?
    .query_map([], raw_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let result = partition_rows(rows);
  for corrupt in &result.corrupt {
    let column = match corrupt.field {
      crate::CorruptField::PlayerId => "uuid",
      crate::CorruptField::Ip => "ip",
    };
    tx.prepare_cached(&format!("DELETE FROM {table} WHERE {column} = ?1"))?
      .execute(params![corrupt.offending_key()])?;
  }

  Ok(result)
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_schema(&self) -> Result<()> {
    let Tables { sightings, queue } = self.tables.clone();

    self
      .conn
      .call(move |conn| -> rusqlite::Result<()> {
        // Enable WAL mode for better concurrent read/write performance
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute_batch(&format!(
          r#"
          -- Authoritative sightings, one row per (ip, uuid)
          CREATE TABLE IF NOT EXISTS {sightings} (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              uuid TEXT NOT NULL,
              ip TEXT NOT NULL,
              count INTEGER NOT NULL DEFAULT 1,
              server TEXT NOT NULL,
              created INTEGER NOT NULL,
              updated INTEGER NOT NULL,
              UNIQUE(ip, uuid)
          );

          CREATE INDEX IF NOT EXISTS {sightings}_uuid_idx ON {sightings}(uuid);

          -- Recent writes, replayed to other nodes until they age out
          CREATE TABLE IF NOT EXISTS {queue} (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              uuid TEXT NOT NULL,
              ip TEXT NOT NULL,
              count INTEGER NOT NULL,
              server TEXT NOT NULL,
              created INTEGER NOT NULL,
              updated INTEGER NOT NULL,
              UNIQUE(ip, uuid)
          );

          CREATE INDEX IF NOT EXISTS {queue}_updated_idx ON {queue}(updated);
          "#
        ))?;
        Ok(())
      })
      .await?;

    info!(table = %self.tables.sightings, "sqlite schema initialized");
    Ok(())
  }

  async fn upsert(&self, player_id: Uuid, ip: &str, server: &str) -> Result<Sighting> {
    let Tables { sightings, queue } = self.tables.clone();
    let uuid = player_id.to_string();
    let ip = ip.to_string();
    let server = server.to_string();

    let sighting = self
      .conn
      .call(move |conn| -> rusqlite::Result<Sighting> {
        let tx = conn.transaction()?;

        let (count, created, updated): (i64, i64, i64) = tx
          .prepare_cached(&format!(
            "INSERT INTO {sightings} (uuid, ip, count, server, created, updated)
             VALUES (?1, ?2, 1, ?3, {NOW_MS}, {NOW_MS})
             ON CONFLICT(ip, uuid) DO UPDATE SET
               count = count + 1,
               server = excluded.server,
               updated = MAX(updated, excluded.updated)
             RETURNING count, created, updated"
          ))?
          .query_row(params![&uuid, &ip, &server], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
          })?;

        tx.prepare_cached(&format!(
          "INSERT INTO {queue} (uuid, ip, count, server, created, updated)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)
           ON CONFLICT(ip, uuid) DO UPDATE SET
             count = excluded.count,
             server = excluded.server,
             updated = excluded.updated"
        ))?
        .execute(params![&uuid, &ip, count, &server, created, updated])?;

        tx.commit()?;
        Ok(Sighting {
          player_id,
          ip,
          count,
          server,
          created,
          updated,
        })
      })
      .await?;

    debug!(
      player_id = %sighting.player_id,
      ip = %sighting.ip,
      count = sighting.count,
      "upserted sighting"
    );
    Ok(sighting)
  }

  async fn get_by_ip(&self, ip: &str) -> Result<HashSet<Sighting>> {
    let sightings = self.tables.sightings.clone();
    let ip = ip.to_string();

    let rows = self
      .conn
      .call(move |conn| -> rusqlite::Result<Vec<RawRow>> {
        conn
          .prepare_cached(&format!(
            "SELECT uuid, ip, count, server, created, updated FROM {sightings} WHERE ip = ?1"
          ))?
          .query_map(params![&ip], raw_row)?
          .collect()
      })
      .await?;

    Ok(valid_only(rows))
  }

  async fn get_by_player(&self, player_id: Uuid) -> Result<HashSet<Sighting>> {
    let sightings = self.tables.sightings.clone();
    let uuid = player_id.to_string();

    let rows = self
      .conn
      .call(move |conn| -> rusqlite::Result<Vec<RawRow>> {
        conn
          .prepare_cached(&format!(
            "SELECT uuid, ip, count, server, created, updated FROM {sightings} WHERE uuid = ?1"
          ))?
          .query_map(params![&uuid], raw_row)?
          .collect()
      })
      .await?;

    Ok(valid_only(rows))
  }

  async fn delete(&self, key: &str) -> Result<u64> {
    let Tables { sightings, queue } = self.tables.clone();
    let key = key.to_string();
    let key_log = key.clone();

    let deleted = self
      .conn
      .call(move |conn| -> rusqlite::Result<usize> {
        let tx = conn.transaction()?;

        tx.prepare_cached(&format!("DELETE FROM {queue} WHERE ip = ?1 OR uuid = ?1"))?
          .execute(params![&key])?;
        let deleted = tx
          .prepare_cached(&format!("DELETE FROM {sightings} WHERE ip = ?1 OR uuid = ?1"))?
          .execute(params![&key])?;

        tx.commit()?;
        Ok(deleted)
      })
      .await?;

    debug!(key = %key_log, deleted, "deleted sightings");
    Ok(deleted as u64)
  }

  async fn load_all(&self) -> Result<FetchResult> {
    let sightings = self.tables.sightings.clone();

    let result = self
      .conn
      .call(move |conn| -> rusqlite::Result<FetchResult> {
        let tx = conn.transaction()?;
        let result = fetch_checked(&tx, &sightings, "id ASC")?;
        tx.commit()?;
        Ok(result)
      })
      .await?;

    for corrupt in &result.corrupt {
      warn!(uuid = %corrupt.player_id, ip = %corrupt.ip, field = ?corrupt.field, "removed corrupt sighting");
    }
    info!(
      loaded = result.sightings.len(),
      removed = result.corrupt.len(),
      "loaded sightings"
    );
    Ok(result)
  }

  async fn drain_queue(&self) -> Result<FetchResult> {
    let queue = self.tables.queue.clone();
    let ttl_ms = self.queue_ttl.as_millis() as i64;

    let result = self
      .conn
      .call(move |conn| -> rusqlite::Result<FetchResult> {
        let tx = conn.transaction()?;
        let result = fetch_checked(&tx, &queue, "updated ASC, id ASC")?;

        tx.prepare_cached(&format!("DELETE FROM {queue} WHERE updated <= {NOW_MS} - ?1"))?
          .execute(params![ttl_ms])?;

        tx.commit()?;
        Ok(result)
      })
      .await?;

    for corrupt in &result.corrupt {
      warn!(uuid = %corrupt.player_id, ip = %corrupt.ip, field = ?corrupt.field, "removed corrupt queue row");
    }
    Ok(result)
  }

  async fn current_time(&self) -> Result<i64> {
    let started = Instant::now();
    let now = self
      .conn
      .call(|conn| -> rusqlite::Result<i64> {
        conn
          .prepare_cached(&format!("SELECT {NOW_MS}"))?
          .query_row([], |row| row.get(0))
      })
      .await?;

    Ok(corrected_time(now, started.elapsed()))
  }

  async fn dump(&self, after: i64, limit: usize) -> Result<DumpPage> {
    let sightings = self.tables.sightings.clone();
    let limit_param = limit as i64;

    let rows = self
      .conn
      .call(move |conn| -> rusqlite::Result<Vec<(i64, RawRow)>> {
        conn
          .prepare_cached(&format!(
            "SELECT id, uuid, ip, count, server, created, updated FROM {sightings}
             WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
          ))?
          .query_map(params![after, limit_param], |row| {
            Ok((
              row.get(0)?,
              RawRow {
                player_id: row.get(1)?,
                ip: row.get(2)?,
                count: row.get(3)?,
                server: row.get(4)?,
                created: row.get(5)?,
                updated: row.get(6)?,
              },
            ))
          })?
          .collect()
      })
      .await?;

    Ok(dump_page(rows, limit))
  }

  async fn load(&self, rows: Vec<Sighting>, truncate: bool) -> Result<()> {
    let Tables { sightings, queue } = self.tables.clone();
    let count = rows.len();

    self
      .conn
      .call(move |conn| -> rusqlite::Result<()> {
        let tx = conn.transaction()?;

        if truncate {
          tx.execute_batch(&format!("DELETE FROM {queue}; DELETE FROM {sightings};"))?;
        }

        {
          let mut insert_stmt = tx.prepare_cached(&format!(
            "INSERT INTO {sightings} (uuid, ip, count, server, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(ip, uuid) DO UPDATE SET
               count = excluded.count,
               server = excluded.server,
               created = excluded.created,
               updated = excluded.updated"
          ))?;
          for row in &rows {
            insert_stmt.execute(params![
              row.player_id.to_string(),
              &row.ip,
              row.count,
              &row.server,
              row.created,
              row.updated
            ])?;
          }
        }

        tx.commit()?;
        Ok(())
      })
      .await?;

    debug!(count, truncate, "loaded sightings");
    Ok(())
  }
}

/// Point lookups skip (but do not delete) rows that fail validation;
/// cleanup is left to `load_all`.
fn valid_only(rows: Vec<RawRow>) -> HashSet<Sighting> {
  rows
    .into_iter()
    .filter_map(|row| match row.into_sighting() {
      Ok(sighting) => Some(sighting),
      Err(corrupt) => {
        warn!(uuid = %corrupt.player_id, ip = %corrupt.ip, "skipping corrupt sighting");
        None
      }
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::CorruptField;

  async fn store() -> SqliteStore {
    SqliteStore::open_in_memory(StoreOptions::default())
      .await
      .unwrap()
  }

  /// Write a row directly, bypassing validation.
  async fn insert_raw(store: &SqliteStore, table: &str, uuid: &str, ip: &str, updated: i64) {
    let table = table.to_string();
    let uuid = uuid.to_string();
    let ip = ip.to_string();
    store
      .conn
      .call(move |conn| -> rusqlite::Result<()> {
        conn.execute(
          &format!(
            "INSERT INTO {table} (uuid, ip, count, server, created, updated) VALUES (?1, ?2, 1, 'lobby', ?3, ?3)"
          ),
          params![uuid, ip, updated],
        )?;
        Ok(())
      })
      .await
      .unwrap();
  }

  async fn queue_len(store: &SqliteStore) -> i64 {
    let queue = store.tables.queue.clone();
    store
      .conn
      .call(move |conn| -> rusqlite::Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {queue}"), [], |row| row.get(0))
      })
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_schema_is_idempotent() {
    let store = store().await;
    store.create_schema().await.unwrap();
    store.create_schema().await.unwrap();
  }

  #[tokio::test]
  async fn test_upsert_counts_and_keeps_created() {
    let store = store().await;
    let player = Uuid::new_v4();

    let first = store.upsert(player, "1.2.3.4", "lobby").await.unwrap();
    assert_eq!(first.count, 1);
    assert_eq!(first.server, "lobby");

    let mut previous = first.clone();
    for n in 2..=5 {
      let next = store.upsert(player, "1.2.3.4", "survival").await.unwrap();
      assert_eq!(next.count, n);
      assert_eq!(next.created, first.created);
      assert!(next.updated >= previous.updated);
      assert_eq!(next.server, "survival");
      previous = next;
    }

    let rows = store.get_by_player(player).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = rows.into_iter().next().unwrap();
    assert_eq!(row.count, 5);
    assert_eq!(row.server, "survival");
  }

  #[tokio::test]
  async fn test_get_by_ip_returns_every_player() {
    let store = store().await;
    let u1 = Uuid::new_v4();
    let u2 = Uuid::new_v4();

    store.upsert(u1, "1.2.3.4", "srv-a").await.unwrap();
    store.upsert(u2, "1.2.3.4", "srv-a").await.unwrap();
    store.upsert(u2, "5.6.7.8", "srv-a").await.unwrap();

    let rows = store.get_by_ip("1.2.3.4").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|s| s.count == 1 && s.ip == "1.2.3.4"));
    let players: HashSet<Uuid> = rows.iter().map(|s| s.player_id).collect();
    assert_eq!(players, HashSet::from([u1, u2]));

    assert!(store.get_by_ip("9.9.9.9").await.unwrap().is_empty());
    assert!(store.get_by_player(Uuid::new_v4()).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_delete_cascades_by_either_key() {
    let store = store().await;
    let u1 = Uuid::new_v4();
    let u2 = Uuid::new_v4();

    store.upsert(u1, "1.2.3.4", "lobby").await.unwrap();
    store.upsert(u1, "5.6.7.8", "lobby").await.unwrap();
    store.upsert(u2, "1.2.3.4", "lobby").await.unwrap();

    // By IP: both players lose 1.2.3.4, u1 keeps 5.6.7.8
    assert_eq!(store.delete("1.2.3.4").await.unwrap(), 2);
    assert!(store.get_by_ip("1.2.3.4").await.unwrap().is_empty());
    let rest = store.get_by_player(u1).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest.iter().next().unwrap().ip, "5.6.7.8");

    // By player
    assert_eq!(store.delete(&u1.to_string()).await.unwrap(), 1);
    assert!(store.get_by_player(u1).await.unwrap().is_empty());

    // Queue rows go with them
    let drained = store.drain_queue().await.unwrap();
    assert!(drained.sightings.is_empty());
  }

  #[tokio::test]
  async fn test_load_all_removes_corrupt_rows() {
    let store = store().await;
    let good = Uuid::new_v4();
    store.upsert(good, "1.2.3.4", "lobby").await.unwrap();
    insert_raw(&store, "altfinder", "Notch", "1.2.3.4", 0).await;
    insert_raw(&store, "altfinder", &Uuid::new_v4().to_string(), "not-an-ip", 0).await;

    let result = store.load_all().await.unwrap();
    assert_eq!(result.sightings.len(), 1);
    assert_eq!(result.sightings[0].player_id, good);
    assert_eq!(result.corrupt.len(), 2);
    assert_eq!(result.corrupt[0].field, CorruptField::PlayerId);
    assert_eq!(result.corrupt[0].offending_key(), "Notch");
    assert_eq!(result.corrupt[1].field, CorruptField::Ip);

    // Deleted from the store, so a second scan is clean
    let again = store.load_all().await.unwrap();
    assert_eq!(again.sightings.len(), 1);
    assert!(again.corrupt.is_empty());
  }

  #[tokio::test]
  async fn test_drain_queue_orders_oldest_first_and_purges() {
    let store = store().await;
    let now = store.current_time().await.unwrap();
    let old = Uuid::new_v4();
    let fresh = Uuid::new_v4();

    insert_raw(&store, "altfinder_queue", &fresh.to_string(), "1.1.1.1", now).await;
    insert_raw(&store, "altfinder_queue", &old.to_string(), "2.2.2.2", now - 600_000).await;
    insert_raw(&store, "altfinder_queue", "garbage", "3.3.3.3", now).await;

    let drained = store.drain_queue().await.unwrap();
    let order: Vec<Uuid> = drained.sightings.iter().map(|s| s.player_id).collect();
    assert_eq!(order, vec![old, fresh]);
    assert_eq!(drained.corrupt.len(), 1);

    // The expired row and the corrupt row are gone, the fresh one stays
    assert_eq!(queue_len(&store).await, 1);
    let drained = store.drain_queue().await.unwrap();
    assert_eq!(drained.sightings.len(), 1);
    assert_eq!(drained.sightings[0].player_id, fresh);
  }

  #[tokio::test]
  async fn test_upsert_refreshes_queue_row() {
    let store = store().await;
    let player = Uuid::new_v4();
    store.upsert(player, "1.2.3.4", "lobby").await.unwrap();
    let latest = store.upsert(player, "1.2.3.4", "survival").await.unwrap();

    let drained = store.drain_queue().await.unwrap();
    assert_eq!(drained.sightings.len(), 1);
    let queued = &drained.sightings[0];
    assert_eq!(queued.count, 2);
    assert_eq!(queued.server, "survival");
    assert_eq!(queued.created, latest.created);
    assert_eq!(queued.updated, latest.updated);
  }

  #[tokio::test]
  async fn test_zero_ttl_empties_queue() {
    let store = SqliteStore::open_in_memory(StoreOptions {
      queue_ttl: Duration::ZERO,
      ..StoreOptions::default()
    })
    .await
    .unwrap();
    store.upsert(Uuid::new_v4(), "1.2.3.4", "lobby").await.unwrap();

    // Rows are still returned once before being purged
    assert_eq!(store.drain_queue().await.unwrap().sightings.len(), 1);
    assert_eq!(queue_len(&store).await, 0);
  }

  #[tokio::test]
  async fn test_current_time_is_plausible() {
    let store = store().await;
    let now = store.current_time().await.unwrap();
    // After 2023-11-14, before 2100
    assert!(now > 1_700_000_000_000);
    assert!(now < 4_102_444_800_000);
  }

  #[tokio::test]
  async fn test_dump_and_load_roundtrip_between_stores() {
    let source = store().await;
    for n in 0..5 {
      let player = Uuid::new_v4();
      source.upsert(player, &format!("10.0.0.{n}"), "lobby").await.unwrap();
      source.upsert(player, &format!("10.0.0.{n}"), "lobby").await.unwrap();
    }

    let first = source.dump(0, 2).await.unwrap();
    assert_eq!(first.rows.len(), 2);
    let cursor = first.next.unwrap();
    let second = source.dump(cursor, 10).await.unwrap();
    assert_eq!(second.rows.len(), 3);
    assert_eq!(second.next, None);

    let target = store().await;
    target.upsert(Uuid::new_v4(), "192.168.0.1", "stale").await.unwrap();
    target.load(first.rows.clone(), true).await.unwrap();
    target.load(second.rows.clone(), false).await.unwrap();

    let loaded = target.load_all().await.unwrap();
    assert_eq!(loaded.sightings.len(), 5);
    assert!(loaded.sightings.iter().all(|s| s.count == 2));
    assert!(target.get_by_ip("192.168.0.1").await.unwrap().is_empty());

    let original = first.rows[0].clone();
    let copied = target.get_by_player(original.player_id).await.unwrap();
    let copied = copied.iter().next().unwrap();
    assert_eq!(copied.created, original.created);
    assert_eq!(copied.updated, original.updated);
  }

  #[tokio::test]
  async fn test_dump_pages_past_corrupt_rows() {
    let store = store().await;
    store.upsert(Uuid::new_v4(), "10.0.0.1", "lobby").await.unwrap();
    insert_raw(&store, "altfinder", "Notch", "10.0.0.2", 0).await;
    for n in 3..8 {
      store.upsert(Uuid::new_v4(), &format!("10.0.0.{n}"), "lobby").await.unwrap();
    }

    let mut dumped = Vec::new();
    let mut cursor = 0;
    loop {
      let page = store.dump(cursor, 2).await.unwrap();
      dumped.extend(page.rows);
      match page.next {
        Some(next) => cursor = next,
        None => break,
      }
    }

    assert_eq!(dumped.len(), 6);
    assert!(dumped.iter().all(|s| s.ip != "10.0.0.2"));
  }

  #[tokio::test]
  async fn test_custom_prefix() {
    let store = SqliteStore::open_in_memory(StoreOptions {
      table_prefix: "net_".to_string(),
      ..StoreOptions::default()
    })
    .await
    .unwrap();
    assert_eq!(store.tables.sightings, "net");
    store.upsert(Uuid::new_v4(), "::1", "lobby").await.unwrap();
    assert_eq!(store.get_by_ip("::1").await.unwrap().len(), 1);
  }
}
