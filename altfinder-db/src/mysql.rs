use crate::models::{RawRow, partition_rows};
use crate::{
  CorruptField, DbError, DumpPage, FetchResult, Result, Sighting, Store, StoreOptions, Tables,
  corrected_time, dump_page,
};
use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, Row, Transaction};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// MySQL's clock in Unix millis.
const NOW_MS: &str = "CAST(UNIX_TIMESTAMP(NOW(3)) * 1000 AS SIGNED)";

const COLUMNS: &str = "uuid, ip, count, server, created, updated";

/// MySQL-backed store over a bounded connection pool.
#[derive(Clone)]
pub struct MySqlStore {
  pool: MySqlPool,
  tables: Tables,
  queue_ttl: Duration,
}

impl MySqlStore {
  pub async fn connect(
    url: &str,
    max_connections: u32,
    connect_timeout: Duration,
    options: StoreOptions,
  ) -> Result<Self> {
    let tables = Tables::new(&options.table_prefix)?;
    let pool = MySqlPoolOptions::new()
      .max_connections(max_connections)
      .acquire_timeout(connect_timeout)
      .connect(url)
      .await?;

    info!(max_connections, "connected to mysql");

    let store = Self {
      pool,
      tables,
      queue_ttl: options.queue_ttl,
    };
    store.create_schema().await?;
    Ok(store)
  }
}

fn raw_row(row: &MySqlRow) -> std::result::Result<RawRow, sqlx::Error> {
  Ok(RawRow {
    player_id: row.try_get("uuid")?,
    ip: row.try_get("ip")?,
    count: row.try_get("count")?,
    server: row.try_get("server")?,
    created: row.try_get("created")?,
    updated: row.try_get("updated")?,
  })
}

fn raw_rows(rows: &[MySqlRow]) -> Result<Vec<RawRow>> {
  rows
    .iter()
    .map(|row| raw_row(row).map_err(DbError::from))
    .collect()
}

/// Read every row of `table`, delete the ones that fail validation and
/// return the rest in query order.
async fn fetch_checked(
  tx: &mut Transaction<'_, MySql>,
  table: &str,
  order_by: &str,
) -> Result<FetchResult> {
  let sql = format!("SELECT {COLUMNS} FROM {table} ORDER BY {order_by}");
  let rows = sqlx::query(&sql).fetch_all(&mut **tx).await?;
  let result = partition_rows(raw_rows(&rows)?);

  for corrupt in &result.corrupt {
    let column = match corrupt.field {
      CorruptField::PlayerId => "uuid",
      CorruptField::Ip => "ip",
    };
    let sql = format!("DELETE FROM {table} WHERE {column} = ?");
    sqlx::query(&sql)
      .bind(corrupt.offending_key())
      .execute(&mut **tx)
      .await?;
  }

  Ok(result)
}

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

#[async_trait]
impl Store for MySqlStore {
  async fn create_schema(&self) -> Result<()> {
    let Tables { sightings, queue } = &self.tables;

    let sightings_sql = format!(
      "CREATE TABLE IF NOT EXISTS {sightings} (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        uuid VARCHAR(36) NOT NULL,
        ip VARCHAR(64) NOT NULL,
        count BIGINT NOT NULL DEFAULT 1,
        server VARCHAR(255) NOT NULL,
        created BIGINT NOT NULL,
        updated BIGINT NOT NULL,
        UNIQUE KEY {sightings}_ip_uuid (ip, uuid),
        KEY {sightings}_uuid_idx (uuid)
      )"
    );
    let queue_sql = format!(
      "CREATE TABLE IF NOT EXISTS {queue} (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        uuid VARCHAR(36) NOT NULL,
        ip VARCHAR(64) NOT NULL,
        count BIGINT NOT NULL,
        server VARCHAR(255) NOT NULL,
        created BIGINT NOT NULL,
        updated BIGINT NOT NULL,
        UNIQUE KEY {queue}_ip_uuid (ip, uuid),
        KEY {queue}_updated_idx (updated)
      )"
    );

    sqlx::query(&sightings_sql).execute(&self.pool).await?;
    sqlx::query(&queue_sql).execute(&self.pool).await?;

    info!(table = %sightings, "mysql schema initialized");
    Ok(())
  }

  async fn upsert(&self, player_id: Uuid, ip: &str, server: &str) -> Result<Sighting> {
    let Tables { sightings, queue } = &self.tables;
    let uuid = player_id.to_string();
    let mut tx = self.pool.begin().await?;

    let upsert_sql = format!(
      "INSERT INTO {sightings} ({COLUMNS}) VALUES (?, ?, 1, ?, {NOW_MS}, {NOW_MS})
       ON DUPLICATE KEY UPDATE
         count = count + 1,
         server = VALUES(server),
         updated = GREATEST(updated, VALUES(updated))"
    );
    sqlx::query(&upsert_sql)
      .bind(&uuid)
      .bind(ip)
      .bind(server)
      .execute(&mut *tx)
      .await?;

    let select_sql = format!("SELECT {COLUMNS} FROM {sightings} WHERE ip = ? AND uuid = ?");
    let row = sqlx::query(&select_sql)
      .bind(ip)
      .bind(&uuid)
      .fetch_optional(&mut *tx)
      .await?
      .ok_or_else(|| DbError::RowVanished {
        player_id: uuid.clone(),
        ip: ip.to_string(),
      })?;
    let row = raw_row(&row)?;

    let queue_sql = format!(
      "INSERT INTO {queue} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)
       ON DUPLICATE KEY UPDATE
         count = VALUES(count),
         server = VALUES(server),
         updated = VALUES(updated)"
    );
    sqlx::query(&queue_sql)
      .bind(&uuid)
      .bind(ip)
      .bind(row.count)
      .bind(&row.server)
      .bind(row.created)
      .bind(row.updated)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;

    debug!(player_id = %player_id, ip, count = row.count, "upserted sighting");
    Ok(Sighting {
      player_id,
      ip: row.ip,
      count: row.count,
      server: row.server,
      created: row.created,
      updated: row.updated,
    })
  }

  async fn get_by_ip(&self, ip: &str) -> Result<HashSet<Sighting>> {
    let sql = format!("SELECT {COLUMNS} FROM {} WHERE ip = ?", self.tables.sightings);
    let rows = sqlx::query(&sql).bind(ip).fetch_all(&self.pool).await?;
    Ok(valid_only(raw_rows(&rows)?))
  }

  async fn get_by_player(&self, player_id: Uuid) -> Result<HashSet<Sighting>> {
    let sql = format!("SELECT {COLUMNS} FROM {} WHERE uuid = ?", self.tables.sightings);
    let rows = sqlx::query(&sql)
      .bind(player_id.to_string())
      .fetch_all(&self.pool)
      .await?;
    Ok(valid_only(raw_rows(&rows)?))
  }

  async fn delete(&self, key: &str) -> Result<u64> {
    let Tables { sightings, queue } = &self.tables;
    let mut tx = self.pool.begin().await?;

    let sql = format!("DELETE FROM {queue} WHERE ip = ? OR uuid = ?");
    sqlx::query(&sql).bind(key).bind(key).execute(&mut *tx).await?;

    let sql = format!("DELETE FROM {sightings} WHERE ip = ? OR uuid = ?");
    let deleted = sqlx::query(&sql)
      .bind(key)
      .bind(key)
      .execute(&mut *tx)
      .await?
      .rows_affected();

    tx.commit().await?;

    debug!(key, deleted, "deleted sightings");
    Ok(deleted)
  }

  async fn load_all(&self) -> Result<FetchResult> {
    let mut tx = self.pool.begin().await?;
    let result = fetch_checked(&mut tx, &self.tables.sightings, "id ASC").await?;
    tx.commit().await?;

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
    let queue = &self.tables.queue;
    let mut tx = self.pool.begin().await?;
    let result = fetch_checked(&mut tx, queue, "updated ASC, id ASC").await?;

    let sql = format!("DELETE FROM {queue} WHERE updated <= {NOW_MS} - ?");
    sqlx::query(&sql)
      .bind(self.queue_ttl.as_millis() as i64)
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;

    for corrupt in &result.corrupt {
      warn!(uuid = %corrupt.player_id, ip = %corrupt.ip, field = ?corrupt.field, "removed corrupt queue row");
    }
    Ok(result)
  }

  async fn current_time(&self) -> Result<i64> {
    let started = Instant::now();
    let sql = format!("SELECT {NOW_MS}");
    let now: i64 = sqlx::query(&sql).fetch_one(&self.pool).await?.try_get(0)?;
    Ok(corrected_time(now, started.elapsed()))
  }

  async fn dump(&self, after: i64, limit: usize) -> Result<DumpPage> {
    let sql = format!(
      "SELECT id, {COLUMNS} FROM {} WHERE id > ? ORDER BY id ASC LIMIT ?",
      self.tables.sightings
    );
    let rows = sqlx::query(&sql)
      .bind(after)
      .bind(limit as i64)
      .fetch_all(&self.pool)
      .await?;

    let mut page = Vec::with_capacity(rows.len());
    for row in &rows {
      page.push((row.try_get("id")?, raw_row(row)?));
    }
    Ok(dump_page(page, limit))
  }

  async fn load(&self, rows: Vec<Sighting>, truncate: bool) -> Result<()> {
    let Tables { sightings, queue } = &self.tables;
    let mut tx = self.pool.begin().await?;

    if truncate {
      sqlx::query(&format!("DELETE FROM {queue}"))
        .execute(&mut *tx)
        .await?;
      sqlx::query(&format!("DELETE FROM {sightings}"))
        .execute(&mut *tx)
        .await?;
    }

    let sql = format!(
      "INSERT INTO {sightings} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)
       ON DUPLICATE KEY UPDATE
         count = VALUES(count),
         server = VALUES(server),
         created = VALUES(created),
         updated = VALUES(updated)"
    );
    for row in &rows {
      sqlx::query(&sql)
        .bind(row.player_id.to_string())
        .bind(&row.ip)
        .bind(row.count)
        .bind(&row.server)
        .bind(row.created)
        .bind(row.updated)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    debug!(count = rows.len(), truncate, "loaded sightings");
    Ok(())
  }
}
