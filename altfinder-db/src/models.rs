use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// One recorded (player, IP) login pairing.
///
/// Identity is the `(player_id, ip)` pair: two sightings of the same pairing
/// compare equal even when their counters or timestamps have drifted apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sighting {
  /// Player UUID
  #[serde(rename = "uuid")]
  pub player_id: Uuid,
  /// Normalized IP literal
  pub ip: String,
  /// Number of logins seen for this exact pairing
  pub count: i64,
  /// Server that most recently saw this pairing
  pub server: String,
  /// Unix millis of the first sighting (store clock)
  pub created: i64,
  /// Unix millis of the latest sighting (store clock)
  pub updated: i64,
}

impl PartialEq for Sighting {
  fn eq(&self, other: &Self) -> bool {
    self.player_id == other.player_id && self.ip == other.ip
  }
}

impl Eq for Sighting {}

impl Hash for Sighting {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.player_id.hash(state);
    self.ip.hash(state);
  }
}

/// Which column of a stored row failed shape validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptField {
  PlayerId,
  Ip,
}

/// A row that failed validation on load or drain and was deleted from the store.
///
/// Values are kept raw so caches can evict whatever keys they derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRow {
  pub player_id: String,
  pub ip: String,
  pub field: CorruptField,
}

impl CorruptRow {
  /// The key that was rejected (the raw player id or the raw ip).
  pub fn offending_key(&self) -> &str {
    match self.field {
      CorruptField::PlayerId => &self.player_id,
      CorruptField::Ip => &self.ip,
    }
  }
}

/// Result of a full scan or a queue drain.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
  /// Valid sightings, in the order they were read
  pub sightings: Vec<Sighting>,
  /// Rows that were removed because they failed validation
  pub corrupt: Vec<CorruptRow>,
}

/// One page of a sightings dump.
#[derive(Debug, Clone, Default)]
pub struct DumpPage {
  pub rows: Vec<Sighting>,
  /// Cursor for the following page, `None` once the table is exhausted
  pub next: Option<i64>,
}

/// A sightings or queue row exactly as the database returned it.
#[derive(Debug, Clone)]
pub(crate) struct RawRow {
  pub player_id: String,
  pub ip: String,
  pub count: i64,
  pub server: String,
  pub created: i64,
  pub updated: i64,
}

impl RawRow {
  pub(crate) fn into_sighting(self) -> Result<Sighting, CorruptRow> {
    let player_id = crate::validation::check_row(&self.player_id, &self.ip)?;
    Ok(Sighting {
      player_id,
      ip: self.ip,
      count: self.count,
      server: self.server,
      created: self.created,
      updated: self.updated,
    })
  }
}

/// Split raw rows into valid sightings and corrupt reports, preserving order.
pub(crate) fn partition_rows(rows: Vec<RawRow>) -> FetchResult {
  let mut result = FetchResult::default();
  for row in rows {
    match row.into_sighting() {
      Ok(sighting) => result.sightings.push(sighting),
      Err(corrupt) => result.corrupt.push(corrupt),
    }
  }
  result
}
