//! Shape checks applied to rows read back from storage.

use crate::models::{CorruptField, CorruptRow};
use std::net::IpAddr;
use uuid::Uuid;

/// Returns the canonical text form of an IP literal, or `None` if `ip` is not one.
pub fn normalize_ip(ip: &str) -> Option<String> {
  ip.trim().parse::<IpAddr>().ok().map(|addr| addr.to_string())
}

pub fn is_valid_ip(ip: &str) -> bool {
  ip.parse::<IpAddr>().is_ok()
}

/// Hyphenated 36-character UUID, the only form the store ever writes.
pub fn is_valid_uuid(id: &str) -> bool {
  id.len() == 36 && Uuid::parse_str(id).is_ok()
}

/// Classify a raw `(uuid, ip)` row; `Err` carries the corrupt-row report.
pub(crate) fn check_row(player_id: &str, ip: &str) -> Result<Uuid, CorruptRow> {
  let corrupt = |field| CorruptRow {
    player_id: player_id.to_string(),
    ip: ip.to_string(),
    field,
  };

  let id = match Uuid::parse_str(player_id) {
    Ok(id) if player_id.len() == 36 => id,
    _ => return Err(corrupt(CorruptField::PlayerId)),
  };
  if !is_valid_ip(ip) {
    return Err(corrupt(CorruptField::Ip));
  }

  Ok(id)
}
