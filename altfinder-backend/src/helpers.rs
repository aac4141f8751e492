use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock in Unix millis, used only when the store clock is unreachable.
pub fn now_millis() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|elapsed| elapsed.as_millis() as i64)
    .unwrap_or_default()
}
