//! Cache record types and expiry helpers

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One field of a logical hash map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
  pub key: String,
  pub field: String,
  pub value: String,
}

/// A published message. Ids increase monotonically per store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
  pub id: i64,
  pub channel: String,
  pub payload: String,
  pub created_at: DateTime<Utc>,
}

/// Per-subscriber delivery cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCursor {
  pub channel: String,
  pub subscriber: String,
  /// Last delivered message id, -1 before the first delivery
  pub last_delivered_id: i64,
}

/// Cursor value of a freshly attached subscriber
pub const CURSOR_START: i64 = -1;

/// Expiry stored for keys written with a zero TTL.
pub fn never_expires() -> DateTime<Utc> {
  Utc
    .with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
    .single()
    .map(|t| t + chrono::Duration::milliseconds(999))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Compute the stored expiry for a TTL relative to `now`.
/// Zero means the entry never expires; oversized TTLs saturate.
pub fn expire_at(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
  let never = never_expires();
  if ttl.is_zero() {
    return never;
  }
  chrono::Duration::from_std(ttl)
    .ok()
    .and_then(|d| now.checked_add_signed(d))
    .map(|t| t.min(never))
    .unwrap_or(never)
}

/// Remaining time to live, `None` for entries that never expire.
pub fn ttl_remaining(now: DateTime<Utc>, expire_at: DateTime<Utc>) -> Option<Duration> {
  if expire_at >= never_expires() {
    return None;
  }
  Some((expire_at - now).to_std().unwrap_or(Duration::ZERO))
}

/// TTL to write back when a value is replaced but its expiry must survive.
pub fn retained_ttl(remaining: Option<Duration>) -> Duration {
  match remaining {
    // A live key whose remaining TTL rounds to zero still expires.
    Some(d) if d.is_zero() => Duration::from_millis(1),
    Some(d) => d,
    None => Duration::ZERO,
  }
}

/// Flatten map fields into the `[field, value, field, value, ...]` scan shape.
pub fn flatten_fields(entries: Vec<MapEntry>) -> Vec<String> {
  let mut out = Vec::with_capacity(entries.len() * 2);
  for entry in entries {
    out.push(entry.field);
    out.push(entry.value);
  }
  out
}

/// Cursor to return after reading `rows` entries at `cursor` with page size `count`.
/// A short page ends the scan with cursor 0.
pub fn next_cursor(cursor: u64, rows: usize, count: i64) -> u64 {
  if (rows as i64) < count {
    0
  } else {
    cursor + rows as u64
  }
}

/// SQL dialect of the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
  Postgres,
  Sqlite,
}

impl SqlDialect {
  /// Predicate matching `column` against a glob pattern bound at `placeholder`.
  pub fn match_clause(&self, column: &str, placeholder: &str) -> String {
    match self {
      Self::Postgres => format!("{} LIKE {} ESCAPE '\\'", column, placeholder),
      Self::Sqlite => format!("{} GLOB {}", column, placeholder),
    }
  }

  /// Translate a glob pattern into the value bound for `match_clause`.
  pub fn pattern(&self, glob: &str) -> String {
    match self {
      Self::Postgres => glob_to_like(glob),
      Self::Sqlite => glob_to_sqlite(glob),
    }
  }
}

/// Keep only `*` and `?` special for SQLite `GLOB`; `[` matches itself.
pub fn glob_to_sqlite(pattern: &str) -> String {
  pattern.replace('[', "[[]")
}

/// Convert a glob pattern (`*`, `?`) to a LIKE pattern escaped with `\`.
pub fn glob_to_like(pattern: &str) -> String {
  let mut out = String::with_capacity(pattern.len() + 8);
  for c in pattern.chars() {
    match c {
      '*' => out.push('%'),
      '?' => out.push('_'),
      '%' | '_' | '\\' => {
        out.push('\\');
        out.push(c);
      }
      _ => out.push(c),
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_zero_ttl_never_expires() {
    let now = Utc::now();
    assert_eq!(expire_at(now, Duration::ZERO), never_expires());
    assert_eq!(ttl_remaining(now, never_expires()), None);
  }

  #[test]
  fn test_expire_at_adds_ttl() {
    let now = Utc::now();
    let at = expire_at(now, Duration::from_secs(10));
    assert_eq!((at - now).num_seconds(), 10);
    assert_eq!(ttl_remaining(now, at), Some(Duration::from_secs(10)));
  }

  #[test]
  fn test_huge_ttl_saturates() {
    let now = Utc::now();
    assert_eq!(expire_at(now, Duration::MAX), never_expires());
  }

  #[test]
  fn test_ttl_remaining_past_is_zero() {
    let now = Utc::now();
    let past = now - chrono::Duration::seconds(5);
    assert_eq!(ttl_remaining(now, past), Some(Duration::ZERO));
  }

  #[test]
  fn test_retained_ttl() {
    assert_eq!(retained_ttl(None), Duration::ZERO);
    assert_eq!(retained_ttl(Some(Duration::ZERO)), Duration::from_millis(1));
    assert_eq!(
      retained_ttl(Some(Duration::from_secs(3))),
      Duration::from_secs(3)
    );
  }

  #[test]
  fn test_next_cursor() {
    assert_eq!(next_cursor(0, 10, 10), 10);
    assert_eq!(next_cursor(10, 3, 10), 0);
    assert_eq!(next_cursor(20, 0, 10), 0);
  }

  #[test]
  fn test_flatten_fields() {
    let entries = vec![
      MapEntry {
        key: "h".into(),
        field: "a".into(),
        value: "1".into(),
      },
      MapEntry {
        key: "h".into(),
        field: "b".into(),
        value: "2".into(),
      },
    ];
    assert_eq!(flatten_fields(entries), vec!["a", "1", "b", "2"]);
  }

  #[test]
  fn test_glob_to_like() {
    assert_eq!(glob_to_like("user:*"), "user:%");
    assert_eq!(glob_to_like("f?o"), "f_o");
    assert_eq!(glob_to_like("100%_done*"), "100\\%\\_done%");
    assert_eq!(glob_to_like("a\\b"), "a\\\\b");
  }

  #[test]
  fn test_dialect_match_clause() {
    assert_eq!(
      SqlDialect::Postgres.match_clause("cache_field", "$2"),
      "cache_field LIKE $2 ESCAPE '\\'"
    );
    assert_eq!(
      SqlDialect::Sqlite.match_clause("cache_field", "?2"),
      "cache_field GLOB ?2"
    );
    assert_eq!(SqlDialect::Sqlite.pattern("a*"), "a*");
    assert_eq!(SqlDialect::Sqlite.pattern("a[1]*"), "a[[]1]*");
    assert_eq!(SqlDialect::Postgres.pattern("a[1]*"), "a[1]%");
    assert_eq!(SqlDialect::Postgres.pattern("a*"), "a%");
  }
}
