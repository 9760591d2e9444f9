//! YAML configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Substitute `$NAME` and `${NAME}` with environment values. Unset
/// variables become empty; an unterminated `${` is kept verbatim.
fn expand_env_vars(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  let mut rest = input;

  while let Some(pos) = rest.find('$') {
    out.push_str(&rest[..pos]);
    let after = &rest[pos + 1..];

    if let Some(braced) = after.strip_prefix('{') {
      match braced.find('}') {
        Some(end) => {
          out.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
          rest = &braced[end + 1..];
        }
        None => {
          out.push_str(&rest[pos..]);
          rest = "";
        }
      }
      continue;
    }

    let name_len = after
      .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
      .unwrap_or(after.len());
    if name_len == 0 {
      out.push('$');
    } else {
      out.push_str(&std::env::var(&after[..name_len]).unwrap_or_default());
    }
    rest = &after[name_len..];
  }

  out.push_str(rest);
  out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
  #[default]
  Sqlite,
  Postgres,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendType,
  #[serde(default)]
  pub sqlite: SqliteSection,
  #[serde(default)]
  pub postgres: PostgresSection,
  #[serde(default)]
  pub pubsub: PubSubSection,
  #[serde(default)]
  pub reaper: ReaperSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSection {
  #[serde(default = "default_sqlite_path")]
  pub path: String,
  /// How long a writer waits on a locked database
  #[serde(default = "default_busy_timeout_ms")]
  pub busy_timeout_ms: u64,
}

fn default_sqlite_path() -> String {
  "rowcache.db".into()
}

fn default_busy_timeout_ms() -> u64 {
  5000
}

impl Default for SqliteSection {
  fn default() -> Self {
    Self {
      path: default_sqlite_path(),
      busy_timeout_ms: default_busy_timeout_ms(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresSection {
  #[serde(default = "default_pg_url")]
  pub url: String,
  #[serde(default = "default_max_conn")]
  pub max_connections: usize,
}

fn default_pg_url() -> String {
  "postgres://localhost/rowcache".into()
}

fn default_max_conn() -> usize {
  20
}

impl Default for PostgresSection {
  fn default() -> Self {
    Self {
      url: default_pg_url(),
      max_connections: default_max_conn(),
    }
  }
}

/// Subscription polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubSection {
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  /// Messages fetched per poll
  #[serde(default = "default_batch_size")]
  pub batch_size: i64,
  /// Capacity of each subscriber's delivery channel
  #[serde(default = "default_buffer")]
  pub buffer: usize,
}

fn default_poll_interval_ms() -> u64 {
  100
}

fn default_batch_size() -> i64 {
  10
}

fn default_buffer() -> usize {
  100
}

impl Default for PubSubSection {
  fn default() -> Self {
    Self {
      poll_interval_ms: default_poll_interval_ms(),
      batch_size: default_batch_size(),
      buffer: default_buffer(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperSection {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_initial_delay")]
  pub initial_delay_secs: u64,
  #[serde(default = "default_interval")]
  pub interval_secs: u64,
  /// Age after which messages are purged, 0 keeps them forever
  #[serde(default = "default_retention")]
  pub message_retention_secs: u64,
}

fn default_true() -> bool {
  true
}

fn default_initial_delay() -> u64 {
  300
}

fn default_interval() -> u64 {
  60
}

fn default_retention() -> u64 {
  3600
}

impl Default for ReaperSection {
  fn default() -> Self {
    Self {
      enabled: true,
      initial_delay_secs: default_initial_delay(),
      interval_secs: default_interval(),
      message_retention_secs: default_retention(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}

fn default_level() -> String {
  "info".into()
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl Config {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  /// Parse YAML after expanding environment variables.
  pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
    Ok(serde_yaml::from_str(&expand_env_vars(content))?)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["rowcache.yaml", "rowcache.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expand_env_vars() {
    std::env::set_var("ROWCACHE_TEST_HOST", "db.internal");
    assert_eq!(
      expand_env_vars("postgres://${ROWCACHE_TEST_HOST}/x"),
      "postgres://db.internal/x"
    );
    assert_eq!(expand_env_vars("$ROWCACHE_TEST_HOST:5432"), "db.internal:5432");
    assert_eq!(expand_env_vars("cost $5"), "cost ");
    assert_eq!(expand_env_vars("a $ b"), "a $ b");
    assert_eq!(expand_env_vars("${UNCLOSED"), "${UNCLOSED");
    assert_eq!(expand_env_vars("$ROWCACHE_TEST_UNSET_VAR!"), "!");
  }
}
