use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OpenFlags, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_rusqlite::Connection;

use crate::cache::client::{CacheClient, TxFn};
use crate::cache::entry::{
  expire_at, flatten_fields, never_expires, next_cursor, ttl_remaining, MapEntry, Message,
  SqlDialect, SubscriptionCursor, CURSOR_START,
};
use crate::cache::error::{CacheError, Result};
use crate::cache::pubsub::{self, MessageLog, Subscription};
use crate::cache::reaper::{spawn_reaper, ExpiryStore, ReaperHandle};
use crate::config::{PubSubSection, ReaperSection, SqliteSection};

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

// Timestamps are Unix milliseconds.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_kvs (
    cache_key TEXT PRIMARY KEY,
    cache_value BLOB NOT NULL,
    expire_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS idx_cache_kvs_expire_at ON cache_kvs(expire_at);

CREATE TABLE IF NOT EXISTS cache_maps (
    cache_key TEXT NOT NULL,
    cache_field TEXT NOT NULL,
    cache_value TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (cache_key, cache_field)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS cache_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_messages_channel ON cache_messages(channel, id);

CREATE TABLE IF NOT EXISTS cache_message_subscribes (
    channel TEXT NOT NULL,
    subscriber TEXT NOT NULL,
    last_message_id INTEGER NOT NULL DEFAULT -1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (channel, subscriber)
) WITHOUT ROWID;
"#;

fn millis(t: DateTime<Utc>) -> i64 {
  t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_else(never_expires)
}

// `:memory:` becomes a named shared-cache database so the dedicated
// transaction connection sees the same data.
fn database_uri(path: &str) -> String {
  if path == ":memory:" {
    format!(
      "file:rowcache-{}?mode=memory&cache=shared",
      uuid::Uuid::new_v4().simple()
    )
  } else {
    path.to_string()
  }
}

async fn open_connection(path: &str, busy_timeout: Duration) -> Result<Connection> {
  let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
    | OpenFlags::SQLITE_OPEN_CREATE
    | OpenFlags::SQLITE_OPEN_URI
    | OpenFlags::SQLITE_OPEN_NO_MUTEX;
  let conn = Connection::open_with_flags(path, flags).await?;
  conn
    .call(move |conn| {
      conn.busy_timeout(busy_timeout)?;
      conn.execute_batch(PRAGMAS).map_err(|e| e.into())
    })
    .await?;
  Ok(conn)
}

/// Connection handle shared with background pollers and the reaper.
#[derive(Clone)]
pub struct SqliteStore {
  conn: Connection,
}

#[async_trait]
impl MessageLog for SqliteStore {
  async fn attach(&self, channel: &str, subscriber: &str) -> Result<SubscriptionCursor> {
    let (channel, subscriber) = (channel.to_string(), subscriber.to_string());
    let now = millis(Utc::now());
    let cursor = self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO cache_message_subscribes (channel, subscriber, last_message_id, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?4)
           ON CONFLICT(channel, subscriber) DO NOTHING",
          params![channel, subscriber, CURSOR_START, now],
        )?;
        let last_delivered_id = conn.query_row(
          "SELECT last_message_id FROM cache_message_subscribes WHERE channel = ?1 AND subscriber = ?2",
          params![channel, subscriber],
          |row| row.get(0),
        )?;
        Ok(SubscriptionCursor {
          channel,
          subscriber,
          last_delivered_id,
        })
      })
      .await?;
    Ok(cursor)
  }

  async fn fetch_after(&self, channel: &str, after_id: i64, limit: i64) -> Result<Vec<Message>> {
    let channel = channel.to_string();
    let messages = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT id, channel, message, created_at FROM cache_messages
           WHERE channel = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![channel, after_id, limit], |row| {
          Ok(Message {
            id: row.get(0)?,
            channel: row.get(1)?,
            payload: row.get(2)?,
            created_at: from_millis(row.get(3)?),
          })
        })?;
        let mut messages = Vec::new();
        for row in rows {
          messages.push(row?);
        }
        Ok(messages)
      })
      .await?;
    Ok(messages)
  }

  async fn advance(&self, channel: &str, subscriber: &str, id: i64) -> Result<()> {
    let (channel, subscriber) = (channel.to_string(), subscriber.to_string());
    let now = millis(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE cache_message_subscribes SET last_message_id = ?3, updated_at = ?4
           WHERE channel = ?1 AND subscriber = ?2",
          params![channel, subscriber, id, now],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn detach(&self, channel: &str, subscriber: &str) -> Result<()> {
    let (channel, subscriber) = (channel.to_string(), subscriber.to_string());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM cache_message_subscribes WHERE channel = ?1 AND subscriber = ?2",
          params![channel, subscriber],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

#[async_trait]
impl ExpiryStore for SqliteStore {
  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
    let now = millis(now);
    let removed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute("DELETE FROM cache_kvs WHERE expire_at <= ?1", params![now])?)
      })
      .await?;
    Ok(removed as u64)
  }

  async fn purge_messages(&self, older_than: DateTime<Utc>) -> Result<u64> {
    let cutoff = millis(older_than);
    let removed = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM cache_messages WHERE created_at < ?1",
          params![cutoff],
        )?)
      })
      .await?;
    Ok(removed as u64)
  }
}

/// Cache backend on a SQLite file.
///
/// Transactions run on a dedicated connection opened with
/// `BEGIN IMMEDIATE`, so writers serialise on the database lock.
/// Transactions from one handle also queue on `tx_lock`; a shared-cache
/// in-memory database reports lock conflicts without waiting.
pub struct SqliteCache {
  store: SqliteStore,
  path: String,
  busy_timeout: Duration,
  tx_lock: Arc<tokio::sync::Mutex<()>>,
  pubsub: PubSubSection,
  in_tx: bool,
  reaper: Mutex<Option<ReaperHandle>>,
}

impl SqliteCache {
  pub async fn open(config: &SqliteSection, pubsub: &PubSubSection) -> Result<Self> {
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
    let path = database_uri(&config.path);
    let conn = open_connection(&path, busy_timeout).await?;
    conn
      .call(|conn| conn.execute_batch(SCHEMA).map_err(|e| e.into()))
      .await?;
    tracing::info!("SQLite cache schema initialized at {}", path);

    Ok(Self {
      store: SqliteStore { conn },
      path,
      busy_timeout,
      tx_lock: Arc::new(tokio::sync::Mutex::new(())),
      pubsub: pubsub.clone(),
      in_tx: false,
      reaper: Mutex::new(None),
    })
  }

  /// Handle for the reaper and other maintenance work.
  pub fn expiry_store(&self) -> Arc<dyn ExpiryStore> {
    Arc::new(self.store.clone())
  }

  /// Start the background reaper. It stops on [`CacheClient::close`].
  pub fn start_reaper(&self, config: &ReaperSection) {
    // Replacing a handle drops its stop sender, which ends the old loop.
    *self.reaper.lock() = Some(spawn_reaper(self.expiry_store(), config));
  }

  fn conn(&self) -> &Connection {
    &self.store.conn
  }
}

#[async_trait]
impl CacheClient for SqliteCache {
  async fn close(&self) -> Result<()> {
    let handle = self.reaper.lock().take();
    if let Some(handle) = handle {
      handle.shutdown().await;
      tracing::info!("SQLite cache reaper stopped");
    }
    Ok(())
  }

  async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
    let (key, value) = (key.to_string(), value.to_vec());
    let now = Utc::now();
    let (expire, now) = (millis(expire_at(now, ttl)), millis(now));
    self
      .conn()
      .call(move |conn| {
        conn.execute(
          "INSERT INTO cache_kvs (cache_key, cache_value, expire_at, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?4)
           ON CONFLICT(cache_key) DO UPDATE SET
             cache_value = excluded.cache_value,
             expire_at = excluded.expire_at,
             updated_at = excluded.updated_at",
          params![key, value, expire, now],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
    let key = key.to_string();
    let now = millis(Utc::now());
    self
      .conn()
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT cache_value FROM cache_kvs WHERE cache_key = ?1 AND expire_at > ?2",
              params![key, now],
              |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?,
        )
      })
      .await?
      .ok_or(CacheError::NotFound)
  }

  async fn delete(&self, key: &str) -> Result<i64> {
    let key = key.to_string();
    let now = millis(Utc::now());
    let removed = self
      .conn()
      .call(move |conn| {
        let mut stmt =
          conn.prepare_cached("DELETE FROM cache_kvs WHERE cache_key = ?1 RETURNING expire_at")?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, i64>(0))?;
        let mut live = 0i64;
        for expire in rows {
          if expire? > now {
            live += 1;
          }
        }
        Ok(live)
      })
      .await?;
    Ok(removed)
  }

  async fn count(&self, keys: &[&str]) -> Result<i64> {
    let now = millis(Utc::now());
    let unique: BTreeSet<String> = keys.iter().map(|k| k.to_string()).collect();

    let total = self
      .conn()
      .call(move |conn| {
        if unique.is_empty() {
          return Ok(conn.query_row(
            "SELECT COUNT(*) FROM cache_kvs WHERE expire_at > ?1",
            params![now],
            |row| row.get::<_, i64>(0),
          )?);
        }

        let placeholders = (0..unique.len())
          .map(|i| format!("?{}", i + 2))
          .collect::<Vec<_>>()
          .join(", ");
        let sql = format!(
          "SELECT COUNT(*) FROM cache_kvs WHERE expire_at > ?1 AND cache_key IN ({})",
          placeholders
        );
        let mut values = vec![Value::Integer(now)];
        values.extend(unique.into_iter().map(Value::Text));
        Ok(conn.query_row(&sql, params_from_iter(values), |row| {
          row.get::<_, i64>(0)
        })?)
      })
      .await?;
    Ok(total)
  }

  async fn set_map_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
    let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
    let now = millis(Utc::now());
    self
      .conn()
      .call(move |conn| {
        conn.execute(
          "INSERT INTO cache_maps (cache_key, cache_field, cache_value, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?4)
           ON CONFLICT(cache_key, cache_field) DO UPDATE SET
             cache_value = excluded.cache_value,
             updated_at = excluded.updated_at",
          params![key, field, value, now],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_map_field(&self, key: &str, field: &str) -> Result<String> {
    let (key, field) = (key.to_string(), field.to_string());
    self
      .conn()
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT cache_value FROM cache_maps WHERE cache_key = ?1 AND cache_field = ?2",
              params![key, field],
              |row| row.get::<_, String>(0),
            )
            .optional()?,
        )
      })
      .await?
      .ok_or(CacheError::NotFound)
  }

  async fn delete_map_field(&self, key: &str, field: &str) -> Result<i64> {
    let (key, field) = (key.to_string(), field.to_string());
    let removed = self
      .conn()
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM cache_maps WHERE cache_key = ?1 AND cache_field = ?2",
          params![key, field],
        )?)
      })
      .await?;
    Ok(removed as i64)
  }

  async fn get_map(&self, key: &str) -> Result<HashMap<String, String>> {
    let key = key.to_string();
    let map = self
      .conn()
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          "SELECT cache_field, cache_value FROM cache_maps WHERE cache_key = ?1",
        )?;
        let rows = stmt.query_map(params![key], |row| {
          Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = HashMap::new();
        for row in rows {
          let (field, value) = row?;
          map.insert(field, value);
        }
        Ok(map)
      })
      .await?;

    if map.is_empty() {
      return Err(CacheError::NotFound);
    }
    Ok(map)
  }

  async fn scan_map_stream(
    &self,
    key: &str,
    cursor: u64,
    pattern: &str,
    count: i64,
  ) -> Result<(Vec<String>, u64)> {
    if count < 1 {
      return Err(CacheError::validation("scan count must be at least 1"));
    }
    let dialect = SqlDialect::Sqlite;
    let glob = if pattern.is_empty() { "*" } else { pattern };
    let pattern = dialect.pattern(glob);
    let sql = format!(
      "SELECT cache_key, cache_field, cache_value FROM cache_maps
       WHERE cache_key = ?1 AND {}
       ORDER BY cache_field LIMIT ?3 OFFSET ?4",
      dialect.match_clause("cache_field", "?2")
    );
    let key = key.to_string();
    let offset = i64::try_from(cursor)
      .map_err(|_| CacheError::validation(format!("scan cursor {} out of range", cursor)))?;

    let entries = self
      .conn()
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![key, pattern, count, offset], |row| {
          Ok(MapEntry {
            key: row.get(0)?,
            field: row.get(1)?,
            value: row.get(2)?,
          })
        })?;
        let mut entries = Vec::new();
        for row in rows {
          entries.push(row?);
        }
        Ok(entries)
      })
      .await?;

    let next = next_cursor(cursor, entries.len(), count);
    Ok((flatten_fields(entries), next))
  }

  async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
    let (key, value) = (key.to_string(), value.to_vec());
    let now = Utc::now();
    let (expire, now) = (millis(expire_at(now, ttl)), millis(now));
    // An expired row that the reaper has not removed yet counts as absent.
    let written = self
      .conn()
      .call(move |conn| {
        Ok(conn.execute(
          "INSERT INTO cache_kvs (cache_key, cache_value, expire_at, created_at, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?4)
           ON CONFLICT(cache_key) DO UPDATE SET
             cache_value = excluded.cache_value,
             expire_at = excluded.expire_at,
             created_at = excluded.created_at,
             updated_at = excluded.updated_at
           WHERE cache_kvs.expire_at <= excluded.created_at",
          params![key, value, expire, now],
        )?)
      })
      .await?;
    Ok(written == 1)
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
    let key = key.to_string();
    let now = Utc::now();
    let (expire, now) = (millis(expire_at(now, ttl)), millis(now));
    let updated = self
      .conn()
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE cache_kvs SET expire_at = ?2, updated_at = ?3
           WHERE cache_key = ?1 AND expire_at > ?3",
          params![key, expire, now],
        )?)
      })
      .await?;
    Ok(updated == 1)
  }

  async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
    let key = key.to_string();
    let now = Utc::now();
    let now_ms = millis(now);
    let expire = self
      .conn()
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT expire_at FROM cache_kvs WHERE cache_key = ?1 AND expire_at > ?2",
              params![key, now_ms],
              |row| row.get::<_, i64>(0),
            )
            .optional()?,
        )
      })
      .await?
      .ok_or(CacheError::NotFound)?;
    Ok(ttl_remaining(now, from_millis(expire)))
  }

  async fn transaction(&self, f: TxFn) -> Result<()> {
    if self.in_tx {
      return Err(CacheError::validation("nested transactions are not supported"));
    }
    let _queued = self.tx_lock.lock().await;

    let conn = open_connection(&self.path, self.busy_timeout).await?;
    conn
      .call(|conn| conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| e.into()))
      .await?;

    let scoped = SqliteCache {
      store: SqliteStore { conn: conn.clone() },
      path: self.path.clone(),
      busy_timeout: self.busy_timeout,
      tx_lock: self.tx_lock.clone(),
      pubsub: self.pubsub.clone(),
      in_tx: true,
      reaper: Mutex::new(None),
    };
    let result = f(&scoped).await;

    let end = if result.is_ok() { "COMMIT" } else { "ROLLBACK" };
    let finished = conn
      .call(move |conn| conn.execute_batch(end).map_err(|e| e.into()))
      .await;
    if let Err(e) = &finished {
      tracing::warn!("SQLite {} failed: {}", end, e);
    }
    result?;
    finished?;
    Ok(())
  }

  async fn publish(&self, channel: &str, message: &str) -> Result<()> {
    let (channel, message) = (channel.to_string(), message.to_string());
    let now = millis(Utc::now());
    self
      .conn()
      .call(move |conn| {
        conn.execute(
          "INSERT INTO cache_messages (channel, message, created_at) VALUES (?1, ?2, ?3)",
          params![channel, message, now],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn subscribe_as(&self, channel: &str, subscriber: &str) -> Result<Subscription> {
    if self.in_tx {
      return Err(CacheError::validation(
        "cannot subscribe inside a transaction",
      ));
    }
    pubsub::subscribe(
      Arc::new(self.store.clone()),
      channel,
      subscriber,
      &self.pubsub,
    )
    .await
  }
}
