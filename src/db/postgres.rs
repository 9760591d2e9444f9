use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::{GenericClient, IsolationLevel, NoTls};

use crate::cache::client::{CacheClient, TxFn};
use crate::cache::entry::{
  expire_at, flatten_fields, next_cursor, ttl_remaining, MapEntry, Message, SqlDialect,
  SubscriptionCursor, CURSOR_START,
};
use crate::cache::error::{CacheError, Result};
use crate::cache::pubsub::{self, MessageLog, Subscription};
use crate::cache::reaper::{spawn_reaper, ExpiryStore, ReaperHandle};
use crate::config::{PostgresSection, PubSubSection, ReaperSection};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_kvs (
    cache_key TEXT PRIMARY KEY,
    cache_value BYTEA NOT NULL,
    expire_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_cache_kvs_expire_at ON cache_kvs(expire_at);

CREATE TABLE IF NOT EXISTS cache_maps (
    cache_key TEXT NOT NULL,
    cache_field TEXT NOT NULL,
    cache_value TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (cache_key, cache_field)
);

CREATE TABLE IF NOT EXISTS cache_messages (
    id BIGSERIAL PRIMARY KEY,
    channel TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_cache_messages_channel ON cache_messages(channel, id);

CREATE TABLE IF NOT EXISTS cache_message_subscribes (
    channel TEXT NOT NULL,
    subscriber TEXT NOT NULL,
    last_message_id BIGINT NOT NULL DEFAULT -1,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (channel, subscriber)
);
"#;

/// Statements shared by pooled clients and open transactions.
mod ops {
  use super::*;

  pub async fn set<C: GenericClient + Sync>(
    c: &C,
    key: &str,
    value: &[u8],
    ttl: Duration,
  ) -> Result<()> {
    let now = Utc::now();
    c.execute(
      "INSERT INTO cache_kvs (cache_key, cache_value, expire_at, created_at, updated_at)
       VALUES ($1, $2, $3, $4, $4)
       ON CONFLICT (cache_key) DO UPDATE SET
         cache_value = EXCLUDED.cache_value,
         expire_at = EXCLUDED.expire_at,
         updated_at = EXCLUDED.updated_at",
      &[&key, &value, &expire_at(now, ttl), &now],
    )
    .await?;
    Ok(())
  }

  pub async fn get_bytes<C: GenericClient + Sync>(c: &C, key: &str) -> Result<Vec<u8>> {
    let row = c
      .query_opt(
        "SELECT cache_value FROM cache_kvs WHERE cache_key = $1 AND expire_at > $2",
        &[&key, &Utc::now()],
      )
      .await?
      .ok_or(CacheError::NotFound)?;
    Ok(row.get(0))
  }

  pub async fn delete<C: GenericClient + Sync>(c: &C, key: &str) -> Result<i64> {
    let now = Utc::now();
    let rows = c
      .query(
        "DELETE FROM cache_kvs WHERE cache_key = $1 RETURNING expire_at",
        &[&key],
      )
      .await?;
    Ok(
      rows
        .iter()
        .filter(|row| row.get::<_, DateTime<Utc>>(0) > now)
        .count() as i64,
    )
  }

  pub async fn count<C: GenericClient + Sync>(c: &C, keys: &[&str]) -> Result<i64> {
    let now = Utc::now();
    let row = if keys.is_empty() {
      c.query_one(
        "SELECT COUNT(*) FROM cache_kvs WHERE expire_at > $1",
        &[&now],
      )
      .await?
    } else {
      let unique: Vec<String> = keys
        .iter()
        .map(|k| k.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
      c.query_one(
        "SELECT COUNT(*) FROM cache_kvs WHERE expire_at > $1 AND cache_key = ANY($2)",
        &[&now, &unique],
      )
      .await?
    };
    Ok(row.get(0))
  }

  pub async fn set_map_field<C: GenericClient + Sync>(
    c: &C,
    key: &str,
    field: &str,
    value: &str,
  ) -> Result<()> {
    c.execute(
      "INSERT INTO cache_maps (cache_key, cache_field, cache_value, created_at, updated_at)
       VALUES ($1, $2, $3, $4, $4)
       ON CONFLICT (cache_key, cache_field) DO UPDATE SET
         cache_value = EXCLUDED.cache_value,
         updated_at = EXCLUDED.updated_at",
      &[&key, &field, &value, &Utc::now()],
    )
    .await?;
    Ok(())
  }

  pub async fn get_map_field<C: GenericClient + Sync>(
    c: &C,
    key: &str,
    field: &str,
  ) -> Result<String> {
    let row = c
      .query_opt(
        "SELECT cache_value FROM cache_maps WHERE cache_key = $1 AND cache_field = $2",
        &[&key, &field],
      )
      .await?
      .ok_or(CacheError::NotFound)?;
    Ok(row.get(0))
  }

  pub async fn delete_map_field<C: GenericClient + Sync>(
    c: &C,
    key: &str,
    field: &str,
  ) -> Result<i64> {
    let removed = c
      .execute(
        "DELETE FROM cache_maps WHERE cache_key = $1 AND cache_field = $2",
        &[&key, &field],
      )
      .await?;
    Ok(removed as i64)
  }

  pub async fn get_map<C: GenericClient + Sync>(
    c: &C,
    key: &str,
  ) -> Result<HashMap<String, String>> {
    let rows = c
      .query(
        "SELECT cache_field, cache_value FROM cache_maps WHERE cache_key = $1",
        &[&key],
      )
      .await?;
    if rows.is_empty() {
      return Err(CacheError::NotFound);
    }
    Ok(rows.iter().map(|row| (row.get(0), row.get(1))).collect())
  }

  pub async fn scan_map_stream<C: GenericClient + Sync>(
    c: &C,
    key: &str,
    cursor: u64,
    pattern: &str,
    count: i64,
  ) -> Result<(Vec<String>, u64)> {
    if count < 1 {
      return Err(CacheError::validation("scan count must be at least 1"));
    }
    let dialect = SqlDialect::Postgres;
    let pattern = dialect.pattern(if pattern.is_empty() { "*" } else { pattern });
    let offset = i64::try_from(cursor)
      .map_err(|_| CacheError::validation(format!("scan cursor {} out of range", cursor)))?;
    let sql = format!(
      "SELECT cache_key, cache_field, cache_value FROM cache_maps
       WHERE cache_key = $1 AND {}
       ORDER BY cache_field LIMIT $3 OFFSET $4",
      dialect.match_clause("cache_field", "$2")
    );

    let rows = c.query(sql.as_str(), &[&key, &pattern, &count, &offset]).await?;
    let entries: Vec<MapEntry> = rows
      .iter()
      .map(|row| MapEntry {
        key: row.get(0),
        field: row.get(1),
        value: row.get(2),
      })
      .collect();
    let next = next_cursor(cursor, entries.len(), count);
    Ok((flatten_fields(entries), next))
  }

  pub async fn set_nx<C: GenericClient + Sync>(
    c: &C,
    key: &str,
    value: &[u8],
    ttl: Duration,
  ) -> Result<bool> {
    let now = Utc::now();
    let written = c
      .execute(
        "INSERT INTO cache_kvs (cache_key, cache_value, expire_at, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $4)
         ON CONFLICT (cache_key) DO UPDATE SET
           cache_value = EXCLUDED.cache_value,
           expire_at = EXCLUDED.expire_at,
           created_at = EXCLUDED.created_at,
           updated_at = EXCLUDED.updated_at
         WHERE cache_kvs.expire_at <= EXCLUDED.created_at",
        &[&key, &value, &expire_at(now, ttl), &now],
      )
      .await?;
    Ok(written == 1)
  }

  pub async fn expire<C: GenericClient + Sync>(c: &C, key: &str, ttl: Duration) -> Result<bool> {
    let now = Utc::now();
    let updated = c
      .execute(
        "UPDATE cache_kvs SET expire_at = $2, updated_at = $3
         WHERE cache_key = $1 AND expire_at > $3",
        &[&key, &expire_at(now, ttl), &now],
      )
      .await?;
    Ok(updated == 1)
  }

  pub async fn ttl<C: GenericClient + Sync>(c: &C, key: &str) -> Result<Option<Duration>> {
    let now = Utc::now();
    let row = c
      .query_opt(
        "SELECT expire_at FROM cache_kvs WHERE cache_key = $1 AND expire_at > $2",
        &[&key, &now],
      )
      .await?
      .ok_or(CacheError::NotFound)?;
    Ok(ttl_remaining(now, row.get(0)))
  }

  pub async fn publish<C: GenericClient + Sync>(c: &C, channel: &str, message: &str) -> Result<()> {
    c.execute(
      "INSERT INTO cache_messages (channel, message, created_at) VALUES ($1, $2, $3)",
      &[&channel, &message, &Utc::now()],
    )
    .await?;
    Ok(())
  }
}

/// Pool handle shared with background pollers and the reaper.
#[derive(Clone)]
pub struct PostgresStore {
  pool: Pool,
}

#[async_trait]
impl MessageLog for PostgresStore {
  async fn attach(&self, channel: &str, subscriber: &str) -> Result<SubscriptionCursor> {
    let client = self.pool.get().await?;
    client
      .execute(
        "INSERT INTO cache_message_subscribes (channel, subscriber, last_message_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (channel, subscriber) DO NOTHING",
        &[&channel, &subscriber, &CURSOR_START],
      )
      .await?;
    let row = client
      .query_one(
        "SELECT last_message_id FROM cache_message_subscribes WHERE channel = $1 AND subscriber = $2",
        &[&channel, &subscriber],
      )
      .await?;
    Ok(SubscriptionCursor {
      channel: channel.to_string(),
      subscriber: subscriber.to_string(),
      last_delivered_id: row.get(0),
    })
  }

  async fn fetch_after(&self, channel: &str, after_id: i64, limit: i64) -> Result<Vec<Message>> {
    let rows = self
      .pool
      .get()
      .await?
      .query(
        "SELECT id, channel, message, created_at FROM cache_messages
         WHERE channel = $1 AND id > $2 ORDER BY id LIMIT $3",
        &[&channel, &after_id, &limit],
      )
      .await?;
    Ok(
      rows
        .iter()
        .map(|row| Message {
          id: row.get(0),
          channel: row.get(1),
          payload: row.get(2),
          created_at: row.get(3),
        })
        .collect(),
    )
  }

  async fn advance(&self, channel: &str, subscriber: &str, id: i64) -> Result<()> {
    self
      .pool
      .get()
      .await?
      .execute(
        "UPDATE cache_message_subscribes SET last_message_id = $3, updated_at = NOW()
         WHERE channel = $1 AND subscriber = $2",
        &[&channel, &subscriber, &id],
      )
      .await?;
    Ok(())
  }

  async fn detach(&self, channel: &str, subscriber: &str) -> Result<()> {
    self
      .pool
      .get()
      .await?
      .execute(
        "DELETE FROM cache_message_subscribes WHERE channel = $1 AND subscriber = $2",
        &[&channel, &subscriber],
      )
      .await?;
    Ok(())
  }
}

#[async_trait]
impl ExpiryStore for PostgresStore {
  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
    Ok(
      self
        .pool
        .get()
        .await?
        .execute("DELETE FROM cache_kvs WHERE expire_at <= $1", &[&now])
        .await?,
    )
  }

  async fn purge_messages(&self, older_than: DateTime<Utc>) -> Result<u64> {
    Ok(
      self
        .pool
        .get()
        .await?
        .execute(
          "DELETE FROM cache_messages WHERE created_at < $1",
          &[&older_than],
        )
        .await?,
    )
  }
}

/// Cache backend on a PostgreSQL connection pool.
pub struct PostgresCache {
  store: PostgresStore,
  pubsub: PubSubSection,
  reaper: Mutex<Option<ReaperHandle>>,
}

impl PostgresCache {
  pub async fn connect(config: &PostgresSection, pubsub: &PubSubSection) -> Result<Self> {
    let mut cfg = Config::new();
    cfg.url = Some(config.url.clone());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(config.max_connections.max(1)));
    let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

    pool.get().await?.batch_execute(SCHEMA).await?;
    tracing::info!("PostgreSQL cache schema initialized");

    Ok(Self {
      store: PostgresStore { pool },
      pubsub: pubsub.clone(),
      reaper: Mutex::new(None),
    })
  }

  pub fn expiry_store(&self) -> Arc<dyn ExpiryStore> {
    Arc::new(self.store.clone())
  }

  /// Start the background reaper. It stops on [`CacheClient::close`].
  pub fn start_reaper(&self, config: &ReaperSection) {
    *self.reaper.lock() = Some(spawn_reaper(self.expiry_store(), config));
  }

  async fn client(&self) -> Result<deadpool_postgres::Object> {
    Ok(self.store.pool.get().await?)
  }
}

#[async_trait]
impl CacheClient for PostgresCache {
  async fn close(&self) -> Result<()> {
    let handle = self.reaper.lock().take();
    if let Some(handle) = handle {
      handle.shutdown().await;
      tracing::info!("PostgreSQL cache reaper stopped");
    }
    self.store.pool.close();
    Ok(())
  }

  async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
    let client = self.client().await?;
    ops::set(&**client, key, value, ttl).await
  }

  async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
    let client = self.client().await?;
    ops::get_bytes(&**client, key).await
  }

  async fn delete(&self, key: &str) -> Result<i64> {
    let client = self.client().await?;
    ops::delete(&**client, key).await
  }

  async fn count(&self, keys: &[&str]) -> Result<i64> {
    let client = self.client().await?;
    ops::count(&**client, keys).await
  }

  async fn set_map_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
    let client = self.client().await?;
    ops::set_map_field(&**client, key, field, value).await
  }

  async fn get_map_field(&self, key: &str, field: &str) -> Result<String> {
    let client = self.client().await?;
    ops::get_map_field(&**client, key, field).await
  }

  async fn delete_map_field(&self, key: &str, field: &str) -> Result<i64> {
    let client = self.client().await?;
    ops::delete_map_field(&**client, key, field).await
  }

  async fn get_map(&self, key: &str) -> Result<HashMap<String, String>> {
    let client = self.client().await?;
    ops::get_map(&**client, key).await
  }

  async fn scan_map_stream(
    &self,
    key: &str,
    cursor: u64,
    pattern: &str,
    count: i64,
  ) -> Result<(Vec<String>, u64)> {
    let client = self.client().await?;
    ops::scan_map_stream(&**client, key, cursor, pattern, count).await
  }

  async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
    let client = self.client().await?;
    ops::set_nx(&**client, key, value, ttl).await
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
    let client = self.client().await?;
    ops::expire(&**client, key, ttl).await
  }

  async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
    let client = self.client().await?;
    ops::ttl(&**client, key).await
  }

  async fn transaction(&self, f: TxFn) -> Result<()> {
    let mut client = self.client().await?;
    let pg: &mut tokio_postgres::Client = &mut client;
    let tx = pg
      .build_transaction()
      .isolation_level(IsolationLevel::ReadCommitted)
      .start()
      .await?;

    let scoped = PostgresTx { tx };
    let result = f(&scoped).await;
    match result {
      Ok(()) => {
        scoped.tx.commit().await?;
        Ok(())
      }
      Err(e) => {
        if let Err(rollback) = scoped.tx.rollback().await {
          tracing::warn!("PostgreSQL rollback failed: {}", rollback);
        }
        Err(e)
      }
    }
  }

  async fn publish(&self, channel: &str, message: &str) -> Result<()> {
    let client = self.client().await?;
    ops::publish(&**client, channel, message).await
  }

  async fn subscribe_as(&self, channel: &str, subscriber: &str) -> Result<Subscription> {
    pubsub::subscribe(
      Arc::new(self.store.clone()),
      channel,
      subscriber,
      &self.pubsub,
    )
    .await
  }
}

/// Handle passed to transaction bodies. Every call runs on the open transaction.
pub struct PostgresTx<'c> {
  tx: tokio_postgres::Transaction<'c>,
}

#[async_trait]
impl<'c> CacheClient for PostgresTx<'c> {
  async fn close(&self) -> Result<()> {
    Ok(())
  }

  async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
    ops::set(&self.tx, key, value, ttl).await
  }

  async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
    ops::get_bytes(&self.tx, key).await
  }

  async fn delete(&self, key: &str) -> Result<i64> {
    ops::delete(&self.tx, key).await
  }

  async fn count(&self, keys: &[&str]) -> Result<i64> {
    ops::count(&self.tx, keys).await
  }

  async fn set_map_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
    ops::set_map_field(&self.tx, key, field, value).await
  }

  async fn get_map_field(&self, key: &str, field: &str) -> Result<String> {
    ops::get_map_field(&self.tx, key, field).await
  }

  async fn delete_map_field(&self, key: &str, field: &str) -> Result<i64> {
    ops::delete_map_field(&self.tx, key, field).await
  }

  async fn get_map(&self, key: &str) -> Result<HashMap<String, String>> {
    ops::get_map(&self.tx, key).await
  }

  async fn scan_map_stream(
    &self,
    key: &str,
    cursor: u64,
    pattern: &str,
    count: i64,
  ) -> Result<(Vec<String>, u64)> {
    ops::scan_map_stream(&self.tx, key, cursor, pattern, count).await
  }

  async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
    ops::set_nx(&self.tx, key, value, ttl).await
  }

  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
    ops::expire(&self.tx, key, ttl).await
  }

  async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
    ops::ttl(&self.tx, key).await
  }

  async fn lock_key(&self, key: &str) -> Result<()> {
    self
      .tx
      .execute(
        "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))",
        &[&key],
      )
      .await?;
    Ok(())
  }

  async fn transaction(&self, _f: TxFn) -> Result<()> {
    Err(CacheError::validation("nested transactions are not supported"))
  }

  async fn publish(&self, channel: &str, message: &str) -> Result<()> {
    ops::publish(&self.tx, channel, message).await
  }

  async fn subscribe_as(&self, _channel: &str, _subscriber: &str) -> Result<Subscription> {
    Err(CacheError::validation(
      "cannot subscribe inside a transaction",
    ))
  }
}
