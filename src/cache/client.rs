//! The capability contract every cache backend implements

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::error::{CacheError, Result};
use super::pubsub::Subscription;

/// Future returned by a transaction body
pub type TxFuture<'a> = BoxFuture<'a, Result<()>>;

/// Transaction body. Receives a handle whose every call runs inside the
/// transaction; returning `Err` rolls the whole transaction back.
pub type TxFn = Box<dyn for<'a> FnOnce(&'a dyn CacheClient) -> TxFuture<'a> + Send>;

/// Box a closure as a [`TxFn`].
///
/// ```ignore
/// client
///   .transaction(tx_fn(move |tx| {
///     Box::pin(async move {
///       tx.set("a", b"1", Duration::ZERO).await?;
///       tx.set("b", b"2", Duration::ZERO).await
///     })
///   }))
///   .await?;
/// ```
pub fn tx_fn<F>(f: F) -> TxFn
where
  F: for<'a> FnOnce(&'a dyn CacheClient) -> TxFuture<'a> + Send + 'static,
{
  Box::new(f)
}

/// Minimal operation set a cache backend must provide.
///
/// Keys whose expiry has passed are logically absent for every operation,
/// whether or not the reaper has removed them yet.
#[async_trait]
pub trait CacheClient: Send + Sync {
  /// Release background resources. Safe to call more than once.
  async fn close(&self) -> Result<()>;

  /// Upsert a scalar value. A zero `ttl` never expires.
  async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

  async fn get_bytes(&self, key: &str) -> Result<Vec<u8>>;

  async fn get_string(&self, key: &str) -> Result<String> {
    let bytes = self.get_bytes(key).await?;
    String::from_utf8(bytes)
      .map_err(|_| CacheError::validation(format!("value of {} is not valid UTF-8", key)))
  }

  /// Remove a key. Returns 1 if a live entry was removed, 0 otherwise.
  async fn delete(&self, key: &str) -> Result<i64>;

  /// Count live keys among `keys`, or all live keys when `keys` is empty.
  async fn count(&self, keys: &[&str]) -> Result<i64>;

  async fn set_map_field(&self, key: &str, field: &str, value: &str) -> Result<()>;

  async fn get_map_field(&self, key: &str, field: &str) -> Result<String>;

  /// Returns the number of fields removed (0 or 1).
  async fn delete_map_field(&self, key: &str, field: &str) -> Result<i64>;

  /// All fields of a map. Fails with `NotFound` when the map is empty.
  async fn get_map(&self, key: &str) -> Result<HashMap<String, String>>;

  /// One page of `[field, value, ...]` ordered by field, plus the next
  /// cursor (0 once the scan is complete). `pattern` is a glob where only
  /// `*` and `?` are wildcards.
  async fn scan_map_stream(
    &self,
    key: &str,
    cursor: u64,
    pattern: &str,
    count: i64,
  ) -> Result<(Vec<String>, u64)>;

  /// Create the key only if it is absent. Returns whether this call wrote it.
  async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

  /// Reset the expiry of a live key. A zero `ttl` makes the key persistent.
  async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

  /// Remaining time to live. `None` for keys that never expire.
  async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

  /// Serialise on `key` until the surrounding transaction ends.
  async fn lock_key(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  async fn transaction(&self, f: TxFn) -> Result<()>;

  async fn publish(&self, channel: &str, message: &str) -> Result<()>;

  /// Attach an ephemeral subscriber that starts from the oldest retained message.
  async fn subscribe(&self, channel: &str) -> Result<Subscription> {
    let subscriber = format!("sub_{}", Uuid::new_v4().simple());
    self.subscribe_as(channel, &subscriber).await
  }

  /// Attach under a caller-chosen subscriber id, resuming its cursor if one exists.
  async fn subscribe_as(&self, channel: &str, subscriber: &str) -> Result<Subscription>;
}
