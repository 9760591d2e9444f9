//! Read-modify-write counters on the scalar table

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use super::client::{tx_fn, CacheClient};
use super::entry::retained_ttl;
use super::error::{CacheError, Result};

/// Increment `key` by one.
pub async fn incr(client: &dyn CacheClient, key: &str) -> Result<i64> {
  incr_by(client, key, 1).await
}

/// Add `delta` to the integer stored at `key` and return the new value.
///
/// A missing key counts as 0. The key keeps whatever expiry it had; a
/// newly created counter never expires.
pub async fn incr_by(client: &dyn CacheClient, key: &str, delta: i64) -> Result<i64> {
  let result = Arc::new(AtomicI64::new(0));
  let out = result.clone();
  let key = key.to_string();

  client
    .transaction(tx_fn(move |tx| {
      Box::pin(async move {
        tx.lock_key(&key).await?;

        let (current, remaining) = match tx.get_string(&key).await {
          Ok(raw) => {
            let value = raw.trim().parse::<i64>().map_err(|_| {
              CacheError::validation(format!("value of {} is not an integer", key))
            })?;
            (value, tx.ttl(&key).await?)
          }
          Err(CacheError::NotFound) => (0, None),
          Err(e) => return Err(e),
        };

        let next = current
          .checked_add(delta)
          .ok_or_else(|| CacheError::validation(format!("increment of {} overflows", key)))?;

        tx.set(&key, next.to_string().as_bytes(), retained_ttl(remaining))
          .await?;
        out.store(next, Ordering::SeqCst);
        Ok(())
      })
    }))
    .await?;

  Ok(result.load(Ordering::SeqCst))
}
