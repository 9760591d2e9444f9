//! Command-style interface over a [`CacheClient`]
//!
//! Scalar, hash and generic key commands map onto the capability
//! contract. List commands and pipelining are not supported and always
//! fail with `NotFound`.

mod cmd;
mod pipeline;

pub use cmd::{
  BoolCmd, Cmd, Cmder, IntCmd, MapStringStringCmd, StatusCmd, StringCmd, StringSliceCmd,
};
pub use pipeline::{NoopPipeline, Pipeliner};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::client::{tx_fn, CacheClient};
use super::counter;
use super::error::{CacheError, Result};
use super::registry;

#[async_trait]
pub trait Cmdable: Send + Sync {
  fn pipeline(&self) -> Box<dyn Pipeliner>;

  async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StatusCmd;
  async fn get(&self, key: &str) -> StringCmd;
  async fn incr(&self, key: &str) -> IntCmd;
  async fn incr_by(&self, key: &str, delta: i64) -> IntCmd;

  /// `values` alternates field and value.
  async fn hset(&self, key: &str, values: &[&str]) -> IntCmd;
  async fn hget_all(&self, key: &str) -> MapStringStringCmd;

  async fn del(&self, keys: &[&str]) -> IntCmd;
  async fn exists(&self, keys: &[&str]) -> IntCmd;
  async fn expire(&self, key: &str, ttl: Duration) -> BoolCmd;

  async fn lindex(&self, key: &str, index: i64) -> StringCmd;
  async fn lpush(&self, key: &str, values: &[&str]) -> IntCmd;
  async fn rpush(&self, key: &str, values: &[&str]) -> IntCmd;
  async fn lset(&self, key: &str, index: i64, value: &str) -> StatusCmd;
  async fn lpop(&self, key: &str) -> StringCmd;
  async fn lrange(&self, key: &str, start: i64, stop: i64) -> StringSliceCmd;
}

/// [`Cmdable`] backed by any cache client
#[derive(Clone)]
pub struct CmdableAdapter {
  client: Arc<dyn CacheClient>,
}

impl CmdableAdapter {
  pub fn new(client: Arc<dyn CacheClient>) -> Self {
    Self { client }
  }

  /// Wrap the process-wide registered client.
  pub fn from_registry() -> Result<Self> {
    Ok(Self::new(registry::get_client()?))
  }

  pub fn client(&self) -> &Arc<dyn CacheClient> {
    &self.client
  }
}

fn field_pairs(values: &[&str]) -> Result<Vec<(String, String)>> {
  if values.len() < 2 || values.len() % 2 != 0 {
    return Err(CacheError::validation(format!(
      "hset expects field/value pairs, got {} arguments",
      values.len()
    )));
  }
  Ok(
    values
      .chunks_exact(2)
      .map(|pair| (pair[0].to_string(), pair[1].to_string()))
      .collect(),
  )
}

#[async_trait]
impl Cmdable for CmdableAdapter {
  fn pipeline(&self) -> Box<dyn Pipeliner> {
    Box::new(NoopPipeline)
  }

  async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StatusCmd {
    let result = self.client.set(key, value, ttl).await.map(|_| "OK".to_string());
    Cmd::new("set", result)
  }

  async fn get(&self, key: &str) -> StringCmd {
    Cmd::new("get", self.client.get_string(key).await)
  }

  async fn incr(&self, key: &str) -> IntCmd {
    Cmd::new("incr", counter::incr(self.client.as_ref(), key).await)
  }

  async fn incr_by(&self, key: &str, delta: i64) -> IntCmd {
    Cmd::new(
      "incrby",
      counter::incr_by(self.client.as_ref(), key, delta).await,
    )
  }

  async fn hset(&self, key: &str, values: &[&str]) -> IntCmd {
    let pairs = match field_pairs(values) {
      Ok(pairs) => pairs,
      Err(e) => return Cmd::new("hset", Err(e)),
    };
    let written = pairs.len() as i64;
    let key = key.to_string();

    let result = self
      .client
      .transaction(tx_fn(move |tx| {
        Box::pin(async move {
          for (field, value) in &pairs {
            tx.set_map_field(&key, field, value).await?;
          }
          Ok(())
        })
      }))
      .await
      .map(|_| written);
    Cmd::new("hset", result)
  }

  async fn hget_all(&self, key: &str) -> MapStringStringCmd {
    Cmd::new("hgetall", self.client.get_map(key).await)
  }

  async fn del(&self, keys: &[&str]) -> IntCmd {
    if keys.is_empty() {
      return Cmd::new("del", Ok(0));
    }
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    let removed = Arc::new(std::sync::atomic::AtomicI64::new(0));
    let total = removed.clone();

    let result = self
      .client
      .transaction(tx_fn(move |tx| {
        Box::pin(async move {
          let mut sum = 0;
          for key in &keys {
            sum += tx.delete(key).await?;
          }
          total.store(sum, std::sync::atomic::Ordering::SeqCst);
          Ok(())
        })
      }))
      .await
      .map(|_| removed.load(std::sync::atomic::Ordering::SeqCst));
    Cmd::new("del", result)
  }

  async fn exists(&self, keys: &[&str]) -> IntCmd {
    // `count` with no keys counts the whole keyspace
    if keys.is_empty() {
      return Cmd::new("exists", Ok(0));
    }
    Cmd::new("exists", self.client.count(keys).await)
  }

  async fn expire(&self, key: &str, ttl: Duration) -> BoolCmd {
    Cmd::new("expire", self.client.expire(key, ttl).await)
  }

  async fn lindex(&self, _key: &str, _index: i64) -> StringCmd {
    Cmd::new("lindex", Err(CacheError::NotFound))
  }

  async fn lpush(&self, _key: &str, _values: &[&str]) -> IntCmd {
    Cmd::new("lpush", Err(CacheError::NotFound))
  }

  async fn rpush(&self, _key: &str, _values: &[&str]) -> IntCmd {
    Cmd::new("rpush", Err(CacheError::NotFound))
  }

  async fn lset(&self, _key: &str, _index: i64, _value: &str) -> StatusCmd {
    Cmd::new("lset", Err(CacheError::NotFound))
  }

  async fn lpop(&self, _key: &str) -> StringCmd {
    Cmd::new("lpop", Err(CacheError::NotFound))
  }

  async fn lrange(&self, _key: &str, _start: i64, _stop: i64) -> StringSliceCmd {
    Cmd::new("lrange", Err(CacheError::NotFound))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_field_pairs() {
    assert_eq!(
      field_pairs(&["a", "1", "b", "2"]).unwrap(),
      vec![("a".into(), "1".into()), ("b".into(), "2".into())]
    );
    assert!(matches!(field_pairs(&["a"]), Err(CacheError::Validation(_))));
    assert!(matches!(field_pairs(&[]), Err(CacheError::Validation(_))));
    assert!(matches!(
      field_pairs(&["a", "1", "b"]),
      Err(CacheError::Validation(_))
    ));
  }
}
