use rowcache::cache::counter::{incr, incr_by};
use rowcache::cache::{CacheClient, CacheError};
use rowcache::config::{PubSubSection, SqliteSection};
use rowcache::db::SqliteCache;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn open_cache(dir: &TempDir) -> Arc<SqliteCache> {
  let config = SqliteSection {
    path: dir
      .path()
      .join("counter.db")
      .to_string_lossy()
      .into_owned(),
    busy_timeout_ms: 60_000,
  };
  Arc::new(
    SqliteCache::open(&config, &PubSubSection::default())
      .await
      .unwrap(),
  )
}

async fn concurrent_increments(n: usize) {
  let dir = TempDir::new().unwrap();
  let cache = open_cache(&dir).await;

  let mut handles = Vec::with_capacity(n);
  for _ in 0..n {
    let cache = cache.clone();
    handles.push(tokio::spawn(async move {
      incr(cache.as_ref(), "hits").await
    }));
  }

  let mut seen = Vec::with_capacity(n);
  for handle in handles {
    seen.push(handle.await.unwrap().unwrap());
  }
  seen.sort_unstable();

  // Every increment observed a distinct value: no lost updates
  let expected: Vec<i64> = (1..=n as i64).collect();
  assert_eq!(seen, expected);
  assert_eq!(cache.get_string("hits").await.unwrap(), n.to_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_incr_single() {
  concurrent_increments(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_incr_ten() {
  concurrent_increments(10).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_incr_hundred() {
  concurrent_increments(100).await;
}

#[tokio::test]
async fn test_incr_missing_key_starts_at_zero() {
  let dir = TempDir::new().unwrap();
  let cache = open_cache(&dir).await;

  assert_eq!(incr(cache.as_ref(), "fresh").await.unwrap(), 1);
  assert_eq!(incr_by(cache.as_ref(), "fresh", 41).await.unwrap(), 42);
  assert_eq!(incr_by(cache.as_ref(), "fresh", -50).await.unwrap(), -8);
  assert_eq!(cache.ttl("fresh").await.unwrap(), None);
}

#[tokio::test]
async fn test_incr_keeps_ttl() {
  let dir = TempDir::new().unwrap();
  let cache = open_cache(&dir).await;

  cache
    .set("ratelimit", b"5", Duration::from_secs(60))
    .await
    .unwrap();
  assert_eq!(incr(cache.as_ref(), "ratelimit").await.unwrap(), 6);

  let left = cache.ttl("ratelimit").await.unwrap().unwrap();
  assert!(left <= Duration::from_secs(60));
  assert!(left > Duration::from_secs(50));
}

#[tokio::test]
async fn test_incr_expired_key_restarts() {
  let dir = TempDir::new().unwrap();
  let cache = open_cache(&dir).await;

  cache
    .set("window", b"99", Duration::from_millis(20))
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_millis(60)).await;
  assert_eq!(incr(cache.as_ref(), "window").await.unwrap(), 1);
}

#[tokio::test]
async fn test_incr_non_integer_fails_without_writing() {
  let dir = TempDir::new().unwrap();
  let cache = open_cache(&dir).await;

  cache.set("name", b"alice", Duration::ZERO).await.unwrap();
  assert!(matches!(
    incr(cache.as_ref(), "name").await,
    Err(CacheError::Validation(_))
  ));
  assert_eq!(cache.get_string("name").await.unwrap(), "alice");
}

#[tokio::test]
async fn test_incr_overflow_fails() {
  let dir = TempDir::new().unwrap();
  let cache = open_cache(&dir).await;

  cache
    .set("big", i64::MAX.to_string().as_bytes(), Duration::ZERO)
    .await
    .unwrap();
  assert!(matches!(
    incr(cache.as_ref(), "big").await,
    Err(CacheError::Validation(_))
  ));
  assert_eq!(
    cache.get_string("big").await.unwrap(),
    i64::MAX.to_string()
  );
}
