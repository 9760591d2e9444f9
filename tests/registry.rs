use rowcache::cache::{registry, CacheClient, CacheError, CmdableAdapter};
use rowcache::config::{PubSubSection, SqliteSection};
use rowcache::db::SqliteCache;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// One test so the process-wide slot is not shared between parallel tests.
#[tokio::test]
async fn test_registry_lifecycle() {
  assert!(matches!(
    registry::get_client(),
    Err(CacheError::NotInitialized)
  ));
  assert!(matches!(
    CmdableAdapter::from_registry(),
    Err(CacheError::NotInitialized)
  ));
  assert_eq!(registry::close().await, Err(CacheError::NotInitialized));

  let dir = TempDir::new().unwrap();
  let config = SqliteSection {
    path: dir.path().join("registry.db").to_string_lossy().into_owned(),
    busy_timeout_ms: 5000,
  };
  let cache = SqliteCache::open(&config, &PubSubSection::default())
    .await
    .unwrap();
  registry::set_client(Arc::new(cache));

  let client = registry::get_client().unwrap();
  client.set("k", b"v", Duration::ZERO).await.unwrap();

  let adapter = CmdableAdapter::from_registry().unwrap();
  assert_eq!(adapter.client().get_string("k").await.unwrap(), "v");

  tokio_test::assert_ok!(registry::close().await);
  assert!(matches!(
    registry::get_client(),
    Err(CacheError::NotInitialized)
  ));
}
