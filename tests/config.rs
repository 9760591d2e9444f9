use rowcache::cache::CacheClient;
use rowcache::config::{BackendType, Config};
use rowcache::db;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

#[test]
fn test_defaults() {
  let config = Config::default();
  assert_eq!(config.backend, BackendType::Sqlite);
  assert_eq!(config.sqlite.path, "rowcache.db");
  assert_eq!(config.sqlite.busy_timeout_ms, 5000);
  assert_eq!(config.postgres.max_connections, 20);
  assert_eq!(config.pubsub.poll_interval_ms, 100);
  assert_eq!(config.pubsub.batch_size, 10);
  assert_eq!(config.pubsub.buffer, 100);
  assert!(config.reaper.enabled);
  assert_eq!(config.reaper.initial_delay_secs, 300);
  assert_eq!(config.reaper.interval_secs, 60);
  assert_eq!(config.reaper.message_retention_secs, 3600);
  assert_eq!(config.logging.level, "info");
}

#[test]
fn test_partial_yaml_fills_defaults() {
  let config = Config::from_yaml(
    r#"
backend: postgres
postgres:
  url: postgres://cache@db/cache
pubsub:
  poll_interval_ms: 250
reaper:
  enabled: false
"#,
  )
  .unwrap();

  assert_eq!(config.backend, BackendType::Postgres);
  assert_eq!(config.postgres.url, "postgres://cache@db/cache");
  assert_eq!(config.postgres.max_connections, 20);
  assert_eq!(config.pubsub.poll_interval_ms, 250);
  assert_eq!(config.pubsub.batch_size, 10);
  assert!(!config.reaper.enabled);
  assert_eq!(config.reaper.interval_secs, 60);
}

#[test]
fn test_from_file_expands_env() {
  std::env::set_var("ROWCACHE_TEST_DB_PATH", "/var/lib/rowcache/cache.db");
  let mut file = NamedTempFile::new().unwrap();
  writeln!(file, "sqlite:\n  path: ${{ROWCACHE_TEST_DB_PATH}}\nlogging:\n  level: debug").unwrap();

  let config = Config::from_file(file.path()).unwrap();
  assert_eq!(config.sqlite.path, "/var/lib/rowcache/cache.db");
  assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_invalid_backend_rejected() {
  tokio_test::assert_err!(Config::from_yaml("backend: redis"));
}

#[tokio::test]
async fn test_connect_sqlite_from_config() {
  let dir = TempDir::new().unwrap();
  let mut config = Config::default();
  config.sqlite.path = dir.path().join("c.db").to_string_lossy().into_owned();
  config.reaper.enabled = false;

  let client = db::connect(&config).await.unwrap();
  client
    .set("k", b"v", std::time::Duration::ZERO)
    .await
    .unwrap();
  assert_eq!(client.get_string("k").await.unwrap(), "v");
  client.close().await.unwrap();
}
