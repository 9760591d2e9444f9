//! Store backends and backend selection

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresCache;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCache;

use std::sync::Arc;

use crate::cache::client::CacheClient;
use crate::cache::error::{CacheError, Result};
use crate::cache::reaper::ExpiryStore;
use crate::config::{BackendType, Config};

/// An opened backend: the client plus the store handle maintenance runs against.
pub struct Backend {
  pub client: Arc<dyn CacheClient>,
  pub expiry: Arc<dyn ExpiryStore>,
}

/// Open the configured backend, starting its reaper when `start_reaper` is set.
pub async fn open(config: &Config, start_reaper: bool) -> Result<Backend> {
  match config.backend {
    #[cfg(feature = "sqlite")]
    BackendType::Sqlite => {
      let cache = SqliteCache::open(&config.sqlite, &config.pubsub).await?;
      if start_reaper {
        cache.start_reaper(&config.reaper);
      }
      Ok(Backend {
        expiry: cache.expiry_store(),
        client: Arc::new(cache),
      })
    }
    #[cfg(feature = "postgres")]
    BackendType::Postgres => {
      let cache = PostgresCache::connect(&config.postgres, &config.pubsub).await?;
      if start_reaper {
        cache.start_reaper(&config.reaper);
      }
      Ok(Backend {
        expiry: cache.expiry_store(),
        client: Arc::new(cache),
      })
    }
    #[allow(unreachable_patterns)]
    other => Err(CacheError::validation(format!(
      "backend {:?} is not compiled in",
      other
    ))),
  }
}

/// Open the configured backend as a cache client, with the reaper
/// running when `reaper.enabled` is set.
pub async fn connect(config: &Config) -> Result<Arc<dyn CacheClient>> {
  let backend = open(config, config.reaper.enabled).await?;
  tracing::info!("Cache backend {:?} ready", config.backend);
  Ok(backend.client)
}
