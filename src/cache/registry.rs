//! Process-wide cache client slot

use parking_lot::RwLock;
use std::sync::Arc;

use super::client::CacheClient;
use super::error::{CacheError, Result};

static CLIENT: RwLock<Option<Arc<dyn CacheClient>>> = parking_lot::const_rwlock(None);

/// Register the client returned by [`get_client`], replacing any previous one.
pub fn set_client(client: Arc<dyn CacheClient>) {
  *CLIENT.write() = Some(client);
}

pub fn get_client() -> Result<Arc<dyn CacheClient>> {
  CLIENT.read().clone().ok_or(CacheError::NotInitialized)
}

/// Close the registered client and clear the slot.
pub async fn close() -> Result<()> {
  let client = CLIENT.write().take().ok_or(CacheError::NotInitialized)?;
  client.close().await
}
