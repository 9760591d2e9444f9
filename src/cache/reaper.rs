//! Background deletion of expired rows

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::error::Result;
use crate::config::ReaperSection;

/// Store operations the reaper needs.
#[async_trait]
pub trait ExpiryStore: Send + Sync + 'static {
  /// Delete scalar rows with `expire_at <= now`. Returns the number removed.
  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;

  /// Delete messages created before `older_than`. Returns the number removed.
  async fn purge_messages(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Counts removed by one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
  pub expired: u64,
  pub messages: u64,
}

/// Run a single pass. A zero `retention` keeps every message.
pub async fn reap_once(store: &dyn ExpiryStore, retention: Duration) -> Result<ReapStats> {
  let now = Utc::now();
  let expired = store.purge_expired(now).await?;

  let messages = if retention.is_zero() {
    0
  } else {
    match chrono::Duration::from_std(retention) {
      Ok(retention) => store.purge_messages(now - retention).await?,
      Err(_) => 0,
    }
  };

  Ok(ReapStats { expired, messages })
}

/// Handle to a running reaper task
pub struct ReaperHandle {
  stop: Option<oneshot::Sender<()>>,
  task: JoinHandle<()>,
}

impl ReaperHandle {
  /// Stop the loop and wait for the task to finish.
  pub async fn shutdown(mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    let _ = self.task.await;
  }
}

/// Spawn the reaper loop. It runs until the handle is shut down or dropped.
pub fn spawn_reaper(store: Arc<dyn ExpiryStore>, config: &ReaperSection) -> ReaperHandle {
  let initial_delay = Duration::from_secs(config.initial_delay_secs);
  let interval = Duration::from_secs(config.interval_secs.max(1));
  let retention = Duration::from_secs(config.message_retention_secs);
  let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

  let task = tokio::spawn(async move {
    tokio::select! {
      _ = &mut stop_rx => return,
      _ = tokio::time::sleep(initial_delay) => {}
    }

    loop {
      match reap_once(store.as_ref(), retention).await {
        Ok(stats) => {
          tracing::info!("Reaper removed {} expired keys", stats.expired);
          if stats.messages > 0 {
            tracing::info!("Reaper removed {} old messages", stats.messages);
          }
        }
        Err(e) => tracing::error!("Reaper pass failed: {}", e),
      }

      tokio::select! {
        _ = &mut stop_rx => break,
        _ = tokio::time::sleep(interval) => {}
      }
    }
  });

  ReaperHandle {
    stop: Some(stop_tx),
    task,
  }
}
