//! Polling publish/subscribe over the message log
//!
//! Each subscription owns one background task. It polls the log for
//! messages past its cursor, hands them to a bounded channel in id order
//! and persists the cursor only after the hand-off succeeded, giving
//! at-least-once delivery.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::entry::{Message, SubscriptionCursor};
use super::error::Result;
use crate::config::PubSubSection;

/// Store operations behind a subscription.
#[async_trait]
pub trait MessageLog: Send + Sync + 'static {
  /// Create the cursor row if missing and return it.
  async fn attach(&self, channel: &str, subscriber: &str) -> Result<SubscriptionCursor>;

  /// Messages on `channel` with id greater than `after_id`, ascending.
  async fn fetch_after(&self, channel: &str, after_id: i64, limit: i64) -> Result<Vec<Message>>;

  /// Persist the last delivered id.
  async fn advance(&self, channel: &str, subscriber: &str, id: i64) -> Result<()>;

  /// Remove the cursor row.
  async fn detach(&self, channel: &str, subscriber: &str) -> Result<()>;
}

/// Attach `subscriber` to `channel` and start its poller.
pub async fn subscribe(
  log: Arc<dyn MessageLog>,
  channel: &str,
  subscriber: &str,
  config: &PubSubSection,
) -> Result<Subscription> {
  let cursor = log.attach(channel, subscriber).await?;
  tracing::debug!(
    "Subscriber {} attached to {} at id {}",
    subscriber,
    channel,
    cursor.last_delivered_id
  );

  let (tx, rx) = mpsc::channel(config.buffer.max(1));
  let (stop_tx, stop_rx) = oneshot::channel();
  let poller = Poller {
    log,
    cursor,
    interval: Duration::from_millis(config.poll_interval_ms.max(1)),
    batch_size: config.batch_size.max(1),
  };
  let task = tokio::spawn(poller.run(tx, stop_rx));

  Ok(Subscription {
    channel: channel.to_string(),
    subscriber: subscriber.to_string(),
    rx,
    detach: Detach {
      stop: Some(stop_tx),
      task: Some(task),
    },
  })
}

struct Poller {
  log: Arc<dyn MessageLog>,
  cursor: SubscriptionCursor,
  interval: Duration,
  batch_size: i64,
}

impl Poller {
  async fn run(mut self, tx: mpsc::Sender<String>, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = &mut stop => break,
        _ = tx.closed() => break,
        _ = ticker.tick() => {
          if !self.deliver(&tx, &mut stop).await {
            break;
          }
        }
      }
    }

    let SubscriptionCursor {
      channel,
      subscriber,
      ..
    } = &self.cursor;
    if let Err(e) = self.log.detach(channel, subscriber).await {
      tracing::warn!("Failed to remove cursor for {} on {}: {}", subscriber, channel, e);
    }
    tracing::debug!("Subscriber {} detached from {}", subscriber, channel);
  }

  /// Deliver one batch. Returns false once the subscription should end.
  async fn deliver(&mut self, tx: &mpsc::Sender<String>, stop: &mut oneshot::Receiver<()>) -> bool {
    let batch = match self
      .log
      .fetch_after(
        &self.cursor.channel,
        self.cursor.last_delivered_id,
        self.batch_size,
      )
      .await
    {
      Ok(batch) => batch,
      Err(e) => {
        tracing::warn!("Poll of {} failed: {}", self.cursor.channel, e);
        return true;
      }
    };

    for message in batch {
      let sent = tokio::select! {
        _ = &mut *stop => return false,
        sent = tx.send(message.payload) => sent,
      };
      if sent.is_err() {
        return false;
      }

      self.cursor.last_delivered_id = message.id;
      if let Err(e) = self
        .log
        .advance(&self.cursor.channel, &self.cursor.subscriber, message.id)
        .await
      {
        // The in-memory cursor stays ahead; the row catches up on the next success.
        tracing::warn!("Failed to persist cursor for {}: {}", self.cursor.subscriber, e);
      }
    }
    true
  }
}

/// Stops a subscription's poller. Dropping it detaches as well.
pub struct Detach {
  stop: Option<oneshot::Sender<()>>,
  task: Option<JoinHandle<()>>,
}

impl Detach {
  /// Stop polling and wait until the cursor row is removed.
  pub async fn detach(mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    if let Some(task) = self.task.take() {
      let _ = task.await;
    }
  }
}

impl Drop for Detach {
  fn drop(&mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
  }
}

/// A live subscription: a receive-only stream of payloads plus its detach handle.
pub struct Subscription {
  channel: String,
  subscriber: String,
  rx: mpsc::Receiver<String>,
  detach: Detach,
}

impl Subscription {
  /// Next payload, or `None` once the poller has stopped.
  pub async fn recv(&mut self) -> Option<String> {
    self.rx.recv().await
  }

  pub fn channel(&self) -> &str {
    &self.channel
  }

  pub fn subscriber(&self) -> &str {
    &self.subscriber
  }

  pub fn into_parts(self) -> (mpsc::Receiver<String>, Detach) {
    (self.rx, self.detach)
  }

  pub async fn detach(self) {
    self.detach.detach().await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::error::CacheError;
  use chrono::Utc;
  use parking_lot::Mutex;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Default)]
  struct MemoryLog {
    messages: Mutex<Vec<Message>>,
    cursors: Mutex<Vec<(String, String, i64)>>,
    // Number of upcoming fetches that fail
    failing_fetches: AtomicU32,
    fetches: AtomicU32,
  }

  impl MemoryLog {
    fn push(&self, channel: &str, payload: &str) {
      let mut messages = self.messages.lock();
      let id = messages.len() as i64 + 1;
      messages.push(Message {
        id,
        channel: channel.to_string(),
        payload: payload.to_string(),
        created_at: Utc::now(),
      });
    }
  }

  #[async_trait]
  impl MessageLog for MemoryLog {
    async fn attach(&self, channel: &str, subscriber: &str) -> Result<SubscriptionCursor> {
      let mut cursors = self.cursors.lock();
      let existing = cursors
        .iter()
        .find(|(c, s, _)| c == channel && s == subscriber)
        .map(|(_, _, id)| *id);
      let last = match existing {
        Some(id) => id,
        None => {
          cursors.push((channel.to_string(), subscriber.to_string(), -1));
          -1
        }
      };
      Ok(SubscriptionCursor {
        channel: channel.to_string(),
        subscriber: subscriber.to_string(),
        last_delivered_id: last,
      })
    }

    async fn fetch_after(&self, channel: &str, after_id: i64, limit: i64) -> Result<Vec<Message>> {
      self.fetches.fetch_add(1, Ordering::SeqCst);
      let failing = self
        .failing_fetches
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
      if failing.is_ok() {
        return Err(CacheError::Store("connection reset".into()));
      }
      Ok(
        self
          .messages
          .lock()
          .iter()
          .filter(|m| m.channel == channel && m.id > after_id)
          .take(limit as usize)
          .cloned()
          .collect(),
      )
    }

    async fn advance(&self, channel: &str, subscriber: &str, id: i64) -> Result<()> {
      for cursor in self.cursors.lock().iter_mut() {
        if cursor.0 == channel && cursor.1 == subscriber {
          cursor.2 = id;
        }
      }
      Ok(())
    }

    async fn detach(&self, channel: &str, subscriber: &str) -> Result<()> {
      self
        .cursors
        .lock()
        .retain(|(c, s, _)| !(c == channel && s == subscriber));
      Ok(())
    }
  }

  fn fast() -> PubSubSection {
    PubSubSection {
      poll_interval_ms: 5,
      batch_size: 2,
      buffer: 4,
    }
  }

  #[tokio::test]
  async fn test_delivers_in_order_across_batches() {
    let log = Arc::new(MemoryLog::default());
    for i in 0..5 {
      log.push("news", &format!("m{}", i));
    }
    log.push("other", "skip");

    let mut sub = subscribe(log.clone(), "news", "s1", &fast()).await.unwrap();
    for i in 0..5 {
      let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .unwrap();
      assert_eq!(got, Some(format!("m{}", i)));
    }

    sub.detach().await;
    assert!(log.cursors.lock().is_empty());
  }

  #[tokio::test]
  async fn test_dropping_receiver_stops_poller() {
    let log = Arc::new(MemoryLog::default());
    let sub = subscribe(log.clone(), "news", "s1", &fast()).await.unwrap();
    let (rx, detach) = sub.into_parts();
    drop(rx);

    tokio::time::timeout(Duration::from_secs(2), detach.detach())
      .await
      .unwrap();
    assert!(log.cursors.lock().is_empty());
  }

  #[tokio::test]
  async fn test_resumes_from_persisted_cursor() {
    let log = Arc::new(MemoryLog::default());
    log.push("news", "old");
    log.push("news", "new");
    log
      .cursors
      .lock()
      .push(("news".into(), "durable".into(), 1));

    let mut sub = subscribe(log.clone(), "news", "durable", &fast())
      .await
      .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
      .await
      .unwrap();
    assert_eq!(got.as_deref(), Some("new"));
    sub.detach().await;
  }

  #[tokio::test]
  async fn test_failed_fetch_retries_on_next_tick() {
    let log = Arc::new(MemoryLog::default());
    log.failing_fetches.store(2, Ordering::SeqCst);
    for i in 0..3 {
      log.push("news", &format!("m{}", i));
    }

    let mut sub = subscribe(log.clone(), "news", "s1", &fast()).await.unwrap();
    for i in 0..3 {
      let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .unwrap();
      assert_eq!(got, Some(format!("m{}", i)));
    }
    assert!(log.fetches.load(Ordering::SeqCst) >= 4);

    sub.detach().await;
  }
}
