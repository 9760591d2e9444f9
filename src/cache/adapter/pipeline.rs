use async_trait::async_trait;

use super::cmd::{Cmder, StatusCmd};
use crate::cache::error::{CacheError, Result};

/// Batched command execution
#[async_trait]
pub trait Pipeliner: Send + Sync {
  /// Queue a command. Returns its pending outcome.
  fn queue(&mut self, name: &'static str, args: &[&str]) -> StatusCmd;

  fn len(&self) -> usize;

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Run everything queued.
  async fn exec(&mut self) -> Result<Vec<Box<dyn Cmder>>>;

  fn discard(&mut self);
}

/// Pipeline for stores that cannot batch. Nothing is queued and every
/// command fails with `NotFound`.
#[derive(Debug, Default)]
pub struct NoopPipeline;

#[async_trait]
impl Pipeliner for NoopPipeline {
  fn queue(&mut self, name: &'static str, _args: &[&str]) -> StatusCmd {
    StatusCmd::new(name, Err(CacheError::NotFound))
  }

  fn len(&self) -> usize {
    0
  }

  async fn exec(&mut self) -> Result<Vec<Box<dyn Cmder>>> {
    Err(CacheError::NotFound)
  }

  fn discard(&mut self) {}
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_noop_pipeline_fails() {
    let mut pipe = NoopPipeline;
    let cmd = pipe.queue("set", &["k", "v"]);
    assert_eq!(cmd.err(), Some(&CacheError::NotFound));
    assert!(pipe.is_empty());
    assert!(matches!(pipe.exec().await, Err(CacheError::NotFound)));
  }
}
