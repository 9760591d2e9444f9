//! Cache error taxonomy

use thiserror::Error;

/// Errors surfaced by every cache operation.
///
/// `NotFound` covers missing keys, missing map fields, empty maps and
/// unsupported list commands. Callers tell these apart by the call they made.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
  #[error("cache not initialized")]
  NotInitialized,
  #[error("cache not found")]
  NotFound,
  #[error("store error: {0}")]
  Store(String),
  #[error("invalid argument: {0}")]
  Validation(String),
}

impl CacheError {
  pub fn validation(msg: impl Into<String>) -> Self {
    CacheError::Validation(msg.into())
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, CacheError::NotFound)
  }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CacheError {
  fn from(err: rusqlite::Error) -> Self {
    CacheError::Store(err.to_string())
  }
}

#[cfg(feature = "sqlite")]
impl From<tokio_rusqlite::Error> for CacheError {
  fn from(err: tokio_rusqlite::Error) -> Self {
    match err {
      tokio_rusqlite::Error::Rusqlite(e) => CacheError::Store(e.to_string()),
      tokio_rusqlite::Error::ConnectionClosed => {
        CacheError::Store("connection closed unexpectedly".to_string())
      }
      other => CacheError::Store(other.to_string()),
    }
  }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for CacheError {
  fn from(err: tokio_postgres::Error) -> Self {
    CacheError::Store(err.to_string())
  }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for CacheError {
  fn from(err: deadpool_postgres::PoolError) -> Self {
    CacheError::Store(format!("pool: {}", err))
  }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::CreatePoolError> for CacheError {
  fn from(err: deadpool_postgres::CreatePoolError) -> Self {
    CacheError::Store(format!("pool: {}", err))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_display() {
    assert_eq!(CacheError::NotFound.to_string(), "cache not found");
    assert_eq!(CacheError::NotInitialized.to_string(), "cache not initialized");
    assert_eq!(
      CacheError::validation("odd field count").to_string(),
      "invalid argument: odd field count"
    );
  }

  #[test]
  fn test_is_not_found() {
    assert!(CacheError::NotFound.is_not_found());
    assert!(!CacheError::Store("boom".into()).is_not_found());
  }
}
