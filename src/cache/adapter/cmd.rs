use std::collections::HashMap;

use crate::cache::error::{CacheError, Result};

/// Outcome of one command: its name plus either a value or an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Cmd<T> {
  name: &'static str,
  result: Result<T>,
}

pub type StatusCmd = Cmd<String>;
pub type StringCmd = Cmd<String>;
pub type IntCmd = Cmd<i64>;
pub type BoolCmd = Cmd<bool>;
pub type MapStringStringCmd = Cmd<HashMap<String, String>>;
pub type StringSliceCmd = Cmd<Vec<String>>;

impl<T> Cmd<T> {
  pub fn new(name: &'static str, result: Result<T>) -> Self {
    Self { name, result }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn err(&self) -> Option<&CacheError> {
    self.result.as_ref().err()
  }

  pub fn result(&self) -> std::result::Result<&T, &CacheError> {
    self.result.as_ref()
  }

  pub fn into_result(self) -> Result<T> {
    self.result
  }
}

impl<T: Clone + Default> Cmd<T> {
  /// The value, or the type's default when the command failed.
  pub fn val(&self) -> T {
    self.result.as_ref().cloned().unwrap_or_default()
  }
}

impl Cmd<String> {
  pub fn bytes(&self) -> Result<Vec<u8>> {
    self.result.clone().map(String::into_bytes)
  }

  pub fn int64(&self) -> Result<i64> {
    let s = self.result.as_ref().map_err(Clone::clone)?;
    s.trim()
      .parse()
      .map_err(|_| CacheError::validation(format!("{} is not an integer", s)))
  }
}

/// Command outcome with its value type erased
pub trait Cmder: Send + Sync {
  fn name(&self) -> &'static str;
  fn err(&self) -> Option<&CacheError>;
}

impl<T: Send + Sync> Cmder for Cmd<T> {
  fn name(&self) -> &'static str {
    self.name
  }

  fn err(&self) -> Option<&CacheError> {
    self.result.as_ref().err()
  }
}
