//! Cache, counters and polling pub/sub on a transactional SQL store.
//!
//! Consumers program against [`cache::CacheClient`]; [`db::connect`]
//! picks a SQLite or PostgreSQL implementation from [`config::Config`].

pub mod cache;
pub mod config;
pub mod db;

pub use cache::{CacheClient, CacheError, CmdableAdapter, Result};
pub use config::Config;
