//! Cache contract, helpers and background tasks shared by every backend

pub mod adapter;
pub mod client;
pub mod counter;
pub mod entry;
pub mod error;
pub mod pubsub;
pub mod reaper;
pub mod registry;

pub use adapter::{Cmdable, CmdableAdapter};
pub use client::{tx_fn, CacheClient, TxFn, TxFuture};
pub use error::{CacheError, Result};
pub use pubsub::{Detach, MessageLog, Subscription};
pub use reaper::{reap_once, spawn_reaper, ExpiryStore, ReapStats, ReaperHandle};
