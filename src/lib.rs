//! Offline-capable HTTP response cache with a durable deferred-write queue.

pub mod cache;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod net;
pub mod queue;
pub mod router;
pub mod system;

mod db;

#[cfg(test)]
mod test_support;

pub use system::{CacheSystem, HttpCacheSystem, SYNC_TAG};
