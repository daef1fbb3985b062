//! Offline-capable HTTP response cache.
//!
//! This module provides:
//! - Three regions (static, dynamic, data) with their own expiry and byte budget
//! - A metadata record co-stored with every response, driving expiry
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - An eviction sweep enforcing expiry and byte budgets

mod eviction;
mod layer;
mod metadata;
mod storage;
mod traits;

pub use eviction::{enforce_budget, remove_expired, sweep, RegionSweep, SweepReport};
pub use layer::CacheLayer;
pub use metadata::{is_expired, now_ms, CacheMetadata};
pub use storage::{CacheStorage, CachedResponse, EntrySummary, NoopStorage, SqliteStorage};
pub use traits::{
  CacheRegion, CacheResult, CacheSource, HttpResponse, RegionPolicy, RegionSet, Request,
  RequestIdentity,
};
