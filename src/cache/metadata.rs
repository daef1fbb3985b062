//! Metadata co-stored with every cached response, and the expiry check built on it.
//!
//! The record lives in its own columns next to the payload row, so reading it
//! never touches the response bytes.

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::traits::{CacheRegion, RegionPolicy};

/// When and where an entry was written, and how long it stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetadata {
  pub written_at_ms: i64,
  pub region: CacheRegion,
  /// Falls back to the region default when absent or zero
  pub expiry_ms: Option<i64>,
}

impl CacheMetadata {
  /// Fresh metadata for a write into `policy`'s region at `now_ms`.
  pub fn stamp(policy: &RegionPolicy, now_ms: i64) -> Self {
    Self {
      written_at_ms: now_ms,
      region: policy.region,
      expiry_ms: Some(policy.expiry.num_milliseconds()),
    }
  }

  /// Rebuild metadata from its stored columns.
  ///
  /// Returns `None` when the timestamp is missing or the region is not
  /// recognised; callers treat that as an expired entry.
  pub fn decode(
    written_at_ms: Option<i64>,
    region: Option<&str>,
    expiry_ms: Option<i64>,
  ) -> Option<Self> {
    Some(Self {
      written_at_ms: written_at_ms?,
      region: CacheRegion::parse(region?)?,
      expiry_ms,
    })
  }

  pub fn effective_expiry_ms(&self, default_expiry: Duration) -> i64 {
    match self.expiry_ms {
      Some(ms) if ms > 0 => ms,
      _ => default_expiry.num_milliseconds(),
    }
  }

  pub fn written_at(&self) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(self.written_at_ms).single()
  }
}

/// `(now - written_at) > expiry`. Missing metadata counts as expired.
pub fn is_expired(metadata: Option<&CacheMetadata>, default_expiry: Duration, now_ms: i64) -> bool {
  match metadata {
    Some(meta) => now_ms.saturating_sub(meta.written_at_ms) > meta.effective_expiry_ms(default_expiry),
    None => true,
  }
}

pub fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}
