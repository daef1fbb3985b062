//! Eviction sweep: drop expired entries, then trim each region to its byte budget.
//!
//! Budget trimming removes the oldest writes first. This approximates
//! least-recently-written, not least-recently-used; reads do not refresh an
//! entry's position.

use color_eyre::Result;
use tracing::{debug, error, info};

use super::metadata::is_expired;
use super::storage::CacheStorage;
use super::traits::{RegionPolicy, RegionSet};

/// Outcome of sweeping one region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionSweep {
  pub region_name: String,
  pub expired_removed: usize,
  pub evicted: usize,
  pub bytes_before: u64,
  pub bytes_after: u64,
}

/// Outcome of a full sweep over every current region.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub regions: Vec<RegionSweep>,
}

impl SweepReport {
  pub fn expired_removed(&self) -> usize {
    self.regions.iter().map(|r| r.expired_removed).sum()
  }

  pub fn evicted(&self) -> usize {
    self.regions.iter().map(|r| r.evicted).sum()
  }

  pub fn region(&self, region_name: &str) -> Option<&RegionSweep> {
    self.regions.iter().find(|r| r.region_name == region_name)
  }
}

/// Sweep every region of the current generation.
///
/// A failure in one region is logged and the sweep moves on to the next.
/// Regions left over from other generations are ignored here; activation
/// deletes them.
pub fn sweep<S: CacheStorage + ?Sized>(storage: &S, regions: &RegionSet, now_ms: i64) -> SweepReport {
  let mut report = SweepReport::default();

  for policy in regions.iter() {
    match sweep_region(storage, policy, now_ms) {
      Ok(region) => report.regions.push(region),
      Err(e) => error!(region = %policy.name, "Cache cleanup failed: {}", e),
    }
  }

  report
}

fn sweep_region<S: CacheStorage + ?Sized>(
  storage: &S,
  policy: &RegionPolicy,
  now_ms: i64,
) -> Result<RegionSweep> {
  let expired_removed = remove_expired(storage, policy, now_ms)?;
  let bytes_before = storage.region_size(&policy.name)?;
  let evicted = enforce_budget(storage, policy)?;
  let bytes_after = storage.region_size(&policy.name)?;

  if evicted > 0 {
    info!(
      region = %policy.name,
      "Cache trimmed: {:.2}MB -> {:.2}MB",
      megabytes(bytes_before),
      megabytes(bytes_after)
    );
  }

  Ok(RegionSweep {
    region_name: policy.name.clone(),
    expired_removed,
    evicted,
    bytes_before,
    bytes_after,
  })
}

/// Delete every expired entry in the region. Returns how many were removed.
pub fn remove_expired<S: CacheStorage + ?Sized>(
  storage: &S,
  policy: &RegionPolicy,
  now_ms: i64,
) -> Result<usize> {
  let mut removed = 0;

  for entry in storage.entries(&policy.name)? {
    if !is_expired(entry.metadata.as_ref(), policy.expiry, now_ms) {
      continue;
    }
    // A concurrent store may have refreshed the row since it was listed
    if storage.delete_if_written_at(&policy.name, &entry.key, entry.written_at_ms)? {
      debug!(region = %policy.name, request = %entry.description, "Expired cache deleted");
      removed += 1;
    }
  }

  Ok(removed)
}

/// Delete oldest entries until the region fits its byte budget.
/// Returns how many entries were evicted.
pub fn enforce_budget<S: CacheStorage + ?Sized>(storage: &S, policy: &RegionPolicy) -> Result<usize> {
  let mut entries = storage.entries(&policy.name)?;
  let mut current: u64 = entries.iter().map(|e| e.size_bytes).sum();

  if current <= policy.byte_budget {
    return Ok(0);
  }

  // Stable sort: equal timestamps keep insertion order
  entries.sort_by_key(|e| e.written_at_ms.unwrap_or(0));

  let mut evicted = 0;
  for entry in entries {
    if current <= policy.byte_budget {
      break;
    }

    if storage.delete_if_written_at(&policy.name, &entry.key, entry.written_at_ms)? {
      debug!(
        region = %policy.name,
        request = %entry.description,
        size = entry.size_bytes,
        "Evicted cache entry"
      );
      evicted += 1;
    }
    current = current.saturating_sub(entry.size_bytes);
  }

  Ok(evicted)
}

fn megabytes(bytes: u64) -> f64 {
  bytes as f64 / 1024.0 / 1024.0
}
