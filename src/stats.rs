use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Accumulates statistics for a single segment of the cache.
///
/// Implementations must be thread-safe: events are recorded from many threads
/// without external synchronization. A fresh counter is created per segment
/// from the supplier configured at build time, so an instance never observes
/// events from two segments; `Cache::stats` merges the per-segment snapshots.
pub trait StatsCounter: Send + Sync {
  /// Records `count` cache hits.
  fn record_hits(&self, count: u64);
  /// Records `count` cache misses.
  fn record_misses(&self, count: u64);
  /// Records the successful load of a new value and the time it took.
  fn record_load_success(&self, load_time_nanos: u64);
  /// Records a failed load and the time spent before the failure surfaced.
  fn record_load_failure(&self, load_time_nanos: u64);
  /// Records the eviction of an entry by the size, expiration or
  /// reclamation policy.
  fn record_eviction(&self);
  /// Returns a point-in-time snapshot of this counter.
  fn snapshot(&self) -> CacheStats;
}

/// The default `StatsCounter`: cache-line padded atomics, lock-free updates.
#[derive(Debug, Default)]
pub struct ConcurrentStatsCounter {
  hits: CachePadded<AtomicU64>,
  misses: CachePadded<AtomicU64>,
  load_successes: CachePadded<AtomicU64>,
  load_failures: CachePadded<AtomicU64>,
  total_load_time: CachePadded<AtomicU64>,
  evictions: CachePadded<AtomicU64>,
}

impl ConcurrentStatsCounter {
  pub fn new() -> Self {
    Self::default()
  }
}

impl StatsCounter for ConcurrentStatsCounter {
  fn record_hits(&self, count: u64) {
    self.hits.fetch_add(count, Ordering::Relaxed);
  }

  fn record_misses(&self, count: u64) {
    self.misses.fetch_add(count, Ordering::Relaxed);
  }

  fn record_load_success(&self, load_time_nanos: u64) {
    self.load_successes.fetch_add(1, Ordering::Relaxed);
    self.total_load_time.fetch_add(load_time_nanos, Ordering::Relaxed);
  }

  fn record_load_failure(&self, load_time_nanos: u64) {
    self.load_failures.fetch_add(1, Ordering::Relaxed);
    self.total_load_time.fetch_add(load_time_nanos, Ordering::Relaxed);
  }

  fn record_eviction(&self) {
    self.evictions.fetch_add(1, Ordering::Relaxed);
  }

  fn snapshot(&self) -> CacheStats {
    CacheStats {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      load_successes: self.load_successes.load(Ordering::Relaxed),
      load_failures: self.load_failures.load(Ordering::Relaxed),
      total_load_time_nanos: self.total_load_time.load(Ordering::Relaxed),
      evictions: self.evictions.load(Ordering::Relaxed),
    }
  }
}

/// A `StatsCounter` that discards every event. The default when stats
/// recording has not been enabled on the builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatsCounter;

impl StatsCounter for NoopStatsCounter {
  fn record_hits(&self, _count: u64) {}
  fn record_misses(&self, _count: u64) {}
  fn record_load_success(&self, _load_time_nanos: u64) {}
  fn record_load_failure(&self, _load_time_nanos: u64) {}
  fn record_eviction(&self) {}

  fn snapshot(&self) -> CacheStats {
    CacheStats::default()
  }
}

/// An immutable snapshot of cumulative cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// The number of lookups that returned a cached value.
  pub hits: u64,
  /// The number of lookups that found no live, unexpired value.
  pub misses: u64,
  /// The number of loads that completed with a value.
  pub load_successes: u64,
  /// The number of loads that failed or panicked.
  pub load_failures: u64,
  /// Total nanoseconds spent in loader invocations.
  pub total_load_time_nanos: u64,
  /// The number of entries evicted by size, expiration or reclamation.
  pub evictions: u64,
}

impl CacheStats {
  /// The total number of lookups.
  pub fn request_count(&self) -> u64 {
    self.hits.saturating_add(self.misses)
  }

  /// The ratio of lookups that were hits, or `1.0` with no lookups yet.
  pub fn hit_rate(&self) -> f64 {
    let requests = self.request_count();
    if requests == 0 {
      1.0
    } else {
      self.hits as f64 / requests as f64
    }
  }

  /// Average nanoseconds per load, or `0.0` with no loads yet.
  pub fn average_load_penalty_nanos(&self) -> f64 {
    let loads = self.load_successes.saturating_add(self.load_failures);
    if loads == 0 {
      0.0
    } else {
      self.total_load_time_nanos as f64 / loads as f64
    }
  }

  /// Combines two snapshots field by field. Used to aggregate segments.
  pub fn merge(&self, other: &CacheStats) -> CacheStats {
    CacheStats {
      hits: self.hits.saturating_add(other.hits),
      misses: self.misses.saturating_add(other.misses),
      load_successes: self.load_successes.saturating_add(other.load_successes),
      load_failures: self.load_failures.saturating_add(other.load_failures),
      total_load_time_nanos: self
        .total_load_time_nanos
        .saturating_add(other.total_load_time_nanos),
      evictions: self.evictions.saturating_add(other.evictions),
    }
  }
}
