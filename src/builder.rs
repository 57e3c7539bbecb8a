use crate::cache::{segment_max_shares, Cache, CacheShared, DefaultHashBuilder};
use crate::config::CacheConfig;
use crate::entry::Strength;
use crate::error::BuildError;
use crate::janitor::Janitor;
use crate::listener::RemovalListener;
use crate::loader::{BoxError, Loader};
use crate::segment::{Segment, SegmentConfig};
use crate::stats::{ConcurrentStatsCounter, NoopStatsCounter, StatsCounter};
use crate::time::{SystemTicker, Ticker};

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

type StatsSupplier = Arc<dyn Fn() -> Box<dyn StatsCounter> + Send + Sync>;

/// Configures and constructs a [`Cache`].
///
/// ```
/// use strata_cache::CacheBuilder;
/// use std::time::Duration;
///
/// let cache = CacheBuilder::new()
///   .maximum_size(10_000)
///   .time_to_live(Duration::from_secs(300))
///   .build()
///   .unwrap();
/// cache.insert("key", 42u32);
/// assert_eq!(cache.get("key").as_deref(), Some(&42));
/// ```
pub struct CacheBuilder<K, V, S = DefaultHashBuilder> {
  initial_capacity: usize,
  concurrency_level: Option<usize>,
  max_size: Option<u64>,
  key_strength: Strength,
  value_strength: Strength,
  ttl: Option<Duration>,
  tti: Option<Duration>,
  ticker: Option<Arc<dyn Ticker>>,
  listener: Option<Arc<dyn RemovalListener<K, V>>>,
  stats_supplier: Option<StatsSupplier>,
  loader: Option<Loader<K, V>>,
  janitor_period: Option<Duration>,
  hasher: S,
}

impl<K, V> CacheBuilder<K, V, DefaultHashBuilder> {
  pub fn new() -> Self {
    Self::with_hasher(DefaultHashBuilder::default())
  }

  /// Seeds a builder from a declarative [`CacheConfig`]. Programmatic
  /// pieces (loader, listener, ticker) are layered on afterwards.
  pub fn from_config(config: CacheConfig) -> Self {
    let mut builder = Self::new()
      .initial_capacity(config.initial_capacity)
      .key_strength(config.key_strength)
      .value_strength(config.value_strength);
    builder.concurrency_level = config.concurrency_level;
    builder.max_size = config.max_size;
    builder.ttl = config.time_to_live;
    builder.tti = config.time_to_idle;
    builder.janitor_period = config.janitor_period;
    if config.record_stats {
      builder = builder.record_stats();
    }
    builder
  }
}

impl<K, V> Default for CacheBuilder<K, V, DefaultHashBuilder> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, S> CacheBuilder<K, V, S> {
  pub fn with_hasher(hasher: S) -> Self {
    Self {
      initial_capacity: 16,
      concurrency_level: None,
      max_size: None,
      key_strength: Strength::Strong,
      value_strength: Strength::Strong,
      ttl: None,
      tti: None,
      ticker: None,
      listener: None,
      stats_supplier: None,
      loader: None,
      janitor_period: None,
      hasher,
    }
  }

  /// Swaps the hash builder, keeping every other setting.
  pub fn hasher<S2>(self, hasher: S2) -> CacheBuilder<K, V, S2> {
    CacheBuilder {
      initial_capacity: self.initial_capacity,
      concurrency_level: self.concurrency_level,
      max_size: self.max_size,
      key_strength: self.key_strength,
      value_strength: self.value_strength,
      ttl: self.ttl,
      tti: self.tti,
      ticker: self.ticker,
      listener: self.listener,
      stats_supplier: self.stats_supplier,
      loader: self.loader,
      janitor_period: self.janitor_period,
      hasher,
    }
  }

  /// Sizing hint for the initial bucket arrays, spread across segments.
  pub fn initial_capacity(mut self, capacity: usize) -> Self {
    self.initial_capacity = capacity;
    self
  }

  /// Number of independently locked segments, rounded up to a power of two.
  /// Defaults to four times the CPU count. Must be at least one.
  pub fn concurrency_level(mut self, level: usize) -> Self {
    self.concurrency_level = Some(level);
    self
  }

  /// Bounds the cache: once exceeded, the least recently used entry is
  /// evicted with cause `Size`. A bound of zero evicts every insert
  /// immediately.
  pub fn maximum_size(mut self, max: u64) -> Self {
    self.max_size = Some(max);
    self
  }

  pub fn key_strength(mut self, strength: Strength) -> Self {
    self.key_strength = strength;
    self
  }

  pub fn value_strength(mut self, strength: Strength) -> Self {
    self.value_strength = strength;
    self
  }

  /// Holds keys weakly: an entry whose key `Arc` is dropped everywhere else
  /// is reclaimed with cause `Collected`. Use
  /// [`Cache::insert_shared`](crate::Cache::insert_shared) so the caller
  /// keeps the key alive.
  pub fn weak_keys(self) -> Self {
    self.key_strength(Strength::Weak)
  }

  /// Holds values weakly; see [`weak_keys`](Self::weak_keys).
  pub fn weak_values(self) -> Self {
    self.value_strength(Strength::Weak)
  }

  /// Entries expire this long after their value was written.
  /// A zero duration expires entries immediately.
  pub fn time_to_live(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  /// Entries expire this long after they were last read or written.
  pub fn time_to_idle(mut self, tti: Duration) -> Self {
    self.tti = Some(tti);
    self
  }

  /// Supplies the time source used for expiration. Tests substitute a
  /// manually advanced ticker here.
  pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
    self.ticker = Some(ticker);
    self
  }

  /// Registers a listener invoked once per removed entry, after the
  /// segment lock is released. A panicking listener is contained and the
  /// cache keeps working.
  pub fn removal_listener(mut self, listener: impl RemovalListener<K, V> + 'static) -> Self {
    self.listener = Some(Arc::new(listener));
    self
  }

  /// Records hit, miss, load and eviction statistics with the default
  /// concurrent counter. Off by default: the no-op counter costs nothing.
  pub fn record_stats(mut self) -> Self {
    self.stats_supplier = Some(Arc::new(|| Box::new(ConcurrentStatsCounter::new())));
    self
  }

  /// Supplies a custom statistics counter; one instance is created per
  /// segment.
  pub fn stats_counter(
    mut self,
    supplier: impl Fn() -> Box<dyn StatsCounter> + Send + Sync + 'static,
  ) -> Self {
    self.stats_supplier = Some(Arc::new(supplier));
    self
  }

  /// Default loader backing [`Cache::get_with`](crate::Cache::get_with).
  pub fn loader(mut self, loader: impl Fn(&K) -> Result<V, BoxError> + Send + Sync + 'static) -> Self {
    self.loader = Some(Arc::new(loader));
    self
  }

  /// Starts a background thread that runs cleanup at this period, so
  /// expiration and reclamation make progress without traffic.
  pub fn janitor_period(mut self, period: Duration) -> Self {
    self.janitor_period = Some(period);
    self
  }

  pub fn build(self) -> Result<Cache<K, V, S>, BuildError>
  where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
  {
    let segment_count = match self.concurrency_level {
      Some(0) => return Err(BuildError::ZeroConcurrency),
      Some(level) => level.next_power_of_two(),
      None => (num_cpus::get() * 4).max(1).next_power_of_two(),
    };
    let buckets_per_segment = (self.initial_capacity / segment_count)
      .max(1)
      .next_power_of_two();
    let shares = self.max_size.map(|max| segment_max_shares(max, segment_count));

    let cfg = Arc::new(SegmentConfig {
      key_strength: self.key_strength,
      value_strength: self.value_strength,
      ttl_nanos: self.ttl.map(duration_nanos),
      tti_nanos: self.tti.map(duration_nanos),
      ticker: self.ticker.unwrap_or_else(|| Arc::new(SystemTicker)),
    });
    let stats_supplier = self
      .stats_supplier
      .unwrap_or_else(|| Arc::new(|| Box::new(NoopStatsCounter)));

    let segments = (0..segment_count)
      .map(|i| {
        Segment::new(
          cfg.clone(),
          buckets_per_segment,
          shares.as_ref().map(|s| s[i]),
          stats_supplier(),
          self.listener.clone(),
        )
      })
      .collect::<Vec<_>>()
      .into_boxed_slice();

    let shared = Arc::new(CacheShared::new(segments, self.hasher, self.loader));
    if let Some(period) = self.janitor_period {
      shared.set_janitor(Janitor::start(Arc::downgrade(&shared), period));
    }
    Ok(Cache::from_shared(shared))
  }
}

fn duration_nanos(duration: Duration) -> u64 {
  u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn rejects_zero_concurrency() {
    let result = CacheBuilder::<u32, u32>::new().concurrency_level(0).build();
    assert_eq!(result.err(), Some(BuildError::ZeroConcurrency));
  }

  #[test]
  fn config_round_trips_through_builder() {
    let config = CacheConfig {
      initial_capacity: 64,
      concurrency_level: Some(2),
      max_size: Some(1000),
      time_to_live: Some(Duration::from_secs(60)),
      record_stats: true,
      ..CacheConfig::default()
    };
    let cache = CacheBuilder::<String, String>::from_config(config)
      .build()
      .unwrap();
    assert!(cache.is_empty());
    // Stats recording was enabled by the config.
    cache.get("absent");
    assert_eq!(cache.stats().misses, 1);
  }
}
