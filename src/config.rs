use crate::entry::Strength;

use std::time::Duration;

/// Declarative cache configuration, typically deserialized from an
/// application's config file and handed to
/// [`CacheBuilder::from_config`](crate::CacheBuilder::from_config).
///
/// Programmatic concerns (loader, removal listener, ticker, hasher) have no
/// serializable form and stay on the builder.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
  /// Sizing hint for the initial bucket arrays.
  pub initial_capacity: usize,
  /// Number of independently locked segments. `None` derives it from the
  /// CPU count.
  pub concurrency_level: Option<usize>,
  /// Upper bound on live entries; the least recently used entry is evicted
  /// once it is exceeded.
  pub max_size: Option<u64>,
  pub key_strength: Strength,
  pub value_strength: Strength,
  /// Entries expire this long after their value was written.
  pub time_to_live: Option<Duration>,
  /// Entries expire this long after they were last read or written.
  pub time_to_idle: Option<Duration>,
  /// Period of the background maintenance thread. `None` leaves all
  /// maintenance to the cache's own read and write paths.
  pub janitor_period: Option<Duration>,
  pub record_stats: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      initial_capacity: 16,
      concurrency_level: None,
      max_size: None,
      key_strength: Strength::Strong,
      value_strength: Strength::Strong,
      time_to_live: None,
      time_to_idle: None,
      janitor_period: None,
      record_stats: false,
    }
  }
}
