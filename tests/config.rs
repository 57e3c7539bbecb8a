#![cfg(feature = "serde")]

use strata_cache::{CacheConfig, Strength};

use std::time::Duration;

#[test]
fn config_round_trips_through_bincode() {
  let config = CacheConfig {
    initial_capacity: 256,
    concurrency_level: Some(8),
    max_size: Some(50_000),
    key_strength: Strength::Strong,
    value_strength: Strength::Weak,
    time_to_live: Some(Duration::from_secs(300)),
    time_to_idle: None,
    janitor_period: Some(Duration::from_secs(30)),
    record_stats: true,
  };

  let bytes = bincode::serialize(&config).unwrap();
  let decoded: CacheConfig = bincode::deserialize(&bytes).unwrap();
  assert_eq!(decoded, config);
}

#[test]
fn default_config_is_an_unbounded_strong_cache() {
  let config = CacheConfig::default();
  assert_eq!(config.initial_capacity, 16);
  assert_eq!(config.concurrency_level, None);
  assert_eq!(config.max_size, None);
  assert_eq!(config.key_strength, Strength::Strong);
  assert_eq!(config.value_strength, Strength::Strong);
  assert_eq!(config.time_to_live, None);
  assert_eq!(config.time_to_idle, None);
  assert_eq!(config.janitor_period, None);
  assert!(!config.record_stats);
}
