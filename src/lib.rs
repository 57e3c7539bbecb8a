//! A concurrent, segment-striped caching map.
//!
//! The table is split into independently locked segments, so operations on
//! different keys rarely contend and lookups take only a shared lock.
//! Beyond a plain map, a cache can be configured with:
//!
//! - **Size-based eviction**: a [`maximum_size`](CacheBuilder::maximum_size)
//!   bound, enforced per segment in least-recently-used order.
//! - **Expiration**: a fixed [`time_to_live`](CacheBuilder::time_to_live)
//!   after each write, an idle [`time_to_idle`](CacheBuilder::time_to_idle)
//!   after each access, or both.
//! - **Weak references**: keys and values held through [`std::sync::Weak`],
//!   so entries whose referent is dropped elsewhere are reclaimed instead of
//!   pinned (see [`Strength`]).
//! - **Loading**: [`Cache::get_with`] computes missing values with at most
//!   one load in flight per key; concurrent callers share the result.
//! - **Removal notifications**: a [`RemovalListener`] observes every removal
//!   together with its [`RemovalCause`].
//! - **Statistics**: hit, miss, load and eviction counters behind
//!   [`record_stats`](CacheBuilder::record_stats).
//!
//! Expired and reclaimed entries stop being visible immediately, but are
//! physically removed by small amounts of maintenance piggybacked on normal
//! reads and writes (and, optionally, by a background
//! [janitor](CacheBuilder::janitor_period) thread). Sizes and iteration are
//! therefore weakly consistent.
//!
//! ```
//! use strata_cache::CacheBuilder;
//! use std::time::Duration;
//!
//! let cache = CacheBuilder::new()
//!   .maximum_size(1024)
//!   .time_to_idle(Duration::from_secs(600))
//!   .build()
//!   .unwrap();
//!
//! cache.insert("alpha", 1u64);
//! assert_eq!(cache.get("alpha").as_deref(), Some(&1));
//! assert_eq!(cache.get("beta"), None);
//! ```

mod builder;
mod cache;
mod config;
mod entry;
mod error;
mod iter;
mod janitor;
mod listener;
mod loader;
mod queues;
mod reclaim;
mod segment;
mod stats;
mod time;

pub use equivalent::Equivalent;

pub use builder::CacheBuilder;
pub use cache::{Cache, DefaultHashBuilder};
pub use config::CacheConfig;
pub use entry::Strength;
pub use error::{BuildError, LoadError};
pub use iter::Iter;
pub use listener::{RemovalCause, RemovalListener, RemovalNotification};
pub use loader::{BoxError, Loader};
pub use stats::{CacheStats, ConcurrentStatsCounter, NoopStatsCounter, StatsCounter};
pub use time::{SystemTicker, Ticker};
