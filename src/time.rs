use once_cell::sync::Lazy;
use std::time::Instant;

// The single, static reference point for all time calculations in the cache.
// It is initialized lazily on its first use.
static CACHE_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A monotonic nanosecond time source used for expiration deadlines.
///
/// Implementations must never move backwards. The cache reads the ticker on
/// every lookup and write that involves an expiration policy, so `now` should
/// be cheap. Tests substitute a manually advanced ticker to simulate the
/// passage of time.
pub trait Ticker: Send + Sync {
  /// Returns the current time in nanoseconds from an arbitrary fixed origin.
  fn now(&self) -> u64;
}

/// The default `Ticker`, backed by `Instant` measured against a lazy epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTicker;

impl Ticker for SystemTicker {
  #[inline]
  fn now(&self) -> u64 {
    Instant::now().saturating_duration_since(*CACHE_EPOCH).as_nanos() as u64
  }
}
