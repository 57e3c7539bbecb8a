use crate::error::LoadError;
use crate::iter::Iter;
use crate::janitor::Janitor;
use crate::loader::{BoxError, Loader};
use crate::segment::Segment;
use crate::stats::CacheStats;

use std::cell::RefCell;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use equivalent::Equivalent;
use parking_lot::Mutex;

/// The hasher used when none is supplied.
pub type DefaultHashBuilder = ahash::RandomState;

/// Final avalanche of a 64-bit mix; the high bits select the segment and the
/// low bits the bucket, so both must be well distributed.
#[inline]
fn spread(mut hash: u64) -> u64 {
  hash ^= hash >> 33;
  hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
  hash ^ (hash >> 33)
}

/// Everything behind the handle: the segment array, the hasher, the default
/// loader and the maintenance thread.
pub(crate) struct CacheShared<K, V, S> {
  pub(crate) segments: Box<[Segment<K, V>]>,
  /// Right shift applied to a spread hash to pick a segment by its high bits.
  segment_shift: u32,
  hasher: S,
  loader: Option<Loader<K, V>>,
  janitor: Mutex<Option<Janitor>>,
}

impl<K, V, S> CacheShared<K, V, S> {
  pub(crate) fn new(
    segments: Box<[Segment<K, V>]>,
    hasher: S,
    loader: Option<Loader<K, V>>,
  ) -> Self {
    debug_assert!(segments.len().is_power_of_two());
    let segment_shift = (64 - segments.len().trailing_zeros()).min(63);
    Self {
      segments,
      segment_shift,
      hasher,
      loader,
      janitor: Mutex::new(None),
    }
  }

  pub(crate) fn set_janitor(&self, janitor: Janitor) {
    *self.janitor.lock() = Some(janitor);
  }

  #[inline]
  fn segment_for(&self, hash: u64) -> &Segment<K, V> {
    let index = (hash >> self.segment_shift) as usize & (self.segments.len() - 1);
    &self.segments[index]
  }

  pub(crate) fn clean_up_all(&self) {
    for segment in self.segments.iter() {
      segment.clean_up();
    }
  }
}

impl<K, V, S> Drop for CacheShared<K, V, S> {
  fn drop(&mut self) {
    if let Some(mut janitor) = self.janitor.lock().take() {
      janitor.stop();
    }
  }
}

/// A concurrent cache, striped into independently locked segments.
///
/// The handle is cheap to clone; clones share the same table. Values are
/// returned as `Arc<V>` so lookups never copy the value and weakly held
/// values can outlive their table entry while a caller still uses them.
///
/// Built via [`CacheBuilder`](crate::CacheBuilder).
pub struct Cache<K, V, S = DefaultHashBuilder> {
  shared: Arc<CacheShared<K, V, S>>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<K, V, S> Cache<K, V, S> {
  pub(crate) fn from_shared(shared: Arc<CacheShared<K, V, S>>) -> Self {
    Self { shared }
  }

  /// Approximate number of live entries. Loading placeholders are not
  /// counted; entries awaiting reclamation or expiration may still be.
  pub fn len(&self) -> usize {
    self.shared.segments.iter().map(|s| s.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Removes every entry, delivering an `Explicit` notification for each.
  pub fn clear(&self) {
    for segment in self.shared.segments.iter() {
      segment.clear();
    }
  }

  /// Runs pending maintenance on all segments: drains the read-path
  /// buffers, expires overdue entries and sweeps dead weak references.
  pub fn clean_up(&self) {
    self.shared.clean_up_all();
  }

  /// Aggregated statistics across all segments. All zeros unless the cache
  /// was built with stats recording.
  pub fn stats(&self) -> CacheStats {
    self
      .shared
      .segments
      .iter()
      .map(|s| s.stats_snapshot())
      .fold(CacheStats::default(), |acc, s| acc.merge(&s))
  }
}

impl<K, V, S> Cache<K, V, S>
where
  K: Eq + Hash,
  S: BuildHasher,
{
  fn hash<Q>(&self, key: &Q) -> u64
  where
    Q: Hash + ?Sized,
  {
    let mut hasher = self.shared.hasher.build_hasher();
    key.hash(&mut hasher);
    spread(hasher.finish())
  }

  /// Looks up a key, recording a hit or miss and marking the entry as
  /// recently used. Expired and reclaimed entries read as absent.
  pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    let hash = self.hash(key);
    self.shared.segment_for(hash).get(hash, key)
  }

  /// Looks up a key without touching statistics or recency state.
  pub fn peek<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    let hash = self.hash(key);
    self.shared.segment_for(hash).peek(hash, key)
  }

  pub fn contains_key<Q>(&self, key: &Q) -> bool
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    self.peek(key).is_some()
  }

  /// Inserts a key/value pair, returning the live value it displaced.
  ///
  /// With weak values, prefer [`insert_shared`](Self::insert_shared): this
  /// method wraps `value` in a fresh `Arc` that the table does not keep
  /// alive, so the entry is immediately reclaimable.
  pub fn insert(&self, key: K, value: V) -> Option<Arc<V>> {
    self.insert_shared(Arc::new(key), Arc::new(value))
  }

  /// Inserts an already-shared pair. The caller's `Arc`s keep weakly held
  /// keys and values alive for as long as it retains them.
  pub fn insert_shared(&self, key: Arc<K>, value: Arc<V>) -> Option<Arc<V>> {
    let hash = self.hash(&*key);
    self.shared.segment_for(hash).insert(hash, key, value, false)
  }

  /// Inserts only if the key is absent (or expired, or reclaimed). Returns
  /// the existing live value when one is present.
  pub fn insert_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
    let key = Arc::new(key);
    let hash = self.hash(&*key);
    self
      .shared
      .segment_for(hash)
      .insert(hash, key, Arc::new(value), true)
  }

  /// Removes a key, returning the live value it held. Delivers an
  /// `Explicit` notification.
  pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    let hash = self.hash(key);
    self.shared.segment_for(hash).remove(hash, key)
  }

  /// Removes the entry only if its live value equals `expected`. Returns
  /// whether a removal occurred.
  pub fn remove_if<Q>(&self, key: &Q, expected: &V) -> bool
  where
    Q: Hash + Equivalent<K> + ?Sized,
    V: PartialEq,
  {
    let hash = self.hash(key);
    self.shared.segment_for(hash).remove_if(hash, key, expected)
  }

  /// Returns the cached value, loading it with the builder's loader on a
  /// miss. Concurrent callers for the same key share one load: one thread
  /// runs the loader, the rest block until it completes. A failure is
  /// delivered to every waiting caller and is not cached.
  pub fn get_with(&self, key: K) -> Result<Arc<V>, LoadError> {
    let Some(loader) = self.shared.loader.clone() else {
      return Err(LoadError::NoLoader);
    };
    let key = Arc::new(key);
    let hash = self.hash(&*key);
    self.shared.segment_for(hash).get_or_load(hash, key, &*loader)
  }

  /// Like [`get_with`](Self::get_with), but loads with the given closure
  /// instead of the builder's loader. The closure runs at most once, and
  /// only if this caller wins the load.
  pub fn try_get_with<F>(&self, key: K, init: F) -> Result<Arc<V>, LoadError>
  where
    F: FnOnce(&K) -> Result<V, BoxError>,
  {
    let slot = RefCell::new(Some(init));
    let loader = |key: &K| -> Result<V, BoxError> {
      let init = slot
        .borrow_mut()
        .take()
        .expect("single-use loader invoked twice");
      init(key)
    };
    let key = Arc::new(key);
    let hash = self.hash(&*key);
    self.shared.segment_for(hash).get_or_load(hash, key, &loader)
  }

  /// Weakly consistent iteration over live, unexpired entries. Reflects
  /// some state of each segment at the time it is visited; entries mutated
  /// concurrently may or may not be observed.
  pub fn iter(&self) -> Iter<K, V, S> {
    Iter::new(self.shared.clone())
  }
}

impl<K, V, S> fmt::Debug for Cache<K, V, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cache")
      .field("segments", &self.shared.segments.len())
      .field("len", &self.len())
      .finish()
  }
}

/// Distributes a cache-wide size bound across segments. Earlier segments
/// absorb the remainder so the shares sum exactly to `max`.
pub(crate) fn segment_max_shares(max: u64, segments: usize) -> Vec<u64> {
  let base = max / segments as u64;
  let remainder = (max % segments as u64) as usize;
  (0..segments)
    .map(|i| if i < remainder { base + 1 } else { base })
    .collect()
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn spread_changes_low_and_high_bits() {
    let a = spread(1);
    let b = spread(2);
    assert_ne!(a, b);
    assert_ne!(a >> 32, b >> 32, "high bits must differ for segment choice");
  }

  #[test]
  fn max_share_distribution_sums_to_total() {
    for (max, segments) in [(10u64, 4usize), (7, 4), (1, 8), (0, 2), (100, 1)] {
      let shares = segment_max_shares(max, segments);
      assert_eq!(shares.len(), segments);
      assert_eq!(shares.iter().sum::<u64>(), max);
    }
  }
}
