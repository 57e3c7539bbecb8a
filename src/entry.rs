use crate::loader::LoadWaiter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use equivalent::Equivalent;
use generational_arena::Index;

/// How keys or values are held by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Strength {
  /// The table owns the key or value outright.
  #[default]
  Strong,
  /// The table holds a `std::sync::Weak`. The entry becomes reclaimable once
  /// every `Arc` handed out to callers has been dropped; the next operation
  /// that touches the segment removes it with cause `Collected`.
  Weak,
}

/// A key slot. The reference, once constructed, never changes, and the hash
/// computed at insertion time outlives a reclaimed weak key.
pub(crate) enum KeyRef<K> {
  Strong(Arc<K>),
  Weak(Weak<K>),
}

impl<K> KeyRef<K> {
  pub(crate) fn new(key: Arc<K>, strength: Strength) -> Self {
    match strength {
      Strength::Strong => KeyRef::Strong(key),
      Strength::Weak => KeyRef::Weak(Arc::downgrade(&key)),
    }
  }

  /// Returns the key, or `None` if the weak reference was reclaimed.
  pub(crate) fn get(&self) -> Option<Arc<K>> {
    match self {
      KeyRef::Strong(key) => Some(key.clone()),
      KeyRef::Weak(weak) => weak.upgrade(),
    }
  }

  pub(crate) fn is_live(&self) -> bool {
    match self {
      KeyRef::Strong(_) => true,
      KeyRef::Weak(weak) => weak.strong_count() > 0,
    }
  }

  /// Identity comparison, valid even after the referent is reclaimed. Used
  /// to correlate queue nodes and reclamation events with their entries.
  pub(crate) fn same_key(&self, other: &KeyRef<K>) -> bool {
    self.as_ptr() == other.as_ptr()
  }

  fn as_ptr(&self) -> *const K {
    match self {
      KeyRef::Strong(key) => Arc::as_ptr(key),
      KeyRef::Weak(weak) => weak.as_ptr(),
    }
  }
}

impl<K> std::fmt::Debug for KeyRef<K> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      KeyRef::Strong(_) => f.write_str("KeyRef::Strong"),
      KeyRef::Weak(_) => f.write_str("KeyRef::Weak"),
    }
  }
}

impl<K> Clone for KeyRef<K> {
  fn clone(&self) -> Self {
    match self {
      KeyRef::Strong(key) => KeyRef::Strong(key.clone()),
      KeyRef::Weak(weak) => KeyRef::Weak(weak.clone()),
    }
  }
}

/// A value slot. Swapped only under the segment's write lock. A loading slot
/// is never visible to readers as a real value; a read that encounters one
/// treats the key as absent unless it chooses to wait on the placeholder.
pub(crate) enum ValueSlot<V> {
  Strong(Arc<V>),
  Weak(Weak<V>),
  Loading(Arc<LoadWaiter<V>>),
}

impl<V> ValueSlot<V> {
  pub(crate) fn new(value: Arc<V>, strength: Strength) -> Self {
    match strength {
      Strength::Strong => ValueSlot::Strong(value),
      Strength::Weak => ValueSlot::Weak(Arc::downgrade(&value)),
    }
  }

  /// Returns the live value, or `None` if reclaimed or still loading.
  pub(crate) fn get(&self) -> Option<Arc<V>> {
    match self {
      ValueSlot::Strong(value) => Some(value.clone()),
      ValueSlot::Weak(weak) => weak.upgrade(),
      ValueSlot::Loading(_) => None,
    }
  }

  pub(crate) fn is_loading(&self) -> bool {
    matches!(self, ValueSlot::Loading(_))
  }

  pub(crate) fn waiter(&self) -> Option<&Arc<LoadWaiter<V>>> {
    match self {
      ValueSlot::Loading(waiter) => Some(waiter),
      _ => None,
    }
  }

  /// A weak slot whose referent has been dropped.
  pub(crate) fn is_collected(&self) -> bool {
    matches!(self, ValueSlot::Weak(weak) if weak.strong_count() == 0)
  }
}

/// A table slot: the key reference, its immutable hash, the value slot, the
/// singly linked bucket chain, and the entry's positions in the per-segment
/// policy queues.
pub(crate) struct Entry<K, V> {
  pub(crate) hash: u64,
  pub(crate) key: KeyRef<K>,
  pub(crate) value: ValueSlot<V>,
  pub(crate) next: Option<Box<Entry<K, V>>>,
  /// Nanosecond timestamp of the last value write. Only meaningful when
  /// expire-after-write is configured.
  pub(crate) write_time: u64,
  /// Nanosecond timestamp of the last read. Updated from the read path with
  /// a relaxed store, so no lock is required to mark an entry as used.
  pub(crate) access_time: AtomicU64,
  /// Node in the recency queue, when size eviction is configured.
  pub(crate) recency: Option<Index>,
  /// Node in the write-expiration queue, when expire-after-write is set.
  pub(crate) write_queue: Option<Index>,
  /// Node in the access-expiration queue, when expire-after-access is set.
  pub(crate) access_queue: Option<Index>,
}

impl<K, V> Entry<K, V> {
  pub(crate) fn new(
    hash: u64,
    key: KeyRef<K>,
    value: ValueSlot<V>,
    now: u64,
    next: Option<Box<Entry<K, V>>>,
  ) -> Self {
    Self {
      hash,
      key,
      value,
      next,
      write_time: now,
      access_time: AtomicU64::new(now),
      recency: None,
      write_queue: None,
      access_queue: None,
    }
  }

  /// Whether a caller's probe key matches this entry. Hash inequality
  /// short-circuits before the equivalence check; a reclaimed weak key
  /// matches nothing.
  pub(crate) fn matches<Q>(&self, hash: u64, key: &Q) -> bool
  where
    Q: Equivalent<K> + ?Sized,
  {
    if self.hash != hash {
      return false;
    }
    match self.key.get() {
      Some(stored) => key.equivalent(&stored),
      None => false,
    }
  }

  /// Marks the entry as just read. Cheap relaxed store, safe off-lock.
  #[inline]
  pub(crate) fn touch(&self, now: u64) {
    self.access_time.store(now, Ordering::Relaxed);
  }

  /// Checks the entry against the configured deadlines. A `None` axis is
  /// skipped; a zero duration expires the entry on the first check.
  pub(crate) fn is_expired(&self, now: u64, ttl_nanos: Option<u64>, tti_nanos: Option<u64>) -> bool {
    if let Some(ttl) = ttl_nanos {
      if now.saturating_sub(self.write_time) >= ttl {
        return true;
      }
    }
    if let Some(tti) = tti_nanos {
      if now.saturating_sub(self.access_time.load(Ordering::Relaxed)) >= tti {
        return true;
      }
    }
    false
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn weak_key_matches_nothing_after_drop() {
    let key = Arc::new("k".to_string());
    let entry: Entry<String, i32> = Entry::new(
      42,
      KeyRef::new(key.clone(), Strength::Weak),
      ValueSlot::new(Arc::new(1), Strength::Strong),
      0,
      None,
    );
    assert!(entry.matches(42, "k"));
    drop(key);
    assert!(!entry.matches(42, "k"));
    assert!(!entry.key.is_live());
  }

  #[test]
  fn hash_mismatch_short_circuits() {
    let entry: Entry<String, i32> = Entry::new(
      1,
      KeyRef::new(Arc::new("k".to_string()), Strength::Strong),
      ValueSlot::new(Arc::new(1), Strength::Strong),
      0,
      None,
    );
    assert!(!entry.matches(2, "k"));
  }

  #[test]
  fn zero_ttl_expires_immediately() {
    let entry: Entry<String, i32> = Entry::new(
      1,
      KeyRef::new(Arc::new("k".to_string()), Strength::Strong),
      ValueSlot::new(Arc::new(1), Strength::Strong),
      100,
      None,
    );
    assert!(entry.is_expired(100, Some(0), None));
    assert!(!entry.is_expired(100, Some(1), None));
  }

  #[test]
  fn collected_value_slot() {
    let value = Arc::new(5);
    let slot: ValueSlot<i32> = ValueSlot::new(value.clone(), Strength::Weak);
    assert_eq!(slot.get().as_deref(), Some(&5));
    assert!(!slot.is_collected());
    drop(value);
    assert!(slot.get().is_none());
    assert!(slot.is_collected());
  }
}
