use crate::entry::{Entry, KeyRef, Strength, ValueSlot};
use crate::error::LoadError;
use crate::listener::{RemovalCause, RemovalListener, RemovalNotification};
use crate::loader::{BoxError, LoadOutcome, LoadWaiter};
use crate::reclaim::EventBuffer;
use crate::queues::KeyQueue;
use crate::stats::StatsCounter;
use crate::time::Ticker;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use equivalent::Equivalent;
use parking_lot::RwLock;

/// Mask applied to the per-segment read counter; reads that land on zero
/// attempt an opportunistic locked cleanup.
const READ_DRAIN_MASK: u64 = 63;

/// Capacity of the buffers feeding recency and reclamation events from the
/// read path into the locked maintenance path.
const EVENT_BUFFER_CAPACITY: usize = 128;

/// Hard ceiling on a single segment's bucket array.
const MAX_SEGMENT_BUCKETS: usize = 1 << 30;

type Bucket<K, V> = Option<Box<Entry<K, V>>>;

/// Static configuration shared by every segment of one cache. Fixed at
/// construction.
pub(crate) struct SegmentConfig {
  pub(crate) key_strength: Strength,
  pub(crate) value_strength: Strength,
  pub(crate) ttl_nanos: Option<u64>,
  pub(crate) tti_nanos: Option<u64>,
  pub(crate) ticker: Arc<dyn Ticker>,
}

/// The lock-guarded portion of a segment: the bucket array and the policy
/// queues. All fields are mutated only under the segment's write lock.
struct Table<K, V> {
  buckets: Box<[Bucket<K, V>]>,
  /// Entries holding a real (non-loading) value slot.
  count: usize,
  /// Bumped on every structural mutation.
  mod_count: u64,
  /// Resize when `count` would cross this (3/4 of the bucket count).
  threshold: usize,
  /// Head = most recently used; tail is the size-eviction victim.
  recency: KeyQueue<K>,
  /// Ordered by write time; tail is the oldest write.
  write_queue: KeyQueue<K>,
  /// Ordered by access time; tail is the least recently read.
  access_queue: KeyQueue<K>,
}

impl<K, V> Table<K, V> {
  fn new(initial_buckets: usize) -> Self {
    let len = initial_buckets.next_power_of_two().max(1);
    Self {
      buckets: (0..len).map(|_| None).collect::<Vec<_>>().into_boxed_slice(),
      count: 0,
      mod_count: 0,
      threshold: len * 3 / 4,
      recency: KeyQueue::new(),
      write_queue: KeyQueue::new(),
      access_queue: KeyQueue::new(),
    }
  }

  #[inline]
  fn bucket_index(&self, hash: u64) -> usize {
    (hash as usize) & (self.buckets.len() - 1)
  }
}

// Position of the first chain entry satisfying `pred`.
fn position_where<K, V>(bucket: &Bucket<K, V>, pred: impl Fn(&Entry<K, V>) -> bool) -> Option<usize> {
  std::iter::successors(bucket.as_deref(), |e| e.next.as_deref()).position(|e| pred(e))
}

fn entry_at<'a, K, V>(bucket: &'a Bucket<K, V>, n: usize) -> &'a Entry<K, V> {
  let mut entry = bucket.as_deref().expect("bucket position out of range");
  for _ in 0..n {
    entry = entry.next.as_deref().expect("bucket position out of range");
  }
  entry
}

fn entry_at_mut<'a, K, V>(bucket: &'a mut Bucket<K, V>, n: usize) -> &'a mut Entry<K, V> {
  let mut entry = bucket.as_deref_mut().expect("bucket position out of range");
  for _ in 0..n {
    entry = entry.next.as_deref_mut().expect("bucket position out of range");
  }
  entry
}

// Unlinks the first chain entry satisfying `pred`, rebuilding the chain.
// Bucket chains are unordered, so the rebuild is free to reverse them.
fn unlink_where<K, V>(
  bucket: &mut Bucket<K, V>,
  pred: impl Fn(&Entry<K, V>) -> bool,
) -> Option<Box<Entry<K, V>>> {
  let mut chain = bucket.take();
  let mut kept: Bucket<K, V> = None;
  let mut unlinked = None;
  while let Some(mut entry) = chain {
    chain = entry.next.take();
    if unlinked.is_none() && pred(&entry) {
      unlinked = Some(entry);
    } else {
      entry.next = kept;
      kept = Some(entry);
    }
  }
  *bucket = kept;
  unlinked
}

/// One independently locked shard of the table.
///
/// Lookups take only the shared lock and therefore run fully in parallel;
/// every structural mutation serializes on the exclusive lock. Work
/// discovered on the read path (recency updates, dead weak references) is
/// buffered and applied by the next writer.
pub(crate) struct Segment<K, V> {
  table: RwLock<Table<K, V>>,
  /// Mirror of `Table::count`, readable without the lock.
  count: AtomicUsize,
  read_count: AtomicU64,
  recency_buffer: EventBuffer<K>,
  reclaim_queue: EventBuffer<K>,
  /// This segment's share of the cache's maximum size, if bounded.
  max_size: Option<u64>,
  stats: Box<dyn StatsCounter>,
  listener: Option<Arc<dyn RemovalListener<K, V>>>,
  cfg: Arc<SegmentConfig>,
}

impl<K, V> Segment<K, V> {
  pub(crate) fn new(
    cfg: Arc<SegmentConfig>,
    initial_buckets: usize,
    max_size: Option<u64>,
    stats: Box<dyn StatsCounter>,
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
  ) -> Self {
    Self {
      table: RwLock::new(Table::new(initial_buckets)),
      count: AtomicUsize::new(0),
      read_count: AtomicU64::new(0),
      recency_buffer: EventBuffer::new(EVENT_BUFFER_CAPACITY),
      reclaim_queue: EventBuffer::new(EVENT_BUFFER_CAPACITY),
      max_size,
      stats,
      listener,
      cfg,
    }
  }

  /// Live entry count. Approximate under concurrent mutation: the mirror is
  /// published with relaxed stores by writers.
  pub(crate) fn len(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  pub(crate) fn stats_snapshot(&self) -> crate::stats::CacheStats {
    self.stats.snapshot()
  }

  /// Lock-free lookup. Records a hit or miss, marks the entry as recently
  /// used via the recency buffer, and treats collected, expired and loading
  /// slots as absent.
  pub(crate) fn get<Q>(&self, hash: u64, key: &Q) -> Option<Arc<V>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let now = self.cfg.ticker.now();
    let result = {
      let t = self.table.read();
      self.find_live(&t, hash, key, now, true)
    };
    if result.is_some() {
      self.stats.record_hits(1);
    } else {
      self.stats.record_misses(1);
    }
    self.post_read_cleanup();
    result
  }

  /// Lookup without recording stats or touching recency/expiration state.
  pub(crate) fn peek<Q>(&self, hash: u64, key: &Q) -> Option<Arc<V>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let now = self.cfg.ticker.now();
    let t = self.table.read();
    self.find_live(&t, hash, key, now, false)
  }

  // The shared walk behind `get` and `peek`. With `record` set, marks the
  // entry as used and feeds the reclamation queue with dead references it
  // passes over.
  fn find_live<Q>(&self, t: &Table<K, V>, hash: u64, key: &Q, now: u64, record: bool) -> Option<Arc<V>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let bucket = &t.buckets[t.bucket_index(hash)];
    let mut cursor = bucket.as_deref();
    while let Some(entry) = cursor {
      if entry.hash == hash {
        if !entry.key.is_live() {
          if record {
            self.reclaim_queue.offer(hash, entry.key.clone());
          }
        } else if entry.matches(hash, key) {
          return match entry.value.get() {
            Some(value) if !entry.is_expired(now, self.cfg.ttl_nanos, self.cfg.tti_nanos) => {
              if record {
                entry.touch(now);
                if self.max_size.is_some() || self.cfg.tti_nanos.is_some() {
                  self.recency_buffer.offer(hash, entry.key.clone());
                }
              }
              Some(value)
            }
            // Expired: removed by the next locked cleanup.
            Some(_) => None,
            None => {
              if record && entry.value.is_collected() {
                self.reclaim_queue.offer(hash, entry.key.clone());
              }
              // Collected or still loading.
              None
            }
          };
        }
      }
      cursor = entry.next.as_deref();
    }
    None
  }

  /// Explicit removal. Loading placeholders and already-collected entries
  /// are treated as absent.
  pub(crate) fn remove<Q>(&self, hash: u64, key: &Q) -> Option<Arc<V>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let now = self.cfg.ticker.now();
    let mut removed = Vec::new();
    let result;
    {
      let mut t = self.table.write();
      self.run_locked_cleanup(&mut t, now, &mut removed);
      result = self.remove_matching(&mut t, hash, key, None, &mut removed);
      self.count.store(t.count, Ordering::Relaxed);
    }
    self.dispatch(removed);
    result
  }

  /// Conditional removal: unlinks only if the live value equals `expected`.
  /// Returns whether a removal occurred.
  pub(crate) fn remove_if<Q>(&self, hash: u64, key: &Q, expected: &V) -> bool
  where
    Q: Equivalent<K> + ?Sized,
    V: PartialEq,
  {
    let now = self.cfg.ticker.now();
    let mut removed = Vec::new();
    let result;
    {
      let mut t = self.table.write();
      self.run_locked_cleanup(&mut t, now, &mut removed);
      let matches_expected = |v: &V| *v == *expected;
      result = self
        .remove_matching(&mut t, hash, key, Some(&matches_expected), &mut removed)
        .is_some();
      self.count.store(t.count, Ordering::Relaxed);
    }
    self.dispatch(removed);
    result
  }

  fn remove_matching<Q>(
    &self,
    t: &mut Table<K, V>,
    hash: u64,
    key: &Q,
    expected: Option<&dyn Fn(&V) -> bool>,
    removed: &mut Vec<RemovalNotification<K, V>>,
  ) -> Option<Arc<V>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let bucket = t.bucket_index(hash);
    let pos = position_where(&t.buckets[bucket], |e| e.matches(hash, key))?;
    let (value, is_loading, identity) = {
      let entry = entry_at(&t.buckets[bucket], pos);
      (entry.value.get(), entry.value.is_loading(), entry.key.clone())
    };
    match value {
      Some(value) => {
        if let Some(expected) = expected {
          // Value equality required for the conditional form.
          if !expected(&value) {
            return None;
          }
        }
        let entry = unlink_where(&mut t.buckets[bucket], |e| e.key.same_key(&identity))
          .expect("entry vanished under the write lock");
        self.finish_removal(t, entry, RemovalCause::Explicit, removed);
        Some(value)
      }
      None if is_loading => {
        // A load is in flight; the key is observably absent. Leave the
        // placeholder so the loading coordinator keeps its one-per-key
        // guarantee.
        None
      }
      None => {
        // Collected value: physically unlink now rather than waiting for a
        // reclamation drain.
        let entry = unlink_where(&mut t.buckets[bucket], |e| e.key.same_key(&identity))
          .expect("entry vanished under the write lock");
        self.finish_removal(t, entry, RemovalCause::Collected, removed);
        None
      }
    }
  }

  /// Removes every entry, notifying `Explicit` for each one that held a
  /// real value.
  pub(crate) fn clear(&self) {
    let mut removed = Vec::new();
    {
      let mut t = self.table.write();
      for i in 0..t.buckets.len() {
        let mut chain = t.buckets[i].take();
        while let Some(mut entry) = chain {
          chain = entry.next.take();
          if !entry.value.is_loading() {
            removed.push(RemovalNotification {
              key: entry.key.get(),
              value: entry.value.get(),
              cause: RemovalCause::Explicit,
            });
          }
        }
      }
      t.recency.clear();
      t.write_queue.clear();
      t.access_queue.clear();
      t.count = 0;
      t.mod_count += 1;
      self.count.store(0, Ordering::Relaxed);
      // Stale buffered events reference unlinked entries; drop them.
      while self.reclaim_queue.try_next().is_some() {}
      while self.recency_buffer.try_next().is_some() {}
    }
    self.dispatch(removed);
  }

  /// Drains the buffers, expires overdue entries, and sweeps the whole
  /// segment for dead weak references the read path has not observed yet.
  pub(crate) fn clean_up(&self) {
    let now = self.cfg.ticker.now();
    let mut removed = Vec::new();
    {
      let mut t = self.table.write();
      self.run_locked_cleanup(&mut t, now, &mut removed);
      self.sweep_collected(&mut t, &mut removed);
      self.count.store(t.count, Ordering::Relaxed);
    }
    self.dispatch(removed);
  }

  /// Snapshot of the live, unexpired entries. Used by iteration; weakly
  /// consistent with concurrent mutation.
  pub(crate) fn live_entries(&self) -> Vec<(Arc<K>, Arc<V>)> {
    let now = self.cfg.ticker.now();
    let t = self.table.read();
    let mut entries = Vec::with_capacity(t.count);
    for bucket in t.buckets.iter() {
      let mut cursor = bucket.as_deref();
      while let Some(entry) = cursor {
        if !entry.is_expired(now, self.cfg.ttl_nanos, self.cfg.tti_nanos) {
          if let (Some(key), Some(value)) = (entry.key.get(), entry.value.get()) {
            entries.push((key, value));
          }
        }
        cursor = entry.next.as_deref();
      }
    }
    entries
  }

  // --- locked maintenance ---

  fn post_read_cleanup(&self) {
    if self.read_count.fetch_add(1, Ordering::Relaxed) & READ_DRAIN_MASK == 0 {
      self.try_clean_up();
    }
  }

  // Best-effort cleanup: skips entirely when another writer holds the lock.
  fn try_clean_up(&self) {
    let now = self.cfg.ticker.now();
    let mut removed = Vec::new();
    if let Some(mut t) = self.table.try_write() {
      self.run_locked_cleanup(&mut t, now, &mut removed);
      self.count.store(t.count, Ordering::Relaxed);
    }
    self.dispatch(removed);
  }

  // Runs at the start of every locked operation: reclaim drains first, then
  // deferred recency updates, then expiration.
  fn run_locked_cleanup(
    &self,
    t: &mut Table<K, V>,
    now: u64,
    removed: &mut Vec<RemovalNotification<K, V>>,
  ) {
    self.drain_reclaim_queue(t, removed);
    self.drain_recency_buffer(t);
    self.expire_entries(t, now, removed);
  }

  // Physically unlinks entries whose weak key or value was observed dead.
  // An entry may have been removed or rewritten since the observation was
  // queued, in which case the event is a no-op.
  fn drain_reclaim_queue(&self, t: &mut Table<K, V>, removed: &mut Vec<RemovalNotification<K, V>>) {
    while let Some((hash, identity)) = self.reclaim_queue.try_next() {
      let bucket = t.bucket_index(hash);
      let still_dead = position_where(&t.buckets[bucket], |e| e.key.same_key(&identity))
        .map(|pos| {
          let entry = entry_at(&t.buckets[bucket], pos);
          !entry.key.is_live() || entry.value.is_collected()
        })
        .unwrap_or(false);
      if still_dead {
        let entry = unlink_where(&mut t.buckets[bucket], |e| e.key.same_key(&identity))
          .expect("entry vanished under the write lock");
        self.finish_removal(t, entry, RemovalCause::Collected, removed);
      }
    }
  }

  // Applies deferred "recently used" marks from the read path.
  fn drain_recency_buffer(&self, t: &mut Table<K, V>) {
    while let Some((hash, identity)) = self.recency_buffer.try_next() {
      let bucket = t.bucket_index(hash);
      let indices = position_where(&t.buckets[bucket], |e| e.key.same_key(&identity)).map(|pos| {
        let entry = entry_at(&t.buckets[bucket], pos);
        (entry.recency, entry.access_queue)
      });
      if let Some((recency, access)) = indices {
        if let Some(index) = recency {
          t.recency.move_to_front(index);
        }
        if let Some(index) = access {
          t.access_queue.move_to_front(index);
        }
      }
    }
  }

  // Pops expired entries off the deadline queues. Both queues are ordered
  // by their timestamp, so the drain stops at the first live tail.
  fn expire_entries(&self, t: &mut Table<K, V>, now: u64, removed: &mut Vec<RemovalNotification<K, V>>) {
    if let Some(ttl) = self.cfg.ttl_nanos {
      loop {
        let Some((index, hash, identity)) = t.write_queue.tail() else {
          break;
        };
        let bucket = t.bucket_index(hash);
        let Some(pos) = position_where(&t.buckets[bucket], |e| e.key.same_key(&identity)) else {
          // Orphan node; drop it so the drain cannot spin.
          t.write_queue.remove(index);
          continue;
        };
        let expired = {
          let entry = entry_at(&t.buckets[bucket], pos);
          now.saturating_sub(entry.write_time) >= ttl
        };
        if !expired {
          break;
        }
        let entry = unlink_where(&mut t.buckets[bucket], |e| e.key.same_key(&identity))
          .expect("entry vanished under the write lock");
        self.finish_removal(t, entry, RemovalCause::Expired, removed);
      }
    }
    if let Some(tti) = self.cfg.tti_nanos {
      loop {
        let Some((index, hash, identity)) = t.access_queue.tail() else {
          break;
        };
        let bucket = t.bucket_index(hash);
        let Some(pos) = position_where(&t.buckets[bucket], |e| e.key.same_key(&identity)) else {
          t.access_queue.remove(index);
          continue;
        };
        let expired = {
          let entry = entry_at(&t.buckets[bucket], pos);
          now.saturating_sub(entry.access_time.load(Ordering::Relaxed)) >= tti
        };
        if !expired {
          // The tail may have been refreshed by a read whose recency event
          // was dropped; truth lives in the timestamp, so stop here.
          break;
        }
        let entry = unlink_where(&mut t.buckets[bucket], |e| e.key.same_key(&identity))
          .expect("entry vanished under the write lock");
        self.finish_removal(t, entry, RemovalCause::Expired, removed);
      }
    }
  }

  // Full sweep for dead references. Rebuilding each chain by value keeps
  // the unlink logic trivially safe; chain order is insignificant.
  fn sweep_collected(&self, t: &mut Table<K, V>, removed: &mut Vec<RemovalNotification<K, V>>) {
    let mut dead = Vec::new();
    for i in 0..t.buckets.len() {
      let mut chain = t.buckets[i].take();
      let mut kept: Bucket<K, V> = None;
      while let Some(mut entry) = chain {
        chain = entry.next.take();
        if !entry.key.is_live() || entry.value.is_collected() {
          dead.push(entry);
        } else {
          entry.next = kept;
          kept = Some(entry);
        }
      }
      t.buckets[i] = kept;
    }
    for entry in dead {
      self.finish_removal(t, entry, RemovalCause::Collected, removed);
    }
  }

  // Shared tail of every removal path: detach queue nodes, fix the counters
  // and queue up the notification.
  fn finish_removal(
    &self,
    t: &mut Table<K, V>,
    mut entry: Box<Entry<K, V>>,
    cause: RemovalCause,
    removed: &mut Vec<RemovalNotification<K, V>>,
  ) {
    Self::detach_queue_nodes(t, &mut entry);
    if !entry.value.is_loading() {
      t.count -= 1;
      removed.push(RemovalNotification {
        key: entry.key.get(),
        value: entry.value.get(),
        cause,
      });
    }
    t.mod_count += 1;
    if cause.was_evicted() {
      self.stats.record_eviction();
    }
  }

  fn detach_queue_nodes(t: &mut Table<K, V>, entry: &mut Entry<K, V>) {
    if let Some(index) = entry.recency.take() {
      t.recency.remove(index);
    }
    if let Some(index) = entry.write_queue.take() {
      t.write_queue.remove(index);
    }
    if let Some(index) = entry.access_queue.take() {
      t.access_queue.remove(index);
    }
  }

  // Links the entry at `pos` into whichever policy queues are configured
  // and stores the node indices back on the entry.
  fn link_policy_queues(&self, t: &mut Table<K, V>, bucket: usize, pos: usize) {
    let (hash, identity) = {
      let entry = entry_at(&t.buckets[bucket], pos);
      (entry.hash, entry.key.clone())
    };
    let recency = self
      .max_size
      .map(|_| t.recency.push_front(hash, identity.clone()));
    let write_index = self
      .cfg
      .ttl_nanos
      .map(|_| t.write_queue.push_front(hash, identity.clone()));
    let access_index = self
      .cfg
      .tti_nanos
      .map(|_| t.access_queue.push_front(hash, identity));
    let entry = entry_at_mut(&mut t.buckets[bucket], pos);
    entry.recency = recency;
    entry.write_queue = write_index;
    entry.access_queue = access_index;
  }

  // Moves an existing entry to the fresh end of the recency and access
  // queues, and of the write queue too when the value was just written.
  fn bump_entry(t: &mut Table<K, V>, bucket: usize, pos: usize, wrote: bool) {
    let (recency, write_index, access_index) = {
      let entry = entry_at(&t.buckets[bucket], pos);
      (entry.recency, entry.write_queue, entry.access_queue)
    };
    if let Some(index) = recency {
      t.recency.move_to_front(index);
    }
    if let Some(index) = access_index {
      t.access_queue.move_to_front(index);
    }
    if wrote {
      if let Some(index) = write_index {
        t.write_queue.move_to_front(index);
      }
    }
  }

  // Evicts from the cold end of the recency queue until the segment is
  // within its share of the maximum size. Runs as the final step of the
  // insert that exceeded the bound, so a zero-sized segment evicts the
  // entry it just admitted (size trumps a simultaneous zero expiry).
  fn evict_for_size(&self, t: &mut Table<K, V>, removed: &mut Vec<RemovalNotification<K, V>>) {
    let Some(max) = self.max_size else {
      return;
    };
    while (t.count as u64) > max {
      let Some((index, hash, identity)) = t.recency.tail() else {
        break;
      };
      let bucket = t.bucket_index(hash);
      match unlink_where(&mut t.buckets[bucket], |e| e.key.same_key(&identity)) {
        Some(entry) => self.finish_removal(t, entry, RemovalCause::Size, removed),
        // Orphan node; drop it so the loop cannot spin.
        None => {
          t.recency.remove(index);
        }
      }
    }
  }

  // Doubles the bucket array once the load factor is crossed. Runs before
  // the bucket walk so chain positions stay valid for the whole operation.
  fn expand_if_needed(&self, t: &mut Table<K, V>) {
    if t.count + 1 <= t.threshold || t.buckets.len() >= MAX_SEGMENT_BUCKETS {
      return;
    }
    let new_len = t.buckets.len() * 2;
    let old = std::mem::replace(
      &mut t.buckets,
      (0..new_len).map(|_| None).collect::<Vec<_>>().into_boxed_slice(),
    );
    for mut chain in old.into_vec() {
      while let Some(mut entry) = chain {
        chain = entry.next.take();
        let index = (entry.hash as usize) & (new_len - 1);
        entry.next = t.buckets[index].take();
        t.buckets[index] = Some(entry);
      }
    }
    t.threshold = new_len * 3 / 4;
  }

  // Delivers notifications after the lock is released. A panicking listener
  // is contained here; it cannot corrupt the cache or unwind into the
  // mutating caller.
  fn dispatch(&self, removed: Vec<RemovalNotification<K, V>>) {
    if removed.is_empty() {
      return;
    }
    if let Some(listener) = &self.listener {
      for notification in removed {
        let _ = panic::catch_unwind(AssertUnwindSafe(|| listener.on_removal(notification)));
      }
    }
  }
}

// The state of a matched entry's value slot, captured under the write lock.
enum SlotState<V> {
  Live(Arc<V>),
  Expired(Arc<V>),
  Collected,
  Loading,
}

impl<K: Eq, V> Segment<K, V> {
  /// Write path. Returns the displaced live value, if any.
  pub(crate) fn insert(
    &self,
    hash: u64,
    key: Arc<K>,
    value: Arc<V>,
    only_if_absent: bool,
  ) -> Option<Arc<V>> {
    let now = self.cfg.ticker.now();
    let mut removed = Vec::new();
    let result;
    {
      let mut t = self.table.write();
      self.run_locked_cleanup(&mut t, now, &mut removed);
      self.expand_if_needed(&mut t);
      let bucket = t.bucket_index(hash);
      match position_where(&t.buckets[bucket], |e| e.matches(hash, &*key)) {
        Some(pos) => {
          let state = Self::slot_state(&t, bucket, pos, now, &self.cfg);
          match state {
            SlotState::Live(old) if only_if_absent => {
              // Treated as a read of the existing value.
              entry_at(&t.buckets[bucket], pos).touch(now);
              Self::bump_entry(&mut t, bucket, pos, false);
              result = Some(old);
            }
            SlotState::Live(old) => {
              removed.push(RemovalNotification {
                key: entry_at(&t.buckets[bucket], pos).key.get(),
                value: Some(old.clone()),
                cause: RemovalCause::Replaced,
              });
              self.set_value(&mut t, bucket, pos, value, now, false);
              result = Some(old);
            }
            SlotState::Expired(old) => {
              removed.push(RemovalNotification {
                key: entry_at(&t.buckets[bucket], pos).key.get(),
                value: Some(old),
                cause: RemovalCause::Expired,
              });
              self.stats.record_eviction();
              self.set_value(&mut t, bucket, pos, value, now, false);
              result = None;
            }
            SlotState::Collected => {
              removed.push(RemovalNotification {
                key: entry_at(&t.buckets[bucket], pos).key.get(),
                value: None,
                cause: RemovalCause::Collected,
              });
              self.stats.record_eviction();
              self.set_value(&mut t, bucket, pos, value, now, false);
              result = None;
            }
            SlotState::Loading => {
              // A racing load is in flight; the explicit write wins. The
              // placeholder never held a visible value, so there is nothing
              // to notify; its loader will complete the waiters itself.
              self.set_value(&mut t, bucket, pos, value, now, true);
              result = None;
            }
          }
        }
        None => {
          let chain = t.buckets[bucket].take();
          t.buckets[bucket] = Some(Box::new(Entry::new(
            hash,
            KeyRef::new(key, self.cfg.key_strength),
            ValueSlot::new(value, self.cfg.value_strength),
            now,
            chain,
          )));
          t.count += 1;
          t.mod_count += 1;
          self.link_policy_queues(&mut t, bucket, 0);
          result = None;
        }
      }
      self.evict_for_size(&mut t, &mut removed);
      self.count.store(t.count, Ordering::Relaxed);
    }
    self.dispatch(removed);
    result
  }

  fn slot_state(t: &Table<K, V>, bucket: usize, pos: usize, now: u64, cfg: &SegmentConfig) -> SlotState<V> {
    let entry = entry_at(&t.buckets[bucket], pos);
    if entry.value.is_loading() {
      return SlotState::Loading;
    }
    match entry.value.get() {
      Some(value) if entry.is_expired(now, cfg.ttl_nanos, cfg.tti_nanos) => SlotState::Expired(value),
      Some(value) => SlotState::Live(value),
      None => SlotState::Collected,
    }
  }

  // Installs a value into an existing entry. `was_loading` covers the entry
  // graduating from a placeholder: it gains a count and its queue links.
  fn set_value(
    &self,
    t: &mut Table<K, V>,
    bucket: usize,
    pos: usize,
    value: Arc<V>,
    now: u64,
    was_loading: bool,
  ) {
    {
      let entry = entry_at_mut(&mut t.buckets[bucket], pos);
      entry.value = ValueSlot::new(value, self.cfg.value_strength);
      entry.write_time = now;
      entry.touch(now);
    }
    t.mod_count += 1;
    if was_loading {
      t.count += 1;
      self.link_policy_queues(t, bucket, pos);
    } else {
      Self::bump_entry(t, bucket, pos, true);
    }
  }

  /// The loading coordinator. On a miss, installs a loading placeholder,
  /// runs the loader outside every lock, then installs the result. Callers
  /// that find a placeholder block on it instead of loading again: at most
  /// one load is in flight per key. A loader failure is delivered to every
  /// waiter and the placeholder is removed so a later call retries.
  pub(crate) fn get_or_load(
    &self,
    hash: u64,
    key: Arc<K>,
    loader: &(dyn Fn(&K) -> Result<V, BoxError>),
  ) -> Result<Arc<V>, LoadError> {
    // Lock-free fast path.
    if let Some(value) = self.get(hash, &*key) {
      return Ok(value);
    }

    enum Claim<V> {
      Present(Arc<V>),
      Waiter(Arc<LoadWaiter<V>>),
      Owner(Arc<LoadWaiter<V>>),
    }

    let now = self.cfg.ticker.now();
    let mut removed = Vec::new();
    let claim = {
      let mut t = self.table.write();
      self.run_locked_cleanup(&mut t, now, &mut removed);
      self.expand_if_needed(&mut t);
      let bucket = t.bucket_index(hash);
      match position_where(&t.buckets[bucket], |e| e.matches(hash, &*key)) {
        Some(pos) => match Self::slot_state(&t, bucket, pos, now, &self.cfg) {
          SlotState::Live(value) => {
            // A racing writer beat us here.
            entry_at(&t.buckets[bucket], pos).touch(now);
            Self::bump_entry(&mut t, bucket, pos, false);
            Claim::Present(value)
          }
          SlotState::Loading => {
            let entry = entry_at(&t.buckets[bucket], pos);
            let waiter = Arc::clone(entry.value.waiter().expect("loading slot without waiter"));
            Claim::Waiter(waiter)
          }
          SlotState::Expired(old) => {
            removed.push(RemovalNotification {
              key: entry_at(&t.buckets[bucket], pos).key.get(),
              value: Some(old),
              cause: RemovalCause::Expired,
            });
            self.stats.record_eviction();
            Claim::Owner(self.install_placeholder(&mut t, bucket, Some(pos), hash, &key))
          }
          SlotState::Collected => {
            removed.push(RemovalNotification {
              key: entry_at(&t.buckets[bucket], pos).key.get(),
              value: None,
              cause: RemovalCause::Collected,
            });
            self.stats.record_eviction();
            Claim::Owner(self.install_placeholder(&mut t, bucket, Some(pos), hash, &key))
          }
        },
        None => Claim::Owner(self.install_placeholder(&mut t, bucket, None, hash, &key)),
      }
    };
    self.dispatch(removed);

    match claim {
      Claim::Present(value) => {
        self.stats.record_hits(1);
        Ok(value)
      }
      Claim::Waiter(waiter) => waiter.wait(),
      Claim::Owner(waiter) => self.run_load(hash, key, waiter, loader),
    }
  }

  // Installs a loading placeholder, either into an existing entry whose old
  // value just departed, or as a fresh entry. Placeholders carry no count
  // and sit in no policy queue until a value arrives.
  fn install_placeholder(
    &self,
    t: &mut Table<K, V>,
    bucket: usize,
    pos: Option<usize>,
    hash: u64,
    key: &Arc<K>,
  ) -> Arc<LoadWaiter<V>> {
    let waiter = Arc::new(LoadWaiter::new());
    match pos {
      Some(pos) => {
        // The entry had a (departed) value: it loses its count and leaves
        // the policy queues until the load lands.
        let indices = {
          let entry = entry_at_mut(&mut t.buckets[bucket], pos);
          entry.value = ValueSlot::Loading(waiter.clone());
          (entry.recency.take(), entry.write_queue.take(), entry.access_queue.take())
        };
        if let Some(index) = indices.0 {
          t.recency.remove(index);
        }
        if let Some(index) = indices.1 {
          t.write_queue.remove(index);
        }
        if let Some(index) = indices.2 {
          t.access_queue.remove(index);
        }
        t.count -= 1;
        t.mod_count += 1;
      }
      None => {
        let now = self.cfg.ticker.now();
        let chain = t.buckets[bucket].take();
        t.buckets[bucket] = Some(Box::new(Entry::new(
          hash,
          KeyRef::new(key.clone(), self.cfg.key_strength),
          ValueSlot::Loading(waiter.clone()),
          now,
          chain,
        )));
        t.mod_count += 1;
      }
    }
    waiter
  }

  // Runs the loader outside every lock, installs the outcome, and completes
  // the waiter. A panic is captured and treated as a failed load.
  fn run_load(
    &self,
    hash: u64,
    key: Arc<K>,
    waiter: Arc<LoadWaiter<V>>,
    loader: &(dyn Fn(&K) -> Result<V, BoxError>),
  ) -> Result<Arc<V>, LoadError> {
    let start = self.cfg.ticker.now();
    let loaded = panic::catch_unwind(AssertUnwindSafe(|| loader(&key)));
    let elapsed = self.cfg.ticker.now().saturating_sub(start);

    let outcome: LoadOutcome<V> = match loaded {
      Ok(Ok(value)) => Ok(Arc::new(value)),
      Ok(Err(error)) => Err(LoadError::Failed(Arc::from(error))),
      Err(payload) => Err(LoadError::Panicked(panic_message(payload))),
    };

    let now = self.cfg.ticker.now();
    let mut removed = Vec::new();
    {
      let mut t = self.table.write();
      let bucket = t.bucket_index(hash);
      // Our placeholder may have been clobbered by a put or removed by a
      // clear; only touch the table while it is still ours.
      let ours = position_where(&t.buckets[bucket], |e| {
        e.value.waiter().map_or(false, |w| Arc::ptr_eq(w, &waiter))
      });
      match (&outcome, ours) {
        (Ok(value), Some(pos)) => {
          self.set_value(&mut t, bucket, pos, value.clone(), now, true);
          self.evict_for_size(&mut t, &mut removed);
        }
        (Err(_), Some(pos)) => {
          // Failed load: drop the placeholder silently so the next call
          // retries. It never held a visible value.
          let identity = entry_at(&t.buckets[bucket], pos).key.clone();
          let entry = unlink_where(&mut t.buckets[bucket], |e| e.key.same_key(&identity))
            .expect("entry vanished under the write lock");
          drop(entry);
          t.mod_count += 1;
        }
        (_, None) => {}
      }
      self.count.store(t.count, Ordering::Relaxed);
    }
    self.dispatch(removed);

    match &outcome {
      Ok(_) => self.stats.record_load_success(elapsed),
      Err(_) => self.stats.record_load_failure(elapsed),
    }
    waiter.complete(outcome.clone());
    outcome
  }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "opaque panic payload".to_string()
  }
}
