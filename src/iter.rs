use crate::cache::CacheShared;

use std::sync::Arc;

/// A weakly consistent iterator over a cache's live entries.
///
/// Each segment is snapshotted under its shared lock as the iterator reaches
/// it, so entries mutated after their segment was visited are not reflected.
/// Loading placeholders, expired entries and reclaimed references are
/// skipped.
pub struct Iter<K, V, S> {
  shared: Arc<CacheShared<K, V, S>>,
  next_segment: usize,
  entries: std::vec::IntoIter<(Arc<K>, Arc<V>)>,
}

impl<K, V, S> Iter<K, V, S> {
  pub(crate) fn new(shared: Arc<CacheShared<K, V, S>>) -> Self {
    Self {
      shared,
      next_segment: 0,
      entries: Vec::new().into_iter(),
    }
  }
}

impl<K, V, S> Iterator for Iter<K, V, S> {
  type Item = (Arc<K>, Arc<V>);

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if let Some(pair) = self.entries.next() {
        return Some(pair);
      }
      if self.next_segment >= self.shared.segments.len() {
        return None;
      }
      self.entries = self.shared.segments[self.next_segment]
        .live_entries()
        .into_iter();
      self.next_segment += 1;
    }
  }
}
