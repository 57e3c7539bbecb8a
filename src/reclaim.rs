use crate::entry::KeyRef;

use crossbeam_channel::{bounded, Receiver, Sender};

/// A bounded, lock-free buffer carrying per-entry events from the read path
/// to the locked maintenance path.
///
/// Two instances back every segment: the reclamation queue (entries whose
/// weak key or value a reader observed dead) and the recency buffer (entries
/// a reader just touched, pending a move in the recency and access queues).
/// Enqueueing never blocks. A full buffer drops the event: a dead entry will
/// be rediscovered by a later read or by `clean_up`, and recency ordering is
/// best-effort by design.
pub(crate) struct EventBuffer<K> {
  tx: Sender<(u64, KeyRef<K>)>,
  rx: Receiver<(u64, KeyRef<K>)>,
}

impl<K> EventBuffer<K> {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = bounded(capacity);
    Self { tx, rx }
  }

  /// Records an event for the entry identified by `hash` and key identity.
  pub(crate) fn offer(&self, hash: u64, key: KeyRef<K>) {
    let _ = self.tx.try_send((hash, key));
  }

  /// Dequeues the next pending event, if any. Never blocks.
  pub(crate) fn try_next(&self) -> Option<(u64, KeyRef<K>)> {
    self.rx.try_recv().ok()
  }
}
