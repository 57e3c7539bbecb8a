#![allow(dead_code)]

use strata_cache::{RemovalCause, RemovalListener, RemovalNotification, Ticker};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A manually advanced time source for deterministic expiration tests.
pub struct MockTicker {
  now: AtomicU64,
}

impl MockTicker {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      now: AtomicU64::new(0),
    })
  }

  pub fn advance(&self, by: Duration) {
    self.now.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
  }
}

impl Ticker for MockTicker {
  fn now(&self) -> u64 {
    self.now.load(Ordering::SeqCst)
  }
}

pub type RecordedRemoval<K, V> = (Option<Arc<K>>, Option<Arc<V>>, RemovalCause);

/// Captures every removal notification for later assertions.
pub struct RecordingListener<K, V> {
  events: Mutex<Vec<RecordedRemoval<K, V>>>,
}

impl<K, V> RecordingListener<K, V> {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      events: Mutex::new(Vec::new()),
    })
  }

  pub fn events(&self) -> Vec<RecordedRemoval<K, V>> {
    self.events.lock().unwrap().clone()
  }

  pub fn causes(&self) -> Vec<RemovalCause> {
    self.events().into_iter().map(|(_, _, cause)| cause).collect()
  }

  pub fn len(&self) -> usize {
    self.events.lock().unwrap().len()
  }
}

impl<K, V> RemovalListener<K, V> for RecordingListener<K, V>
where
  K: Send + Sync,
  V: Send + Sync,
{
  fn on_removal(&self, notification: RemovalNotification<K, V>) {
    self.events.lock().unwrap().push((
      notification.key,
      notification.value,
      notification.cause,
    ));
  }
}
