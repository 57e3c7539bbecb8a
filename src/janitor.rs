use crate::cache::CacheShared;

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Background maintenance thread. Periodically runs the same cleanup the
/// write path performs, so expiration and weak-reference reclamation make
/// progress on caches that see no traffic.
///
/// Holds only a weak handle to the cache: the janitor never keeps a dropped
/// cache alive, and exits on its own once the cache is gone.
pub(crate) struct Janitor {
  thread: Option<JoinHandle<()>>,
  signal: Arc<StopSignal>,
}

struct StopSignal {
  stopped: Mutex<bool>,
  wake: Condvar,
}

impl Janitor {
  pub(crate) fn start<K, V, S>(shared: Weak<CacheShared<K, V, S>>, period: Duration) -> Self
  where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: Send + Sync + 'static,
  {
    let signal = Arc::new(StopSignal {
      stopped: Mutex::new(false),
      wake: Condvar::new(),
    });
    let thread_signal = signal.clone();
    let thread = std::thread::Builder::new()
      .name("strata-cache-janitor".into())
      .spawn(move || loop {
        {
          let mut stopped = thread_signal.stopped.lock();
          if *stopped {
            return;
          }
          thread_signal.wake.wait_for(&mut stopped, period);
          if *stopped {
            return;
          }
        }
        let Some(shared) = shared.upgrade() else {
          return;
        };
        shared.clean_up_all();
      })
      .expect("failed to spawn cache janitor thread");
    Self {
      thread: Some(thread),
      signal,
    }
  }

  pub(crate) fn stop(&mut self) {
    *self.signal.stopped.lock() = true;
    self.signal.wake.notify_all();
    if let Some(thread) = self.thread.take() {
      // The janitor itself can drop the last cache handle, which lands this
      // stop on the janitor thread; joining there would never return.
      if thread.thread().id() != std::thread::current().id() {
        let _ = thread.join();
      }
    }
  }
}

impl Drop for Janitor {
  fn drop(&mut self) {
    self.stop();
  }
}
