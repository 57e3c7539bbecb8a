use crate::error::LoadError;

use std::error::Error as StdError;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// The boxed error type loader callbacks may return.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The loader callback used to compute absent values.
///
/// Invoked outside every segment lock, at most once concurrently per key.
pub type Loader<K, V> = Arc<dyn Fn(&K) -> Result<V, BoxError> + Send + Sync>;

/// The outcome of an in-flight load, shared with every waiter.
pub(crate) type LoadOutcome<V> = Result<Arc<V>, LoadError>;

enum WaitState<V> {
  Computing,
  Complete(LoadOutcome<V>),
}

/// A handle to a value that is still being computed.
///
/// The loading thread completes it exactly once; any number of other threads
/// may block on `wait` in the meantime. Completion is sticky: waiters that
/// arrive late observe the stored outcome immediately.
pub(crate) struct LoadWaiter<V> {
  state: Mutex<WaitState<V>>,
  ready: Condvar,
}

impl<V> LoadWaiter<V> {
  pub(crate) fn new() -> Self {
    Self {
      state: Mutex::new(WaitState::Computing),
      ready: Condvar::new(),
    }
  }

  /// Completes the load, waking every blocked waiter.
  pub(crate) fn complete(&self, outcome: LoadOutcome<V>) {
    let mut state = self.state.lock();
    *state = WaitState::Complete(outcome);
    self.ready.notify_all();
  }

  /// Blocks until the in-flight load completes, then returns its outcome.
  pub(crate) fn wait(&self) -> LoadOutcome<V> {
    let mut state = self.state.lock();
    loop {
      if let WaitState::Complete(outcome) = &*state {
        return outcome.clone();
      }
      self.ready.wait(&mut state);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::thread;
  use std::time::Duration;

  #[test]
  fn waiters_observe_completion() {
    let waiter = Arc::new(LoadWaiter::<i32>::new());
    let mut handles = Vec::new();
    for _ in 0..4 {
      let waiter = waiter.clone();
      handles.push(thread::spawn(move || waiter.wait()));
    }
    thread::sleep(Duration::from_millis(20));
    waiter.complete(Ok(Arc::new(7)));
    for handle in handles {
      let outcome = handle.join().unwrap();
      assert_eq!(*outcome.unwrap(), 7);
    }
  }

  #[test]
  fn late_waiter_sees_sticky_outcome() {
    let waiter = LoadWaiter::<i32>::new();
    waiter.complete(Err(LoadError::Panicked("boom".into())));
    assert!(matches!(waiter.wait(), Err(LoadError::Panicked(_))));
  }
}
