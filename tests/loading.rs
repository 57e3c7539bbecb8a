use strata_cache::{CacheBuilder, LoadError};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn get_with_requires_a_loader() {
  let cache = CacheBuilder::<String, u32>::new().build().unwrap();
  assert!(matches!(
    cache.get_with("k".to_string()),
    Err(LoadError::NoLoader)
  ));
}

#[test]
fn get_with_loads_once_then_serves_from_cache() {
  let calls = Arc::new(AtomicUsize::new(0));
  let counted = calls.clone();
  let cache = CacheBuilder::<String, usize>::new()
    .loader(move |key: &String| {
      counted.fetch_add(1, Ordering::SeqCst);
      Ok(key.len())
    })
    .build()
    .unwrap();

  assert_eq!(*cache.get_with("four".to_string()).unwrap(), 4);
  assert_eq!(*cache.get_with("four".to_string()).unwrap(), 4);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(cache.get("four").as_deref(), Some(&4));
}

#[test]
fn try_get_with_uses_the_given_closure() {
  let cache = CacheBuilder::<String, u32>::new().build().unwrap();
  let value = cache.try_get_with("k".to_string(), |_| Ok(11)).unwrap();
  assert_eq!(*value, 11);
  // Cached: the second closure must not run.
  let value = cache
    .try_get_with("k".to_string(), |_| panic!("value already cached"))
    .unwrap();
  assert_eq!(*value, 11);
}

#[test]
fn failed_load_is_not_cached_and_retries() {
  let calls = Arc::new(AtomicUsize::new(0));
  let counted = calls.clone();
  let cache = CacheBuilder::<String, u32>::new()
    .loader(move |_: &String| {
      if counted.fetch_add(1, Ordering::SeqCst) == 0 {
        Err("backend unavailable".into())
      } else {
        Ok(5)
      }
    })
    .build()
    .unwrap();

  let error = cache.get_with("k".to_string()).unwrap_err();
  assert!(matches!(error, LoadError::Failed(_)));
  assert_eq!(cache.get("k"), None);

  // The placeholder was dropped, so the next call loads again.
  assert_eq!(*cache.get_with("k".to_string()).unwrap(), 5);
  assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn panicking_loader_is_contained() {
  let calls = Arc::new(AtomicUsize::new(0));
  let counted = calls.clone();
  let cache = CacheBuilder::<String, u32>::new()
    .loader(move |_: &String| {
      if counted.fetch_add(1, Ordering::SeqCst) == 0 {
        panic!("loader exploded");
      }
      Ok(3)
    })
    .build()
    .unwrap();

  match cache.get_with("k".to_string()) {
    Err(LoadError::Panicked(message)) => assert!(message.contains("loader exploded")),
    other => panic!("expected a panicked load, got {:?}", other.map(|v| *v)),
  }
  assert_eq!(*cache.get_with("k".to_string()).unwrap(), 3);
}

#[test]
fn concurrent_callers_share_one_load() {
  const THREADS: usize = 8;
  let calls = Arc::new(AtomicUsize::new(0));
  let counted = calls.clone();
  let cache = CacheBuilder::<String, u32>::new()
    .loader(move |_: &String| {
      counted.fetch_add(1, Ordering::SeqCst);
      // Hold the load open long enough for every caller to pile up.
      thread::sleep(Duration::from_millis(100));
      Ok(42)
    })
    .build()
    .unwrap();

  let barrier = Arc::new(Barrier::new(THREADS));
  let handles: Vec<_> = (0..THREADS)
    .map(|_| {
      let cache = cache.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        *cache.get_with("hot".to_string()).unwrap()
      })
    })
    .collect();

  for handle in handles {
    assert_eq!(handle.join().unwrap(), 42);
  }
  assert_eq!(calls.load(Ordering::SeqCst), 1, "exactly one load may run");
}

#[test]
fn failure_reaches_every_waiting_caller() {
  const THREADS: usize = 4;
  let cache = CacheBuilder::<String, u32>::new()
    .loader(|_: &String| {
      thread::sleep(Duration::from_millis(100));
      Err("load failed".into())
    })
    .build()
    .unwrap();

  let barrier = Arc::new(Barrier::new(THREADS));
  let handles: Vec<_> = (0..THREADS)
    .map(|_| {
      let cache = cache.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        cache.get_with("k".to_string())
      })
    })
    .collect();

  for handle in handles {
    assert!(matches!(handle.join().unwrap(), Err(LoadError::Failed(_))));
  }
}

#[test]
fn explicit_insert_wins_over_inflight_load() {
  let cache = CacheBuilder::<String, u32>::new()
    .loader(|_: &String| {
      thread::sleep(Duration::from_millis(150));
      Ok(1)
    })
    .build()
    .unwrap();

  let loading = {
    let cache = cache.clone();
    thread::spawn(move || cache.get_with("k".to_string()))
  };
  // Let the loader claim the key, then overwrite while it runs.
  thread::sleep(Duration::from_millis(50));
  cache.insert("k".to_string(), 2);

  // The loader still answers its own caller.
  assert_eq!(*loading.join().unwrap().unwrap(), 1);
  // But the explicit write owns the table.
  assert_eq!(cache.get("k").as_deref(), Some(&2));
}
