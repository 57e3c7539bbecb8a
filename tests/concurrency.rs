use strata_cache::CacheBuilder;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn disjoint_writers_land_every_entry() {
  const THREADS: usize = 8;
  const PER_THREAD: usize = 500;

  let cache = CacheBuilder::<usize, usize>::new().build().unwrap();
  let barrier = Arc::new(Barrier::new(THREADS));

  let handles: Vec<_> = (0..THREADS)
    .map(|t| {
      let cache = cache.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        for i in 0..PER_THREAD {
          let key = t * PER_THREAD + i;
          cache.insert(key, key * 2);
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(cache.len(), THREADS * PER_THREAD);
  for key in 0..THREADS * PER_THREAD {
    assert_eq!(cache.get(&key).as_deref(), Some(&(key * 2)));
  }
}

#[test]
fn readers_and_writers_share_a_hot_key() {
  const READERS: usize = 4;
  const WRITES: usize = 1_000;

  let cache = CacheBuilder::<String, usize>::new().build().unwrap();
  cache.insert("hot".to_string(), 0);
  let stop = Arc::new(AtomicUsize::new(0));

  let readers: Vec<_> = (0..READERS)
    .map(|_| {
      let cache = cache.clone();
      let stop = stop.clone();
      thread::spawn(move || {
        let mut last = 0;
        while stop.load(Ordering::Acquire) == 0 {
          let seen = *cache.get("hot").expect("hot key never disappears");
          // Writes are monotonic, so observed values must be too.
          assert!(seen >= last);
          last = seen;
        }
      })
    })
    .collect();

  for i in 1..=WRITES {
    cache.insert("hot".to_string(), i);
  }
  stop.store(1, Ordering::Release);
  for reader in readers {
    reader.join().unwrap();
  }
  assert_eq!(cache.get("hot").as_deref(), Some(&WRITES));
}

#[test]
fn bounded_cache_survives_contention() {
  const THREADS: usize = 8;

  let cache = CacheBuilder::<usize, usize>::new()
    .maximum_size(100)
    .build()
    .unwrap();
  let barrier = Arc::new(Barrier::new(THREADS));

  let handles: Vec<_> = (0..THREADS)
    .map(|t| {
      let cache = cache.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        for i in 0..2_000 {
          let key = (t * 31 + i) % 500;
          cache.insert(key, i);
          cache.get(&key);
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  cache.clean_up();
  assert!(cache.len() <= 100, "bound exceeded: {}", cache.len());
  assert!(!cache.is_empty());
}

#[test]
fn concurrent_loads_of_distinct_keys_run_independently() {
  const THREADS: usize = 8;

  let calls = Arc::new(AtomicUsize::new(0));
  let counted = calls.clone();
  let cache = CacheBuilder::<usize, usize>::new()
    .loader(move |key: &usize| {
      counted.fetch_add(1, Ordering::SeqCst);
      Ok(key + 1)
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
        for key in 0..100 {
          assert_eq!(*cache.get_with(key).unwrap(), key + 1);
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  // Racing callers share claims, so each key loads exactly once.
  assert_eq!(calls.load(Ordering::SeqCst), 100);
  assert_eq!(cache.len(), 100);
}
