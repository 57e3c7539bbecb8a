mod common;

use common::RecordingListener;
use strata_cache::{CacheBuilder, RemovalCause, RemovalListener, RemovalNotification};

use std::sync::Arc;

#[test]
fn explicit_removal_notifies() {
  let listener = RecordingListener::<String, u32>::new();
  let cache = CacheBuilder::new()
    .removal_listener(listener.clone())
    .build()
    .unwrap();

  cache.insert("k".to_string(), 1);
  cache.remove("k");

  let events = listener.events();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].0.as_deref().map(String::as_str), Some("k"));
  assert_eq!(events[0].1.as_deref(), Some(&1));
  assert_eq!(events[0].2, RemovalCause::Explicit);
}

#[test]
fn replacement_notifies_with_the_old_value() {
  let listener = RecordingListener::<String, u32>::new();
  let cache = CacheBuilder::new()
    .removal_listener(listener.clone())
    .build()
    .unwrap();

  cache.insert("k".to_string(), 1);
  cache.insert("k".to_string(), 2);

  let events = listener.events();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].1.as_deref(), Some(&1));
  assert_eq!(events[0].2, RemovalCause::Replaced);
}

#[test]
fn insert_if_absent_does_not_notify_on_existing() {
  let listener = RecordingListener::<String, u32>::new();
  let cache = CacheBuilder::new()
    .removal_listener(listener.clone())
    .build()
    .unwrap();

  cache.insert("k".to_string(), 1);
  cache.insert_if_absent("k".to_string(), 2);
  assert_eq!(listener.len(), 0);
}

#[test]
fn clear_notifies_every_entry_as_explicit() {
  let listener = RecordingListener::<u32, u32>::new();
  let cache = CacheBuilder::new()
    .concurrency_level(2)
    .removal_listener(listener.clone())
    .build()
    .unwrap();

  for i in 0..20 {
    cache.insert(i, i);
  }
  cache.clear();

  let causes = listener.causes();
  assert_eq!(causes.len(), 20);
  assert!(causes.iter().all(|c| *c == RemovalCause::Explicit));
}

#[test]
fn each_removal_is_delivered_exactly_once() {
  let listener = RecordingListener::<String, u32>::new();
  let cache = CacheBuilder::new()
    .concurrency_level(1)
    .removal_listener(listener.clone())
    .build()
    .unwrap();

  cache.insert("k".to_string(), 1);
  cache.remove("k");
  assert_eq!(cache.remove("k"), None);
  cache.clean_up();
  assert_eq!(listener.len(), 1);
}

struct PanickingListener;

impl RemovalListener<String, u32> for PanickingListener {
  fn on_removal(&self, _notification: RemovalNotification<String, u32>) {
    panic!("listener failure");
  }
}

#[test]
fn panicking_listener_does_not_poison_the_cache() {
  let cache = CacheBuilder::<String, u32>::new()
    .removal_listener(PanickingListener)
    .build()
    .unwrap();

  cache.insert("k".to_string(), 1);
  // Each of these triggers the panicking listener.
  assert_eq!(cache.insert("k".to_string(), 2).as_deref(), Some(&1));
  assert_eq!(cache.remove("k").as_deref(), Some(&2));
  // The cache stays fully usable.
  cache.insert("k2".to_string(), 3);
  assert_eq!(cache.get("k2").as_deref(), Some(&3));
}

#[test]
fn notification_shares_the_stored_arcs() {
  let listener = RecordingListener::<String, u32>::new();
  let cache = CacheBuilder::new()
    .removal_listener(listener.clone())
    .build()
    .unwrap();

  let value = Arc::new(4);
  cache.insert_shared(Arc::new("k".to_string()), value.clone());
  cache.remove("k");

  let events = listener.events();
  let delivered = events[0].1.as_ref().unwrap();
  assert!(Arc::ptr_eq(delivered, &value));
}
