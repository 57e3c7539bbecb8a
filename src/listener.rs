use std::fmt;
use std::sync::Arc;

/// Describes the reason an entry was removed from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
  /// The entry was removed by an explicit user action (`invalidate`, `clear`).
  Explicit,
  /// The entry's value was replaced by a newer write.
  Replaced,
  /// The entry's weak key or value was reclaimed.
  Collected,
  /// The entry passed its expire-after-write or expire-after-access deadline.
  Expired,
  /// The entry was evicted to keep the cache within its maximum size.
  Size,
}

impl RemovalCause {
  /// Returns `true` if the entry was removed automatically rather than by an
  /// explicit user action.
  pub fn was_evicted(self) -> bool {
    matches!(
      self,
      RemovalCause::Collected | RemovalCause::Expired | RemovalCause::Size
    )
  }
}

impl fmt::Display for RemovalCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RemovalCause::Explicit => write!(f, "explicitly removed"),
      RemovalCause::Replaced => write!(f, "value replaced"),
      RemovalCause::Collected => write!(f, "weak reference reclaimed"),
      RemovalCause::Expired => write!(f, "expired"),
      RemovalCause::Size => write!(f, "evicted due to size"),
    }
  }
}

/// A single entry's departure from the cache.
///
/// The key or value is `None` when the corresponding weak reference was
/// already reclaimed by the time the entry was unlinked.
#[derive(Debug, Clone)]
pub struct RemovalNotification<K, V> {
  pub key: Option<Arc<K>>,
  pub value: Option<Arc<V>>,
  pub cause: RemovalCause,
}

/// A listener notified after entries leave the cache.
///
/// Notifications are delivered by the thread that performed the removal,
/// after the segment lock has been released, exactly once per departing
/// entry. The listener must not block for long; a panicking listener is
/// contained and never corrupts the cache or unwinds into the caller.
pub trait RemovalListener<K, V>: Send + Sync {
  fn on_removal(&self, notification: RemovalNotification<K, V>);
}

// Lets callers register a shared listener and keep their own handle to it.
impl<K, V, L> RemovalListener<K, V> for Arc<L>
where
  L: RemovalListener<K, V> + ?Sized,
{
  fn on_removal(&self, notification: RemovalNotification<K, V>) {
    (**self).on_removal(notification);
  }
}
