use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Errors that can occur when building a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  /// The cache was configured with a concurrency level of zero. At least one
  /// segment is required.
  ZeroConcurrency,
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::ZeroConcurrency => write!(f, "concurrency level cannot be zero"),
    }
  }
}

impl StdError for BuildError {}

/// The failure of a loader invocation.
///
/// One in-flight load serves every concurrent caller for the same key, so the
/// same failure is cloned and delivered to each of them. The loading
/// placeholder is removed on failure; a subsequent call retries the load.
#[derive(Debug, Clone)]
pub enum LoadError {
  /// The loader returned an error.
  Failed(Arc<dyn StdError + Send + Sync>),
  /// The loader panicked. Carries the panic message when it was a string.
  Panicked(String),
  /// `get_with` was called on a cache built without a loader.
  NoLoader,
}

impl fmt::Display for LoadError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LoadError::Failed(e) => write!(f, "loader failed: {}", e),
      LoadError::Panicked(msg) => write!(f, "loader panicked: {}", msg),
      LoadError::NoLoader => write!(f, "no loader configured for this cache"),
    }
  }
}

impl StdError for LoadError {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      LoadError::Failed(e) => Some(e.as_ref()),
      _ => None,
    }
  }
}
