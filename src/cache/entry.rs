//! A cached value and when it was fetched.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// One cached value with its fetch timestamp.
///
/// Freshness is judged by the owning cache against its tuning: served
/// as-is until `stale_after`, served while a refresh runs until
/// `expire_after`, dropped after that. `fetched_at` never exceeds the
/// injected clock's now.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub value: Arc<V>,
  pub fetched_at: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
  pub fn new(value: Arc<V>, fetched_at: DateTime<Utc>) -> Self {
    Self { value, fetched_at }
  }

  /// Age of this entry relative to `now`.
  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.fetched_at
  }

  pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
    self.age(now) > stale_after
  }

  pub fn is_expired(&self, now: DateTime<Utc>, expire_after: Duration) -> bool {
    self.age(now) > expire_after
  }
}
