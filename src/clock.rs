//! Injected time source.
//!
//! Freshness decisions are judged against a [`Clock`] handed to the cache
//! at construction, so tests drive synthetic time instead of real timers.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, PoisonError};

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Hand-driven clock for tests.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn starting_at(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  /// Move time forward.
  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
    *now = *now + by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn manual_clock_advances() {
    let clock = ManualClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    let t0 = clock.now();
    clock.advance(Duration::seconds(150));
    assert_eq!(clock.now() - t0, Duration::seconds(150));
  }
}
