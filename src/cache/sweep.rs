//! Coarse periodic sweep driving entry expiry.
//!
//! Entries never get their own timers: expiry is observed lazily during
//! reads, and a single owned scheduler calls [`Sweep::sweep`] with
//! injected time on a coarse interval.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::Clock;

/// Anything whose expired entries can be reclaimed given the current time.
pub trait Sweep: Send + Sync + 'static {
  /// Drop entries past their expiry as of `now`. Returns how many were
  /// dropped.
  fn sweep(&self, now: DateTime<Utc>) -> usize;
}

/// Run `target.sweep` on a coarse interval until the handle is aborted or
/// the runtime shuts down.
pub fn spawn_sweeper<S: Sweep>(
  target: Arc<S>,
  clock: Arc<dyn Clock>,
  every: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      ticker.tick().await;
      let dropped = target.sweep(clock.now());
      if dropped > 0 {
        debug!(dropped, "periodic sweep reclaimed expired entries");
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use chrono::TimeZone;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct CountingTarget {
    sweeps: AtomicUsize,
  }

  impl Sweep for CountingTarget {
    fn sweep(&self, _now: DateTime<Utc>) -> usize {
      self.sweeps.fetch_add(1, Ordering::SeqCst);
      0
    }
  }

  #[tokio::test(start_paused = true)]
  async fn sweeper_ticks_on_its_interval() {
    let clock = Arc::new(ManualClock::starting_at(
      Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let target = Arc::new(CountingTarget {
      sweeps: AtomicUsize::new(0),
    });

    let handle = spawn_sweeper(Arc::clone(&target), clock, Duration::from_secs(300));

    // First tick fires as soon as the task runs.
    tokio::task::yield_now().await;
    assert_eq!(target.sweeps.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(300)).await;
    tokio::task::yield_now().await;
    assert_eq!(target.sweeps.load(Ordering::SeqCst), 2);

    tokio::time::advance(Duration::from_secs(300)).await;
    tokio::task::yield_now().await;
    assert_eq!(target.sweeps.load(Ordering::SeqCst), 3);

    handle.abort();
  }
}
