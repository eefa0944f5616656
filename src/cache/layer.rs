//! Cache engine: stale-while-revalidate reads, optimistic mutations with
//! exact rollback, and per-key deduplication of in-flight work.
//!
//! One [`Cache`] holds one entity type, parameterized by key and a fetch
//! capability supplied at construction. Mutations carry their own remote
//! operation and an exact forward/inverse patch pair.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::subscription::{ChangeKind, SubscriberMap, Subscription};
use super::sweep::Sweep;
use crate::clock::Clock;
use crate::error::DataError;

/// Freshness and reconciliation knobs for a cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheTuning {
  /// Age after which an entry is served stale and refreshed in the background.
  pub stale_after: chrono::Duration,
  /// Age after which an entry is dropped outright.
  pub expire_after: chrono::Duration,
  /// Mark the entry stale after a committed mutation so the next read
  /// reconciles with server truth.
  pub refresh_after_mutation: bool,
}

impl Default for CacheTuning {
  fn default() -> Self {
    Self {
      stale_after: chrono::Duration::minutes(2),
      expire_after: chrono::Duration::minutes(30),
      refresh_after_mutation: true,
    }
  }
}

/// What a read returns: the current data plus freshness flags.
#[derive(Debug, Clone)]
pub struct Snapshot<V> {
  pub data: Option<Arc<V>>,
  /// Past the freshness window (or force-invalidated) but still servable.
  pub is_stale: bool,
  /// A fetch or refresh for this key is in flight.
  pub is_loading: bool,
  pub fetched_at: Option<DateTime<Utc>>,
}

/// Result of requesting an optimistic mutation.
#[derive(Debug)]
pub enum MutateOutcome {
  /// The remote write was dispatched; await the handle for its result.
  Started(MutationHandle),
  /// The identifier already has a mutation in flight; this request was
  /// dropped without a network call.
  Ignored,
}

impl MutateOutcome {
  pub fn is_ignored(&self) -> bool {
    matches!(self, MutateOutcome::Ignored)
  }
}

/// Awaitable completion of a dispatched mutation.
///
/// The same terminal state is also published to the key's subscribers, so
/// callers that live in an event loop can drop the handle.
#[derive(Debug)]
pub struct MutationHandle {
  rx: oneshot::Receiver<Result<(), DataError>>,
}

impl MutationHandle {
  pub async fn finished(self) -> Result<(), DataError> {
    match self.rx.await {
      Ok(result) => result,
      Err(_) => Err(DataError::Cancelled),
    }
  }
}

type FetchFn<K, V> = Box<dyn Fn(K) -> BoxFuture<'static, Result<V, DataError>> + Send + Sync>;

/// Per-key bookkeeping.
struct Slot<V> {
  entry: Option<CacheEntry<V>>,
  /// Forced stale by `invalidate` or a committed mutation.
  forced_stale: bool,
  /// Latest refresh ticket issued for this key. A completed refresh only
  /// commits while its ticket is still the latest (last-request-wins).
  refresh_seq: u64,
  /// Ticket of the refresh currently in flight, if any.
  in_flight: Option<u64>,
  /// Optimistic writes outstanding for this key. Refreshes are held while
  /// nonzero so a pre-mutation fetch cannot clobber the patched state.
  pending_writes: u32,
}

impl<V> Default for Slot<V> {
  fn default() -> Self {
    Self {
      entry: None,
      forced_stale: false,
      refresh_seq: 0,
      in_flight: None,
      pending_writes: 0,
    }
  }
}

struct CacheState<K, V> {
  slots: HashMap<K, Slot<V>>,
  /// Identifiers with a mutation in flight. An identifier in this set
  /// blocks further mutations for it until the in-flight one resolves.
  pending: HashSet<String>,
  /// Bumped on wholesale eviction (identity change). Results arriving from
  /// an older generation are discarded instead of applied.
  generation: u64,
}

struct CacheInner<K, V> {
  state: Mutex<CacheState<K, V>>,
  subscribers: Mutex<SubscriberMap<K>>,
  fetch: FetchFn<K, V>,
  clock: Arc<dyn Clock>,
}

/// A per-entity-key cache with stale-while-revalidate reads, optimistic
/// mutation with rollback, and per-key coalescing of in-flight work.
///
/// Cloning shares the underlying map, in the manner of a client handle.
pub struct Cache<K, V> {
  inner: Arc<CacheInner<K, V>>,
  tuning: CacheTuning,
}

impl<K, V> Clone for Cache<K, V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      tuning: self.tuning,
    }
  }
}

fn issue_refresh_ticket<V>(slot: &mut Slot<V>) -> u64 {
  slot.refresh_seq += 1;
  slot.in_flight = Some(slot.refresh_seq);
  slot.refresh_seq
}

impl<K, V> Cache<K, V>
where
  K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  /// Create a cache over the given fetch capability.
  ///
  /// The fetcher pulls authoritative data for one key from the backend; it
  /// is invoked once per dispatched refresh, never concurrently per key.
  pub fn new<F, Fut>(clock: Arc<dyn Clock>, fetch: F) -> Self
  where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, DataError>> + Send + 'static,
  {
    Self {
      inner: Arc::new(CacheInner {
        state: Mutex::new(CacheState {
          slots: HashMap::new(),
          pending: HashSet::new(),
          generation: 0,
        }),
        subscribers: Mutex::new(SubscriberMap::new()),
        fetch: Box::new(move |key| Box::pin(fetch(key))),
        clock,
      }),
      tuning: CacheTuning::default(),
    }
  }

  /// Set the freshness tuning for this handle.
  pub fn with_tuning(mut self, tuning: CacheTuning) -> Self {
    self.tuning = tuning;
    self
  }

  /// Read the cached value for `key`.
  ///
  /// Missing entries trigger a fetch and return a loading snapshot. Fresh
  /// entries return immediately with no network call. Stale entries return
  /// their current data and dispatch at most one background refresh for
  /// the key, coalescing concurrent reads. Expired entries are dropped
  /// before the rules above apply.
  ///
  /// Must be called from within a tokio runtime: refreshes run as spawned
  /// tasks.
  pub fn get(&self, key: &K) -> Snapshot<V> {
    let now = self.inner.clock.now();
    let mut refresh = None;
    let snapshot;
    {
      let mut st = self.inner.lock_state();
      let generation = st.generation;
      let slot = st.slots.entry(key.clone()).or_default();

      let expired = slot
        .entry
        .as_ref()
        .is_some_and(|entry| entry.is_expired(now, self.tuning.expire_after));
      if expired {
        slot.entry = None;
        slot.forced_stale = false;
      }

      let hold_refresh = slot.pending_writes > 0;
      let (data, fetched_at, aged_out) = match &slot.entry {
        Some(entry) => (
          Some(Arc::clone(&entry.value)),
          Some(entry.fetched_at),
          entry.is_stale(now, self.tuning.stale_after),
        ),
        None => (None, None, false),
      };

      snapshot = match data {
        None => {
          if slot.in_flight.is_none() && !hold_refresh {
            refresh = Some((issue_refresh_ticket(slot), generation));
          }
          Snapshot {
            data: None,
            is_stale: false,
            is_loading: true,
            fetched_at: None,
          }
        }
        Some(value) => {
          let is_stale = slot.forced_stale || aged_out;
          if is_stale && slot.in_flight.is_none() && !hold_refresh {
            refresh = Some((issue_refresh_ticket(slot), generation));
          }
          Snapshot {
            data: Some(value),
            is_stale,
            is_loading: slot.in_flight.is_some(),
            fetched_at,
          }
        }
      };
    }

    if let Some((seq, generation)) = refresh {
      self.spawn_refresh(key.clone(), seq, generation);
    }
    snapshot
  }

  fn spawn_refresh(&self, key: K, seq: u64, generation: u64) {
    debug!(?key, seq, "dispatching background refresh");
    let fut = (self.inner.fetch)(key.clone());
    let inner = Arc::clone(&self.inner);
    tokio::spawn(async move {
      let result = fut.await;
      inner.finish_refresh(key, seq, generation, result);
    });
  }

  /// Request an optimistic mutation for `identifier` under `key`.
  ///
  /// The forward patch is applied to the cached collection before this
  /// function returns; the remote operation then runs as a spawned task.
  /// On failure the inverse patch restores the prior state exactly (no
  /// re-fetch, no flicker) and the error reaches both the returned handle
  /// and the key's subscribers. A mutation for an identifier that is
  /// already pending is ignored rather than raced.
  ///
  /// When no entry is cached for `key` there is nothing displayed to
  /// patch; the remote write still runs and success invalidates the key.
  pub fn mutate<F, G, Op, Fut>(
    &self,
    key: &K,
    identifier: impl Into<String>,
    forward: F,
    inverse: G,
    op: Op,
  ) -> MutateOutcome
  where
    F: FnOnce(&mut V),
    G: FnOnce(&mut V) + Send + 'static,
    Op: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), DataError>> + Send + 'static,
  {
    let identifier = identifier.into();
    let generation;
    let applied;
    {
      let mut st = self.inner.lock_state();
      if !st.pending.insert(identifier.clone()) {
        debug!(?key, identifier, "mutation already pending; ignoring");
        return MutateOutcome::Ignored;
      }
      generation = st.generation;

      let slot = st.slots.entry(key.clone()).or_default();
      slot.pending_writes += 1;
      // An in-flight refresh predates this patch; make sure its late
      // result cannot clobber the optimistic state.
      slot.refresh_seq += 1;
      applied = match slot.entry.as_mut() {
        Some(entry) => {
          forward(Arc::make_mut(&mut entry.value));
          true
        }
        None => false,
      };
    }
    if applied {
      self.inner.notify(key, ChangeKind::MutationApplied);
    }

    let (tx, rx) = oneshot::channel();
    let fut = op();
    let inner = Arc::clone(&self.inner);
    let key = key.clone();
    let refresh_after = self.tuning.refresh_after_mutation;
    tokio::spawn(async move {
      let outcome = match fut.await {
        Ok(()) => {
          inner.commit_mutation(&key, &identifier, generation, refresh_after);
          Ok(())
        }
        Err(error) => {
          inner.rollback_mutation(&key, &identifier, generation, applied, inverse, error.to_string());
          Err(error)
        }
      };
      // Receiver may have been dropped by an event-loop caller.
      let _ = tx.send(outcome);
    });
    MutateOutcome::Started(MutationHandle { rx })
  }

  /// Whether `identifier` has a mutation in flight.
  pub fn is_pending(&self, identifier: &str) -> bool {
    self.inner.lock_state().pending.contains(identifier)
  }

  /// Mark `key` stale without clearing its data. The next read dispatches
  /// a refresh; an in-flight refresh is superseded and its late result
  /// discarded.
  pub fn invalidate(&self, key: &K) {
    {
      let mut st = self.inner.lock_state();
      let Some(slot) = st.slots.get_mut(key) else {
        return;
      };
      slot.forced_stale = true;
      slot.refresh_seq += 1;
    }
    self.inner.notify(key, ChangeKind::Invalidated);
  }

  /// Mark every key matching the predicate stale.
  pub fn invalidate_where(&self, mut pred: impl FnMut(&K) -> bool) {
    let touched: Vec<K> = {
      let mut st = self.inner.lock_state();
      st.slots
        .iter_mut()
        .filter(|(key, _)| pred(key))
        .map(|(key, slot)| {
          slot.forced_stale = true;
          slot.refresh_seq += 1;
          key.clone()
        })
        .collect()
    };
    for key in &touched {
      self.inner.notify(key, ChangeKind::Invalidated);
    }
  }

  /// Remove `key` outright. An in-flight result for it is discarded on
  /// arrival.
  pub fn evict(&self, key: &K) {
    let removed = self.inner.lock_state().slots.remove(key).is_some();
    if removed {
      self.inner.notify(key, ChangeKind::Evicted);
    }
  }

  /// Remove every key matching the predicate.
  pub fn evict_where(&self, mut pred: impl FnMut(&K) -> bool) {
    let removed: Vec<K> = {
      let mut st = self.inner.lock_state();
      let keys: Vec<K> = st.slots.keys().filter(|k| pred(k)).cloned().collect();
      for key in &keys {
        st.slots.remove(key);
      }
      keys
    };
    for key in &removed {
      self.inner.notify(key, ChangeKind::Evicted);
    }
  }

  /// Drop every entry and discard all in-flight work. Sign-out path: the
  /// next identity must never observe the previous identity's data.
  pub fn evict_all(&self) {
    let keys: Vec<K> = {
      let mut st = self.inner.lock_state();
      let keys = st.slots.keys().cloned().collect();
      st.slots.clear();
      st.pending.clear();
      st.generation += 1;
      keys
    };
    for key in &keys {
      self.inner.notify(key, ChangeKind::Evicted);
    }
  }

  /// Drop entries older than `expire_after` as of `now`. Returns how many
  /// entries were dropped.
  pub fn sweep(&self, now: DateTime<Utc>) -> usize {
    let evicted: Vec<K> = {
      let mut st = self.inner.lock_state();
      let expire_after = self.tuning.expire_after;
      let evicted = st
        .slots
        .iter_mut()
        .filter(|(_, slot)| {
          slot
            .entry
            .as_ref()
            .is_some_and(|entry| entry.is_expired(now, expire_after))
        })
        .map(|(key, slot)| {
          slot.entry = None;
          slot.forced_stale = false;
          key.clone()
        })
        .collect();
      st.slots
        .retain(|_, slot| slot.entry.is_some() || slot.in_flight.is_some() || slot.pending_writes > 0);
      evicted
    };
    for key in &evicted {
      self.inner.notify(key, ChangeKind::Evicted);
    }
    if !evicted.is_empty() {
      debug!(count = evicted.len(), "sweep dropped expired entries");
    }
    evicted.len()
  }

  /// Subscribe to change events for `key`. Dropping the subscription
  /// unsubscribes.
  pub fn subscribe(&self, key: &K) -> Subscription<K> {
    self
      .inner
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .subscribe(key.clone())
  }
}

impl<K, V> Sweep for Cache<K, V>
where
  K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  fn sweep(&self, now: DateTime<Utc>) -> usize {
    Cache::sweep(self, now)
  }
}

impl<K, V> CacheInner<K, V>
where
  K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
  V: Clone + Send + Sync + 'static,
{
  fn lock_state(&self) -> MutexGuard<'_, CacheState<K, V>> {
    // A poisoned lock only means a caller-supplied patch closure panicked;
    // the map itself is still coherent.
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn notify(&self, key: &K, kind: ChangeKind) {
    self
      .subscribers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .publish(key, kind);
  }

  fn finish_refresh(&self, key: K, seq: u64, generation: u64, result: Result<V, DataError>) {
    {
      let mut st = self.lock_state();
      if st.generation != generation {
        debug!(?key, "discarding refresh result from a previous identity");
        return;
      }
      let Some(slot) = st.slots.get_mut(&key) else {
        debug!(?key, "discarding refresh result for an evicted key");
        return;
      };
      if slot.in_flight == Some(seq) {
        slot.in_flight = None;
      }
      if slot.refresh_seq != seq {
        debug!(?key, seq, "discarding superseded refresh result");
        return;
      }
      match result {
        Ok(value) => {
          slot.entry = Some(CacheEntry::new(Arc::new(value), self.clock.now()));
          slot.forced_stale = false;
        }
        Err(error) => {
          // Keep the previous value and leave the entry stale so the next
          // read retries. Displayed data is never cleared by a failed
          // refresh.
          warn!(?key, %error, "background refresh failed; serving cached data");
          return;
        }
      }
    }
    self.notify(&key, ChangeKind::Refreshed);
  }

  fn commit_mutation(&self, key: &K, identifier: &str, generation: u64, refresh_after: bool) {
    {
      let mut st = self.lock_state();
      if st.generation != generation {
        debug!(?key, identifier, "mutation finished under a previous identity");
        return;
      }
      st.pending.remove(identifier);
      if let Some(slot) = st.slots.get_mut(key) {
        slot.pending_writes = slot.pending_writes.saturating_sub(1);
        if refresh_after {
          if slot.entry.is_some() {
            slot.forced_stale = true;
          }
          slot.refresh_seq += 1;
        }
      }
    }
    self.notify(key, ChangeKind::MutationCommitted);
  }

  fn rollback_mutation<G: FnOnce(&mut V)>(
    &self,
    key: &K,
    identifier: &str,
    generation: u64,
    applied: bool,
    inverse: G,
    error: String,
  ) {
    {
      let mut st = self.lock_state();
      if st.generation != generation {
        debug!(?key, identifier, "mutation failed under a previous identity; nothing to roll back");
        return;
      }
      st.pending.remove(identifier);
      if let Some(slot) = st.slots.get_mut(key) {
        slot.pending_writes = slot.pending_writes.saturating_sub(1);
        if applied {
          if let Some(entry) = slot.entry.as_mut() {
            inverse(Arc::make_mut(&mut entry.value));
          }
        }
      }
    }
    warn!(?key, identifier, error, "mutation failed; rolled back optimistic patch");
    self.notify(key, ChangeKind::MutationRolledBack { error });
  }
}
