//! Per-key change notification for cache consumers.
//!
//! Consumers subscribe per key and receive change events over an unbounded
//! channel. Dropping the [`Subscription`] unsubscribes; closed receivers
//! are pruned on the next publish for their key.

use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::mpsc;

/// What changed for a subscribed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
  /// A background refresh committed fresh data.
  Refreshed,
  /// An optimistic patch was applied locally; the remote write is in flight.
  MutationApplied,
  /// The remote write succeeded; the optimistic state stands.
  MutationCommitted,
  /// The remote write failed; the prior state was restored.
  MutationRolledBack { error: String },
  /// The key was marked stale without clearing its data.
  Invalidated,
  /// The key's data was dropped.
  Evicted,
}

/// A change event for one key.
#[derive(Debug, Clone)]
pub struct ChangeEvent<K> {
  pub key: K,
  pub kind: ChangeKind,
}

/// Receiving half of a per-key subscription.
pub struct Subscription<K> {
  rx: mpsc::UnboundedReceiver<ChangeEvent<K>>,
}

impl<K> Subscription<K> {
  /// Wait for the next change event. Returns `None` once the cache is gone.
  pub async fn next(&mut self) -> Option<ChangeEvent<K>> {
    self.rx.recv().await
  }

  /// Non-blocking poll for a change event, for event-loop tick handlers.
  pub fn try_next(&mut self) -> Option<ChangeEvent<K>> {
    self.rx.try_recv().ok()
  }
}

/// Per-key registry of subscriber senders.
pub(crate) struct SubscriberMap<K> {
  senders: HashMap<K, Vec<mpsc::UnboundedSender<ChangeEvent<K>>>>,
}

impl<K: Eq + Hash + Clone> SubscriberMap<K> {
  pub fn new() -> Self {
    Self {
      senders: HashMap::new(),
    }
  }

  pub fn subscribe(&mut self, key: K) -> Subscription<K> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.senders.entry(key).or_default().push(tx);
    Subscription { rx }
  }

  pub fn publish(&mut self, key: &K, kind: ChangeKind) {
    let Some(list) = self.senders.get_mut(key) else {
      return;
    };
    list.retain(|tx| {
      tx.send(ChangeEvent {
        key: key.clone(),
        kind: kind.clone(),
      })
      .is_ok()
    });
    if list.is_empty() {
      self.senders.remove(key);
    }
  }
}
