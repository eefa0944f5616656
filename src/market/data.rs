//! Application-root composition of the per-entity caches.
//!
//! [`MarketData`] owns the session, one cache per entity (favorites,
//! chat-room lists, profile, roles), and the invalidation hooks other
//! surfaces call after related writes. UI surfaces hold it behind an
//! `Arc` and render the `Snapshot`s it returns; there are no hidden
//! singletons, so tests build their own instance with a fake backend and
//! a manual clock.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::info;

use super::client::{MarketBackend, RestBackend};
use super::session::Session;
use super::types::{ChatRoom, FavoriteSet, RoleSet, VendorProfile};
use crate::cache::{spawn_sweeper, Cache, CacheTuning, MutateOutcome, Snapshot, Subscription, Sweep};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::DataError;

/// Client data layer for the marketplace app.
pub struct MarketData {
  backend: Arc<dyn MarketBackend>,
  clock: Arc<dyn Clock>,
  session: Mutex<Option<Session>>,
  favorites: Cache<String, FavoriteSet>,
  chat_rooms: Cache<String, Vec<ChatRoom>>,
  profile: Cache<String, VendorProfile>,
  roles: Cache<String, RoleSet>,
}

impl MarketData {
  /// Wire the per-entity caches over the given backend capabilities.
  pub fn new(backend: Arc<dyn MarketBackend>, clock: Arc<dyn Clock>, tuning: CacheTuning) -> Self {
    let favorites = {
      let backend = Arc::clone(&backend);
      Cache::new(Arc::clone(&clock), move |owner: String| {
        backend.fetch_favorites(&owner)
      })
      .with_tuning(tuning)
    };
    let chat_rooms = {
      let backend = Arc::clone(&backend);
      Cache::new(Arc::clone(&clock), move |owner: String| {
        backend.fetch_chat_rooms(&owner)
      })
      .with_tuning(tuning)
    };
    let profile = {
      let backend = Arc::clone(&backend);
      Cache::new(Arc::clone(&clock), move |owner: String| {
        backend.fetch_profile(&owner)
      })
      .with_tuning(tuning)
    };
    let roles = {
      let backend = Arc::clone(&backend);
      Cache::new(Arc::clone(&clock), move |owner: String| {
        backend.fetch_roles(&owner)
      })
      .with_tuning(tuning)
    };

    Self {
      backend,
      clock,
      session: Mutex::new(None),
      favorites,
      chat_rooms,
      profile,
      roles,
    }
  }

  /// Composition-root constructor over the REST backend and wall clock.
  pub fn from_config(config: &Config) -> Result<Arc<Self>, DataError> {
    let backend = Arc::new(RestBackend::new(&config.backend)?);
    Ok(Arc::new(Self::new(
      backend,
      Arc::new(SystemClock),
      config.cache.tuning(),
    )))
  }

  fn owner(&self) -> Result<String, DataError> {
    self
      .session
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .as_ref()
      .map(|s| s.owner_id.clone())
      .ok_or(DataError::LoginRequired)
  }

  /// The signed-in session, if any.
  pub fn session(&self) -> Option<Session> {
    self
      .session
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Install a signed-in session. Cached data belonging to a different
  /// previous identity is evicted outright, never served across owners.
  pub fn sign_in(&self, session: Session) {
    let changed = {
      let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
      let changed = guard
        .as_ref()
        .map(|current| current.owner_id != session.owner_id)
        .unwrap_or(true);
      self.backend.set_bearer(Some(session.access_token.clone()));
      *guard = Some(session);
      changed
    };
    if changed {
      info!("identity changed; evicting owner-scoped cache entries");
      self.evict_all();
    }
  }

  /// Clear the session and every owner-scoped cache entry.
  pub fn sign_out(&self) {
    {
      let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
      *guard = None;
    }
    self.backend.set_bearer(None);
    self.evict_all();
  }

  fn evict_all(&self) {
    self.favorites.evict_all();
    self.chat_rooms.evict_all();
    self.profile.evict_all();
    self.roles.evict_all();
  }

  /// Favorites of the signed-in user, stale-while-revalidate.
  pub fn favorites(&self) -> Result<Snapshot<FavoriteSet>, DataError> {
    let owner = self.owner()?;
    Ok(self.favorites.get(&owner))
  }

  /// Toggle a favorite optimistically.
  ///
  /// The set updates before the network round trip; a failed write rolls
  /// the set back exactly and surfaces the error. A toggle for a listing
  /// that is already pending is ignored.
  pub fn toggle_favorite(&self, listing_id: &str) -> Result<MutateOutcome, DataError> {
    let owner = self.owner()?;
    let snapshot = self.favorites.get(&owner);
    let currently = snapshot
      .data
      .as_deref()
      .map(|set| set.contains(listing_id))
      .unwrap_or(false);

    let backend = Arc::clone(&self.backend);
    let op_owner = owner.clone();
    let op_listing = listing_id.to_string();
    let fwd_id = listing_id.to_string();
    let inv_id = listing_id.to_string();

    let outcome = if currently {
      self.favorites.mutate(
        &owner,
        listing_id,
        move |set| {
          set.remove(&fwd_id);
        },
        move |set| {
          set.insert(inv_id);
        },
        move || backend.remove_favorite(&op_owner, &op_listing),
      )
    } else {
      self.favorites.mutate(
        &owner,
        listing_id,
        move |set| {
          set.insert(fwd_id);
        },
        move |set| {
          set.remove(&inv_id);
        },
        move || backend.add_favorite(&op_owner, &op_listing),
      )
    };
    Ok(outcome)
  }

  /// Whether a favorite toggle for this listing is still in flight.
  pub fn is_favorite_pending(&self, listing_id: &str) -> bool {
    self.favorites.is_pending(listing_id)
  }

  pub fn subscribe_favorites(&self) -> Result<Subscription<String>, DataError> {
    let owner = self.owner()?;
    Ok(self.favorites.subscribe(&owner))
  }

  /// Chat rooms the signed-in user participates in, newest first.
  pub fn chat_rooms(&self) -> Result<Snapshot<Vec<ChatRoom>>, DataError> {
    let owner = self.owner()?;
    Ok(self.chat_rooms.get(&owner))
  }

  /// Invalidation hook for the messaging surface: a sent message should
  /// refresh the room list on its next read, without clearing it.
  pub fn touch_chat_rooms(&self) {
    if let Ok(owner) = self.owner() {
      self.chat_rooms.invalidate(&owner);
    }
  }

  pub fn subscribe_chat_rooms(&self) -> Result<Subscription<String>, DataError> {
    let owner = self.owner()?;
    Ok(self.chat_rooms.subscribe(&owner))
  }

  /// Profile of the signed-in user.
  pub fn profile(&self) -> Result<Snapshot<VendorProfile>, DataError> {
    let owner = self.owner()?;
    Ok(self.profile.get(&owner))
  }

  /// Roles of the signed-in user.
  pub fn roles(&self) -> Result<Snapshot<RoleSet>, DataError> {
    let owner = self.owner()?;
    Ok(self.roles.get(&owner))
  }

  /// Invalidation hook for the onboarding/KYC surface. Approval can grant
  /// the vendor role, so roles are refreshed along with the profile.
  pub fn touch_profile(&self) {
    if let Ok(owner) = self.owner() {
      self.profile.invalidate(&owner);
      self.roles.invalidate(&owner);
    }
  }

  /// Drop expired entries across every cache as of `now`.
  pub fn sweep(&self, now: DateTime<Utc>) -> usize {
    self.favorites.sweep(now)
      + self.chat_rooms.sweep(now)
      + self.profile.sweep(now)
      + self.roles.sweep(now)
  }

  /// Start the app-level periodic sweep. One owned scheduler per app.
  pub fn spawn_sweeper(self: Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
    let clock = Arc::clone(&self.clock);
    spawn_sweeper(self, clock, every)
  }
}

impl Sweep for MarketData {
  fn sweep(&self, now: DateTime<Utc>) -> usize {
    MarketData::sweep(self, now)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::ChangeKind;
  use crate::clock::ManualClock;
  use crate::error::BackendError;
  use chrono::TimeZone;
  use futures::future::BoxFuture;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
  use std::time::Duration;
  use tokio::time::timeout;

  /// In-memory backend: per-owner fixtures, call counters, and a switch
  /// that makes favorite writes fail.
  #[derive(Default)]
  struct FakeBackend {
    favorites: Mutex<HashMap<String, FavoriteSet>>,
    rooms: Mutex<HashMap<String, Vec<ChatRoom>>>,
    fetch_calls: AtomicU32,
    write_calls: AtomicU32,
    fail_writes: AtomicBool,
    bearer: Mutex<Option<String>>,
  }

  impl FakeBackend {
    fn with_favorites(owner: &str, set: FavoriteSet) -> Arc<Self> {
      let backend = Self::default();
      backend
        .favorites
        .lock()
        .unwrap()
        .insert(owner.to_string(), set);
      Arc::new(backend)
    }

    fn write_result(&self) -> Result<(), DataError> {
      if self.fail_writes.load(Ordering::SeqCst) {
        Err(
          BackendError::Status {
            status: 500,
            body: "write failed".into(),
          }
          .into(),
        )
      } else {
        Ok(())
      }
    }
  }

  impl MarketBackend for FakeBackend {
    fn set_bearer(&self, token: Option<String>) {
      *self.bearer.lock().unwrap() = token;
    }

    fn fetch_favorites(&self, owner_id: &str) -> BoxFuture<'static, Result<FavoriteSet, DataError>> {
      self.fetch_calls.fetch_add(1, Ordering::SeqCst);
      let set = self
        .favorites
        .lock()
        .unwrap()
        .get(owner_id)
        .cloned()
        .unwrap_or_default();
      Box::pin(async move { Ok(set) })
    }

    fn add_favorite(
      &self,
      _owner_id: &str,
      _listing_id: &str,
    ) -> BoxFuture<'static, Result<(), DataError>> {
      self.write_calls.fetch_add(1, Ordering::SeqCst);
      let result = self.write_result();
      Box::pin(async move { result })
    }

    fn remove_favorite(
      &self,
      _owner_id: &str,
      _listing_id: &str,
    ) -> BoxFuture<'static, Result<(), DataError>> {
      self.write_calls.fetch_add(1, Ordering::SeqCst);
      let result = self.write_result();
      Box::pin(async move { result })
    }

    fn fetch_chat_rooms(
      &self,
      owner_id: &str,
    ) -> BoxFuture<'static, Result<Vec<ChatRoom>, DataError>> {
      let rooms = self
        .rooms
        .lock()
        .unwrap()
        .get(owner_id)
        .cloned()
        .unwrap_or_default();
      Box::pin(async move { Ok(rooms) })
    }

    fn fetch_profile(
      &self,
      owner_id: &str,
    ) -> BoxFuture<'static, Result<VendorProfile, DataError>> {
      let profile = VendorProfile {
        id: owner_id.to_string(),
        display_name: "Test User".to_string(),
        company: None,
        kyc_status: crate::market::KycStatus::NotStarted,
      };
      Box::pin(async move { Ok(profile) })
    }

    fn fetch_roles(&self, _owner_id: &str) -> BoxFuture<'static, Result<RoleSet, DataError>> {
      Box::pin(async move { Ok(RoleSet::default()) })
    }
  }

  fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_at(
      Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ))
  }

  fn market_data(backend: Arc<FakeBackend>) -> MarketData {
    MarketData::new(backend, manual_clock(), CacheTuning::default())
  }

  async fn wait_for(sub: &mut Subscription<String>, want: ChangeKind) {
    timeout(Duration::from_secs(1), async {
      loop {
        let event = sub.next().await.expect("subscription closed");
        if event.kind == want {
          break;
        }
      }
    })
    .await
    .expect("timed out waiting for cache event");
  }

  #[tokio::test]
  async fn owner_scoped_reads_require_login() {
    let data = market_data(Arc::new(FakeBackend::default()));
    assert!(matches!(data.favorites(), Err(DataError::LoginRequired)));
    assert!(matches!(
      data.toggle_favorite("p1"),
      Err(DataError::LoginRequired)
    ));
  }

  #[tokio::test]
  async fn failed_toggle_restores_favorites_and_surfaces_the_error() {
    let backend = FakeBackend::with_favorites("user-a", FavoriteSet::default());
    backend.fail_writes.store(true, Ordering::SeqCst);
    let data = market_data(Arc::clone(&backend));
    data.sign_in(Session::new("user-a", "jwt-a"));

    let mut sub = data.subscribe_favorites().unwrap();
    data.favorites().unwrap();
    wait_for(&mut sub, ChangeKind::Refreshed).await;

    let outcome = data.toggle_favorite("p1").unwrap();
    // The write task has not been polled yet on this runtime, so the
    // optimistic state and the pending flag are observable immediately.
    assert!(data.is_favorite_pending("p1"));
    assert!(data.favorites().unwrap().data.unwrap().contains("p1"));
    let handle = match outcome {
      MutateOutcome::Started(handle) => handle,
      MutateOutcome::Ignored => panic!("toggle was ignored"),
    };
    let err = handle.finished().await.unwrap_err();
    assert!(matches!(err, DataError::Backend(_)));

    let snap = data.favorites().unwrap();
    assert!(!snap.data.unwrap().contains("p1"));
    assert!(!data.is_favorite_pending("p1"));
  }

  #[tokio::test]
  async fn successful_toggle_keeps_forward_state() {
    let backend = FakeBackend::with_favorites("user-a", FavoriteSet::default());
    let data = market_data(Arc::clone(&backend));
    data.sign_in(Session::new("user-a", "jwt-a"));

    let mut sub = data.subscribe_favorites().unwrap();
    data.favorites().unwrap();
    wait_for(&mut sub, ChangeKind::Refreshed).await;

    let outcome = data.toggle_favorite("p1").unwrap();
    let handle = match outcome {
      MutateOutcome::Started(handle) => handle,
      MutateOutcome::Ignored => panic!("toggle was ignored"),
    };
    handle.finished().await.unwrap();

    let snap = data.favorites().unwrap();
    assert!(snap.data.unwrap().contains("p1"));
    assert_eq!(backend.write_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn identity_change_never_serves_the_previous_owner() {
    let backend =
      FakeBackend::with_favorites("user-a", FavoriteSet::from_ids(["p1".to_string()]));
    let data = market_data(Arc::clone(&backend));

    data.sign_in(Session::new("user-a", "jwt-a"));
    let mut sub = data.subscribe_favorites().unwrap();
    data.favorites().unwrap();
    wait_for(&mut sub, ChangeKind::Refreshed).await;
    assert!(data.favorites().unwrap().data.unwrap().contains("p1"));

    data.sign_out();
    data.sign_in(Session::new("user-b", "jwt-b"));

    // User B's first read must not show user A's favorites, not even as
    // stale data while B's fetch runs.
    let snap = data.favorites().unwrap();
    assert!(snap.data.is_none());

    let mut sub_b = data.subscribe_favorites().unwrap();
    wait_for(&mut sub_b, ChangeKind::Refreshed).await;
    assert!(!data.favorites().unwrap().data.unwrap().contains("p1"));
  }

  #[tokio::test]
  async fn touch_chat_rooms_marks_the_list_stale_without_clearing_it() {
    let backend = Arc::new(FakeBackend::default());
    backend.rooms.lock().unwrap().insert(
      "user-a".to_string(),
      vec![ChatRoom {
        id: "r1".into(),
        listing_id: "l1".into(),
        buyer_id: "user-a".into(),
        seller_id: "seller".into(),
        last_message: Some("hello".into()),
        updated_at: Utc.with_ymd_and_hms(2024, 6, 1, 11, 0, 0).unwrap(),
      }],
    );
    let data = market_data(Arc::clone(&backend));
    data.sign_in(Session::new("user-a", "jwt-a"));

    let mut sub = data.subscribe_chat_rooms().unwrap();
    data.chat_rooms().unwrap();
    wait_for(&mut sub, ChangeKind::Refreshed).await;

    data.touch_chat_rooms();
    let snap = data.chat_rooms().unwrap();
    assert_eq!(snap.data.as_deref().map(Vec::len), Some(1));
    assert!(snap.is_stale);
  }

  #[tokio::test]
  async fn sign_in_installs_the_bearer_token() {
    let backend = Arc::new(FakeBackend::default());
    let data = market_data(Arc::clone(&backend));

    data.sign_in(Session::new("user-a", "jwt-a"));
    assert_eq!(backend.bearer.lock().unwrap().as_deref(), Some("jwt-a"));

    data.sign_out();
    assert!(backend.bearer.lock().unwrap().is_none());
  }
}
