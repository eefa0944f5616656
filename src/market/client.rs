//! Hosted-backend client for the marketplace tables.
//!
//! The backend exposes its relational tables over REST with row-level
//! security; reads and writes are plain filtered table requests carrying
//! the public API key plus the signed-in user's bearer token. The
//! [`MarketBackend`] trait is the capability seam the cache layer is wired
//! with, so tests substitute fakes without any HTTP.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::sync::{Arc, PoisonError, RwLock};
use url::Url;

use super::api_types::{ChatRoomRow, FavoriteRow, NewFavorite, ProfileRow, RoleRow};
use super::types::{ChatRoom, FavoriteSet, RoleSet, VendorProfile};
use crate::config::BackendConfig;
use crate::error::{BackendError, DataError};

/// Rows fetched per page when listing chat rooms.
const PAGE_SIZE: usize = 50;

/// Capability pair the cache layer is parameterized with, per entity.
///
/// Fetches pull authoritative collections for one owner; the favorite
/// writes are the remote halves of optimistic mutations.
pub trait MarketBackend: Send + Sync {
  /// Install or clear the bearer token used for row-level-secured requests.
  fn set_bearer(&self, token: Option<String>);

  fn fetch_favorites(&self, owner_id: &str) -> BoxFuture<'static, Result<FavoriteSet, DataError>>;
  fn add_favorite(
    &self,
    owner_id: &str,
    listing_id: &str,
  ) -> BoxFuture<'static, Result<(), DataError>>;
  fn remove_favorite(
    &self,
    owner_id: &str,
    listing_id: &str,
  ) -> BoxFuture<'static, Result<(), DataError>>;

  fn fetch_chat_rooms(&self, owner_id: &str) -> BoxFuture<'static, Result<Vec<ChatRoom>, DataError>>;
  fn fetch_profile(&self, owner_id: &str) -> BoxFuture<'static, Result<VendorProfile, DataError>>;
  fn fetch_roles(&self, owner_id: &str) -> BoxFuture<'static, Result<RoleSet, DataError>>;
}

/// REST implementation of [`MarketBackend`].
#[derive(Clone)]
pub struct RestBackend {
  http: reqwest::Client,
  /// Base URL without a trailing slash.
  base: String,
  anon_key: String,
  bearer: Arc<RwLock<Option<String>>>,
}

impl RestBackend {
  pub fn new(config: &BackendConfig) -> Result<Self, DataError> {
    // Validate the configured URL up front; requests then build on the
    // normalized string form.
    let parsed = Url::parse(&config.url).map_err(BackendError::BadUrl)?;
    let base = parsed.as_str().trim_end_matches('/').to_string();

    let http = reqwest::Client::builder()
      .build()
      .map_err(BackendError::Transport)?;

    Ok(Self {
      http,
      base,
      anon_key: config.anon_key.clone(),
      bearer: Arc::new(RwLock::new(None)),
    })
  }

  fn token(&self) -> String {
    self
      .bearer
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
      .unwrap_or_else(|| self.anon_key.clone())
  }

  fn table_url(&self, path_and_query: &str) -> String {
    format!("{}/rest/v1/{}", self.base, path_and_query)
  }

  async fn get_rows<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<Vec<T>, DataError> {
    let response = self
      .http
      .get(self.table_url(path_and_query))
      .header("apikey", self.anon_key.as_str())
      .bearer_auth(self.token())
      .send()
      .await
      .map_err(BackendError::Transport)?;

    let response = check_status(response).await?;
    let bytes = response.bytes().await.map_err(BackendError::Transport)?;
    let rows = serde_json::from_slice(&bytes).map_err(BackendError::Decode)?;
    Ok(rows)
  }

  async fn get_favorites(&self, owner: &str) -> Result<FavoriteSet, DataError> {
    let rows: Vec<FavoriteRow> = self
      .get_rows(&format!("favorites?owner_id=eq.{owner}&select=listing_id"))
      .await?;
    Ok(FavoriteSet::from_ids(rows.into_iter().map(|r| r.listing_id)))
  }

  async fn insert_favorite(&self, owner: &str, listing: &str) -> Result<(), DataError> {
    let response = self
      .http
      .post(self.table_url("favorites"))
      .header("apikey", self.anon_key.as_str())
      .header("Prefer", "return=minimal")
      .bearer_auth(self.token())
      .json(&NewFavorite {
        owner_id: owner,
        listing_id: listing,
      })
      .send()
      .await
      .map_err(BackendError::Transport)?;

    // A conflict means the row already exists; replaying an add is not an
    // error for an idempotent-intent toggle.
    if response.status().as_u16() == 409 {
      return Ok(());
    }
    check_status(response).await?;
    Ok(())
  }

  async fn delete_favorite(&self, owner: &str, listing: &str) -> Result<(), DataError> {
    let response = self
      .http
      .delete(self.table_url(&format!(
        "favorites?owner_id=eq.{owner}&listing_id=eq.{listing}"
      )))
      .header("apikey", self.anon_key.as_str())
      .header("Prefer", "return=minimal")
      .bearer_auth(self.token())
      .send()
      .await
      .map_err(BackendError::Transport)?;

    check_status(response).await?;
    Ok(())
  }

  async fn get_chat_rooms(&self, owner: &str) -> Result<Vec<ChatRoom>, DataError> {
    let mut rooms = Vec::new();
    let mut offset = 0usize;

    loop {
      let query = chat_rooms_query(owner, PAGE_SIZE, offset);
      let rows: Vec<ChatRoomRow> = self.get_rows(&query).await?;
      let count = rows.len();
      rooms.extend(rows.into_iter().map(ChatRoomRow::into_room));

      if count < PAGE_SIZE {
        break;
      }
      offset += PAGE_SIZE;
    }

    Ok(rooms)
  }

  async fn get_profile(&self, owner: &str) -> Result<VendorProfile, DataError> {
    let rows: Vec<ProfileRow> = self
      .get_rows(&format!("profiles?id=eq.{owner}&limit=1"))
      .await?;
    let row = rows
      .into_iter()
      .next()
      .ok_or(BackendError::MissingRow("profiles"))?;
    Ok(row.into_profile())
  }

  async fn get_roles(&self, owner: &str) -> Result<RoleSet, DataError> {
    let rows: Vec<RoleRow> = self
      .get_rows(&format!("user_roles?user_id=eq.{owner}&select=role"))
      .await?;
    Ok(RoleSet::from_roles(rows.into_iter().map(|r| r.role)))
  }
}

/// Filtered, ordered, paged chat-room listing for one participant.
fn chat_rooms_query(owner: &str, limit: usize, offset: usize) -> String {
  format!(
    "chat_rooms?or=(buyer_id.eq.{owner},seller_id.eq.{owner})&order=updated_at.desc&limit={limit}&offset={offset}"
  )
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DataError> {
  if response.status().is_success() {
    return Ok(response);
  }
  let status = response.status().as_u16();
  let body = response.text().await.unwrap_or_default();
  Err(BackendError::Status { status, body }.into())
}

impl MarketBackend for RestBackend {
  fn set_bearer(&self, token: Option<String>) {
    *self.bearer.write().unwrap_or_else(PoisonError::into_inner) = token;
  }

  fn fetch_favorites(&self, owner_id: &str) -> BoxFuture<'static, Result<FavoriteSet, DataError>> {
    let this = self.clone();
    let owner = owner_id.to_string();
    Box::pin(async move { this.get_favorites(&owner).await })
  }

  fn add_favorite(
    &self,
    owner_id: &str,
    listing_id: &str,
  ) -> BoxFuture<'static, Result<(), DataError>> {
    let this = self.clone();
    let owner = owner_id.to_string();
    let listing = listing_id.to_string();
    Box::pin(async move { this.insert_favorite(&owner, &listing).await })
  }

  fn remove_favorite(
    &self,
    owner_id: &str,
    listing_id: &str,
  ) -> BoxFuture<'static, Result<(), DataError>> {
    let this = self.clone();
    let owner = owner_id.to_string();
    let listing = listing_id.to_string();
    Box::pin(async move { this.delete_favorite(&owner, &listing).await })
  }

  fn fetch_chat_rooms(&self, owner_id: &str) -> BoxFuture<'static, Result<Vec<ChatRoom>, DataError>> {
    let this = self.clone();
    let owner = owner_id.to_string();
    Box::pin(async move { this.get_chat_rooms(&owner).await })
  }

  fn fetch_profile(&self, owner_id: &str) -> BoxFuture<'static, Result<VendorProfile, DataError>> {
    let this = self.clone();
    let owner = owner_id.to_string();
    Box::pin(async move { this.get_profile(&owner).await })
  }

  fn fetch_roles(&self, owner_id: &str) -> BoxFuture<'static, Result<RoleSet, DataError>> {
    let this = self.clone();
    let owner = owner_id.to_string();
    Box::pin(async move { this.get_roles(&owner).await })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chat_rooms_query_covers_both_sides_of_the_conversation() {
    let query = chat_rooms_query("u1", 50, 100);
    assert_eq!(
      query,
      "chat_rooms?or=(buyer_id.eq.u1,seller_id.eq.u1)&order=updated_at.desc&limit=50&offset=100"
    );
  }

  #[test]
  fn base_url_is_normalized_without_trailing_slash() {
    let backend = RestBackend::new(&BackendConfig {
      url: "https://backend.example.com/".to_string(),
      anon_key: "anon".to_string(),
    })
    .unwrap();
    assert_eq!(
      backend.table_url("favorites?owner_id=eq.u1"),
      "https://backend.example.com/rest/v1/favorites?owner_id=eq.u1"
    );
  }

  #[test]
  fn bearer_falls_back_to_anon_key_when_signed_out() {
    let backend = RestBackend::new(&BackendConfig {
      url: "https://backend.example.com".to_string(),
      anon_key: "anon".to_string(),
    })
    .unwrap();
    assert_eq!(backend.token(), "anon");

    backend.set_bearer(Some("user-jwt".to_string()));
    assert_eq!(backend.token(), "user-jwt");

    backend.set_bearer(None);
    assert_eq!(backend.token(), "anon");
  }
}
