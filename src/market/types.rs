//! Domain types for the marketplace client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The set of listings the signed-in user has favorited.
///
/// Mutations on this set are exact complements (insert/remove of one
/// listing id), which is what lets optimistic rollback restore the prior
/// state bit-for-bit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteSet {
  ids: BTreeSet<String>,
}

impl FavoriteSet {
  pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
    Self {
      ids: ids.into_iter().collect(),
    }
  }

  pub fn contains(&self, listing_id: &str) -> bool {
    self.ids.contains(listing_id)
  }

  pub fn insert(&mut self, listing_id: String) -> bool {
    self.ids.insert(listing_id)
  }

  pub fn remove(&mut self, listing_id: &str) -> bool {
    self.ids.remove(listing_id)
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.ids.iter().map(String::as_str)
  }
}

/// A chat room between a buyer and a seller about one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRoom {
  pub id: String,
  pub listing_id: String,
  pub buyer_id: String,
  pub seller_id: String,
  pub last_message: Option<String>,
  pub updated_at: DateTime<Utc>,
}

impl ChatRoom {
  /// The other participant from `viewer`'s perspective.
  pub fn counterpart(&self, viewer: &str) -> &str {
    if self.buyer_id == viewer {
      &self.seller_id
    } else {
      &self.buyer_id
    }
  }
}

/// Vendor onboarding state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
  NotStarted,
  Pending,
  Approved,
  Rejected,
}

/// Profile of the signed-in user, including vendor fields when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorProfile {
  pub id: String,
  pub display_name: String,
  pub company: Option<String>,
  pub kyc_status: KycStatus,
}

impl VendorProfile {
  /// Whether the user may publish listings as a vendor.
  pub fn can_sell(&self) -> bool {
    self.kyc_status == KycStatus::Approved
  }
}

/// Access roles a user can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
  Buyer,
  Vendor,
  Admin,
  CustomerService,
}

/// The roles held by the signed-in user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
  roles: BTreeSet<Role>,
}

impl RoleSet {
  pub fn from_roles(roles: impl IntoIterator<Item = Role>) -> Self {
    Self {
      roles: roles.into_iter().collect(),
    }
  }

  pub fn has(&self, role: Role) -> bool {
    self.roles.contains(&role)
  }

  /// Admin and customer-service users see the back office.
  pub fn can_access_back_office(&self) -> bool {
    self.has(Role::Admin) || self.has(Role::CustomerService)
  }
}
