//! Wire shapes for the hosted backend's table REST endpoints.
//!
//! Rows deserialize into these structs and convert into the domain types
//! in [`super::types`]; nullable columns get their defaults here so the
//! rest of the crate never sees them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{ChatRoom, KycStatus, Role, VendorProfile};

/// Row of the `favorites` table, projected to the listing id.
#[derive(Debug, Deserialize)]
pub struct FavoriteRow {
  pub listing_id: String,
}

/// Insert body for the `favorites` table.
#[derive(Debug, Serialize)]
pub struct NewFavorite<'a> {
  pub owner_id: &'a str,
  pub listing_id: &'a str,
}

/// Row of the `chat_rooms` table.
#[derive(Debug, Deserialize)]
pub struct ChatRoomRow {
  pub id: String,
  pub listing_id: String,
  pub buyer_id: String,
  pub seller_id: String,
  pub last_message: Option<String>,
  pub updated_at: DateTime<Utc>,
}

impl ChatRoomRow {
  pub fn into_room(self) -> ChatRoom {
    ChatRoom {
      id: self.id,
      listing_id: self.listing_id,
      buyer_id: self.buyer_id,
      seller_id: self.seller_id,
      last_message: self.last_message,
      updated_at: self.updated_at,
    }
  }
}

/// Row of the `profiles` table.
#[derive(Debug, Deserialize)]
pub struct ProfileRow {
  pub id: String,
  pub display_name: Option<String>,
  pub company: Option<String>,
  pub kyc_status: Option<KycStatus>,
}

impl ProfileRow {
  pub fn into_profile(self) -> VendorProfile {
    VendorProfile {
      id: self.id,
      display_name: self.display_name.unwrap_or_default(),
      company: self.company,
      kyc_status: self.kyc_status.unwrap_or(KycStatus::NotStarted),
    }
  }
}

/// Row of the `user_roles` table, projected to the role.
#[derive(Debug, Deserialize)]
pub struct RoleRow {
  pub role: Role,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn profile_row_defaults_missing_vendor_fields() {
    let row: ProfileRow = serde_json::from_str(r#"{"id": "u1"}"#).unwrap();
    let profile = row.into_profile();
    assert_eq!(profile.display_name, "");
    assert_eq!(profile.kyc_status, KycStatus::NotStarted);
    assert!(profile.company.is_none());
  }

  #[test]
  fn role_rows_use_snake_case() {
    let row: RoleRow = serde_json::from_str(r#"{"role": "customer_service"}"#).unwrap();
    assert_eq!(row.role, Role::CustomerService);
  }
}
