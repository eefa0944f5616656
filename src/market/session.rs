//! Signed-in identity.

/// The signed-in user as far as the data layer is concerned: the owner
/// scope cached entries belong to, and the token row-level security
/// checks requests against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub owner_id: String,
  pub access_token: String,
}

impl Session {
  pub fn new(owner_id: impl Into<String>, access_token: impl Into<String>) -> Self {
    Self {
      owner_id: owner_id.into(),
      access_token: access_token.into(),
    }
  }
}
