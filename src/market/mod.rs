//! Marketplace domain layer: entity types, the hosted-backend client, and
//! the per-entity cache wiring consumed by the UI surfaces.

mod api_types;
mod client;
mod data;
mod session;
mod types;

pub use client::{MarketBackend, RestBackend};
pub use data::MarketData;
pub use session::Session;
pub use types::{ChatRoom, FavoriteSet, KycStatus, Role, RoleSet, VendorProfile};
