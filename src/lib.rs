//! Client data layer for the Agora marketplace app.
//!
//! Agora's UI surfaces (listings, chat, favorites, vendor onboarding, the
//! back office) are a presentation layer over a hosted backend. This
//! crate is the piece between the two: a per-entity cache that serves
//! stale-while-revalidate reads, applies optimistic mutations with exact
//! rollback, collapses concurrent work per key, and exposes the
//! invalidation hooks surfaces call to force a refresh after related
//! writes.
//!
//! The engine under [`cache`] is entity-agnostic; [`market`]
//! parameterizes it for favorites, chat-room lists, and profile/role
//! data, and owns the identity scoping (signing out evicts every
//! owner-scoped entry, and results arriving for a previous identity are
//! discarded).

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod market;

pub use cache::{
  Cache, CacheTuning, ChangeEvent, ChangeKind, MutateOutcome, MutationHandle, Snapshot,
  Subscription, Sweep,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{BackendError, ConfigError, DataError};
pub use market::{MarketData, Session};
