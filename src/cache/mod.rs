//! Generic client-side cache engine.
//!
//! A per-entity-key cache that:
//! - serves stale-while-revalidate reads (old data immediately, refresh in
//!   the background)
//! - applies optimistic mutations with an exact inverse patch for rollback
//! - collapses concurrent work per key and discards superseded results
//! - notifies per-key subscribers so UI surfaces can re-render

mod entry;
mod layer;
mod subscription;
mod sweep;

pub use entry::CacheEntry;
pub use layer::{Cache, CacheTuning, MutateOutcome, MutationHandle, Snapshot};
pub use subscription::{ChangeEvent, ChangeKind, Subscription};
pub use sweep::{spawn_sweeper, Sweep};
