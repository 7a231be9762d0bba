//! Keyed cache with TTL and stale-while-revalidate semantics.
//!
//! The `CacheStore` serves valid entries synchronously, coalesces concurrent
//! fetches of the same key into a single request, and pushes every fresh
//! value to the key's subscribers. Entries can be mirrored into a
//! session-scoped `SessionMirror` for warm starts.

pub mod entry;
pub mod mirror;
pub mod policy;
pub mod store;

pub use entry::{CacheEntry, MAX_LIFETIME};
pub use mirror::{CacheMirror, SessionMirror, DEFAULT_QUOTA_BYTES};
pub use policy::{CachePolicy, RevalidationFailure, DEFAULT_STALE_MS, DEFAULT_TTL_MS};
pub use store::{CacheStore, CacheStoreBuilder, Fetched, Revalidation, Subscription};
