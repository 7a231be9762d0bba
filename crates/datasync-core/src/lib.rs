//! Client-side data synchronization core.
//!
//! Two independent components:
//! - [`cache::CacheStore`]: keyed TTL cache with coalesced stale-while-revalidate
//!   fetching and per-key subscriptions
//! - [`connectivity::ConnectivityMonitor`]: network/backend health tracking with
//!   an adaptive polling loop
//!
//! Both are explicit service objects: construct them at startup, share clones
//! with consumers, and tear them down with `dispose()`/`reset()` on sign-out.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod services;

pub use cache::{CachePolicy, CacheStore, Fetched, RevalidationFailure, Subscription};
pub use config::SyncConfig;
pub use connectivity::{BackendStatus, ConnectivityMonitor, ConnectivityState, RuntimeSignal};
pub use error::CacheError;
pub use services::SyncServices;
