use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the cache store.
///
/// Cloneable so a single failed fetch can be handed to every caller that was
/// coalesced onto it.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Fetch failed for {key}: {reason:#}")]
    Fetch {
        key: String,
        reason: Arc<anyhow::Error>,
    },

    #[error("Fetch task for {key} was aborted")]
    Aborted { key: String },

    #[error("Cache was cleared while fetching {key}")]
    Cleared { key: String },
}

impl CacheError {
    pub(crate) fn fetch(key: &str, reason: anyhow::Error) -> Self {
        CacheError::Fetch {
            key: key.to_string(),
            reason: Arc::new(reason),
        }
    }

    /// Key of the fetch this error belongs to.
    pub fn key(&self) -> &str {
        match self {
            CacheError::Fetch { key, .. }
            | CacheError::Aborted { key }
            | CacheError::Cleared { key } => key,
        }
    }
}
